//! realt-recon crate
//!
//! Reconciliation engine: matches invoices and peer-to-peer trades to
//! on-chain RealToken deliveries, pairs sales, and allocates sales against
//! purchase lots to compute ROI.
//!
//! Stages run in a fixed order: [`invoice_matcher`], then [`p2p`] over the
//! transfers left unmatched, then [`sales`] and [`allocator`]. The
//! [`pipeline`] module drives them against a record store.

pub mod allocator;
pub mod config;
pub mod group;
pub mod invoice_matcher;
pub mod p2p;
pub mod pipeline;
pub mod report;
pub mod sales;

pub use config::{AllocationOrder, EngineConfig};
pub use report::{PurchaseReport, SaleReport, SkipCounters};
