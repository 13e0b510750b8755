//! realt-data crate
//!
//! Records, normalization, collaborator adapters and persistence for the
//! RealToken ledger.

pub mod invoices;
pub mod ledger;
pub mod normalize;
pub mod store;
pub mod types;

pub use types::{
    Invoice, InvoiceLineItem, LinkedTransfer, Purchase, PurchaseSource, RawInvoice, RawLineItem,
    RawTransfer, Sale, SkipReason, Transfer,
};
