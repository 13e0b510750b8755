//! Sale pair detection.
//!
//! A sale is one transaction in which the wallet sends out a RealToken and
//! receives stablecoin back. Purchases are not consulted here; a token the
//! wallet bought through any channel can later show up as a sale.

use realt_data::Transfer;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::group::group_by_hash;
use crate::p2p::unit_price;
use crate::report::SkipCounters;

/// Outgoing asset and incoming payment sharing one hash.
#[derive(Clone, Debug, PartialEq)]
pub struct SalePairCandidate {
    pub hash: String,
    pub asset: Transfer,
    pub payment: Transfer,
    /// `payment.decimal_amount / asset.decimal_amount`
    pub price_per_unit: Decimal,
}

impl SalePairCandidate {
    pub fn quantity(&self) -> Decimal {
        self.asset.decimal_amount
    }

    pub fn total_received(&self) -> Decimal {
        self.payment.decimal_amount
    }
}

/// Pairs outgoing RealToken transfers with incoming payments, in first-seen
/// hash order.
#[tracing::instrument(skip_all, fields(transfers = transfers.len()))]
pub fn find_sale_pairs(
    config: &EngineConfig,
    transfers: &[Transfer],
    skipped: &mut SkipCounters,
) -> Vec<SalePairCandidate> {
    let wallet = config.wallet;
    let mut pairs = Vec::new();

    for group in group_by_hash(transfers) {
        if group.transfers.len() < 2 {
            continue;
        }

        let asset = group
            .transfers
            .iter()
            .filter(|t| t.from == wallet && t.is_realtoken())
            .last();
        let payment = group
            .transfers
            .iter()
            .filter(|t| t.to == wallet && t.is_payment())
            .last();

        let (Some(asset), Some(payment)) = (asset, payment) else {
            continue;
        };

        match unit_price(payment.decimal_amount, asset.decimal_amount) {
            Ok(price_per_unit) => {
                debug!(
                    hash = group.hash,
                    symbol = %asset.asset_symbol,
                    quantity = %asset.decimal_amount,
                    received = %payment.decimal_amount,
                    %price_per_unit,
                    "sale pair found"
                );
                pairs.push(SalePairCandidate {
                    hash: group.hash.to_string(),
                    asset: (*asset).clone(),
                    payment: (*payment).clone(),
                    price_per_unit,
                });
            }
            Err(reason) => {
                warn!(hash = group.hash, %reason, "skipping sale pair");
                skipped.record(reason);
            }
        }
    }

    pairs
}
