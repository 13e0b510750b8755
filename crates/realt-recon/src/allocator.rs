//! Purchase-sale allocation.
//!
//! Every purchase becomes a lot with a working `remaining` quantity. Each
//! sale pair, in the order it was found, is charged in full against a single
//! lot of the same asset; splitting one sale across several lots is not
//! supported and such sales are reported unmatched.
//!
//! Which lot is "first" depends on [`AllocationOrder`]: discovery order is
//! the order purchases were recorded, chronological order sorts lots by
//! transfer date (ties keep discovery order).

use realt_data::{Purchase, Sale, SkipReason};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::config::AllocationOrder;
use crate::report::{SkipCounters, UnmatchedSale, UnmatchedSaleReason};
use crate::sales::SalePairCandidate;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// A purchase with its unsold quantity.
#[derive(Clone, Debug)]
pub struct Lot<'a> {
    pub purchase: &'a Purchase,
    pub remaining: Decimal,
}

#[derive(Clone, Debug, Default)]
pub struct AllocationOutcome {
    pub sales: Vec<Sale>,
    pub unmatched: Vec<UnmatchedSale>,
    pub skipped: SkipCounters,
    /// Remaining quantity of each purchase, indexed like the input slice.
    pub remaining: Vec<Decimal>,
}

/// `(sell - buy) / buy * 100`. A non-positive buy price cannot anchor a
/// percentage.
pub fn roi_percent(buy: Decimal, sell: Decimal) -> Result<Decimal, SkipReason> {
    if buy <= Decimal::ZERO {
        return Err(SkipReason::ArithmeticFailure);
    }
    sell.checked_sub(buy)
        .and_then(|gain| gain.checked_div(buy))
        .and_then(|ratio| ratio.checked_mul(HUNDRED))
        .ok_or(SkipReason::ArithmeticFailure)
}

/// Lot order used for the first-fit search, as indices into `purchases`.
fn lot_order(purchases: &[Purchase], order: AllocationOrder) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..purchases.len()).collect();
    if order == AllocationOrder::Chronological {
        indices.sort_by_key(|&i| purchases[i].transfer_date);
    }
    indices
}

/// Charges each sale pair against the first lot of the same asset holding
/// enough remaining quantity.
#[tracing::instrument(skip_all, fields(purchases = purchases.len(), candidates = candidates.len(), order = ?order))]
pub fn allocate_sales(
    purchases: &[Purchase],
    candidates: &[SalePairCandidate],
    order: AllocationOrder,
) -> AllocationOutcome {
    let mut lots: Vec<Lot<'_>> = purchases
        .iter()
        .map(|purchase| Lot {
            purchase,
            remaining: purchase.quantity,
        })
        .collect();
    let search_order = lot_order(purchases, order);
    let mut outcome = AllocationOutcome::default();

    for candidate in candidates {
        let quantity = candidate.quantity();
        let symbol = &candidate.asset.asset_symbol;

        let Some(index) = search_order.iter().copied().find(|&i| {
            let lot = &lots[i];
            lot.purchase.asset_symbol == *symbol
                && lot.remaining > Decimal::ZERO
                && lot.remaining >= quantity
        }) else {
            debug!(hash = %candidate.hash, %symbol, %quantity, "no lot covers sale");
            outcome.unmatched.push(UnmatchedSale {
                sale_hash: candidate.hash.clone(),
                asset_symbol: symbol.clone(),
                quantity,
                reason: UnmatchedSaleReason::NoLot,
            });
            continue;
        };

        let purchase = lots[index].purchase;
        let Some(buy) = purchase.unit_price_usd else {
            warn!(
                hash = %candidate.hash,
                %symbol,
                lot = %purchase.transaction_hash,
                "matched lot has no price, sale not recorded"
            );
            outcome.unmatched.push(UnmatchedSale {
                sale_hash: candidate.hash.clone(),
                asset_symbol: symbol.clone(),
                quantity,
                reason: UnmatchedSaleReason::UnpricedLot,
            });
            continue;
        };

        let priced = candidate
            .total_received()
            .checked_div(quantity)
            .ok_or(SkipReason::ArithmeticFailure)
            .and_then(|sell| roi_percent(buy, sell).map(|roi| (sell, roi)));
        let (sell, roi) = match priced {
            Ok(priced) => priced,
            Err(reason) => {
                warn!(hash = %candidate.hash, %reason, "skipping sale");
                outcome.skipped.record(reason);
                continue;
            }
        };

        lots[index].remaining -= quantity;

        info!(
            hash = %candidate.hash,
            %symbol,
            %quantity,
            buy = %buy,
            sell = %sell,
            roi = %roi.round_dp(2),
            remaining = %lots[index].remaining,
            "sale allocated"
        );

        outcome.sales.push(Sale {
            asset_symbol: symbol.clone(),
            asset_name: candidate.asset.asset_name.clone(),
            property_address: purchase.property_address.clone(),
            sale_hash: candidate.hash.clone(),
            purchase_date: purchase.transfer_date,
            sale_date: candidate.asset.timestamp,
            buy_price_usd: buy,
            sell_price_usd: sell,
            quantity,
            total_received_usd: candidate.total_received(),
            payment_currency: candidate.payment.asset_symbol.clone(),
            roi_percent: roi,
            is_partial_sale: quantity < purchase.quantity,
        });
    }

    outcome.remaining = lots.iter().map(|lot| lot.remaining).collect();
    outcome
}
