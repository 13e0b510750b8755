//! Run statistics for purchase matching and sale allocation.
//!
//! Nothing unmatched or skipped is raised as an error; it lands here so a run
//! always finishes with totals.

use chrono::NaiveDate;
use realt_data::SkipReason;
use rust_decimal::Decimal;
use serde::Serialize;

/// Per-reason count of records or hash groups left out of matching.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SkipCounters {
    pub malformed_record: usize,
    pub unparsable_date: usize,
    pub arithmetic_failure: usize,
}

impl SkipCounters {
    pub fn record(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::MalformedRecord => self.malformed_record += 1,
            SkipReason::UnparsableDate => self.unparsable_date += 1,
            SkipReason::ArithmeticFailure => self.arithmetic_failure += 1,
        }
    }

    pub fn merge(&mut self, other: &SkipCounters) {
        self.malformed_record += other.malformed_record;
        self.unparsable_date += other.unparsable_date;
        self.arithmetic_failure += other.arithmetic_failure;
    }

    pub fn total(&self) -> usize {
        self.malformed_record + self.unparsable_date + self.arithmetic_failure
    }
}

/// An invoice line item no transfer could satisfy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmatchedLineItem {
    pub invoice_number: String,
    pub invoice_date: NaiveDate,
    pub property_address: String,
    pub quantity: Decimal,
    pub unit_price_usd: Decimal,
}

/// Totals of one purchase-matching run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseReport {
    /// Invoices that failed header validation.
    pub invoices_skipped: usize,
    pub line_items: usize,
    pub invoice_purchases: usize,
    pub unmatched_line_items: Vec<UnmatchedLineItem>,
    pub p2p_purchases: usize,
    pub transfer_purchases: usize,
    /// Transfer purchases that inherited an invoice price.
    pub transfers_with_invoice: usize,
    /// Purchases whose key repeats an earlier purchase of the same run. Only
    /// the last one survives in the store.
    pub overwritten_purchases: usize,
    pub skipped: SkipCounters,
}

impl PurchaseReport {
    pub fn total_purchases(&self) -> usize {
        self.invoice_purchases + self.p2p_purchases + self.transfer_purchases
    }
}

/// Why a sale pair produced no [`realt_data::Sale`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UnmatchedSaleReason {
    /// No single lot of the asset holds enough remaining quantity.
    NoLot,
    /// The matching lot has no cost basis, so ROI cannot be computed.
    UnpricedLot,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmatchedSale {
    pub sale_hash: String,
    pub asset_symbol: String,
    pub quantity: Decimal,
    pub reason: UnmatchedSaleReason,
}

/// Totals of one sale-allocation run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleReport {
    pub sale_pairs: usize,
    pub sales: usize,
    pub unmatched_sales: Vec<UnmatchedSale>,
    pub skipped: SkipCounters,
    /// Sum of `buyPriceUsd * quantity` over recorded sales.
    pub total_invested_usd: Decimal,
    pub total_received_usd: Decimal,
    /// `None` when nothing was invested.
    pub overall_roi_percent: Option<Decimal>,
}

impl SaleReport {
    pub fn unpriced_sales(&self) -> usize {
        self.unmatched_sales
            .iter()
            .filter(|s| s.reason == UnmatchedSaleReason::UnpricedLot)
            .count()
    }
}
