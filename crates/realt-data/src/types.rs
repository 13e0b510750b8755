//! Record types shared by the ingestion collaborators, the store and the
//! reconciliation engine.
//!
//! Two layers live here:
//! - `Raw*` records mirror what the collaborators hand over (every field
//!   optional, amounts and timestamps still as text).
//! - Validated records ([`Transfer`], [`Invoice`], [`Purchase`], [`Sale`])
//!   are built through constructors that reject malformed input with a
//!   [`SkipReason`], so matching code never sees a half-populated record.

use std::fmt;

use alloy::primitives::Address;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::normalize::normalize;

/// Symbol prefix shared by every RealToken asset.
pub const REALTOKEN_SYMBOL_PREFIX: &str = "REALTOKEN-";

/// Asset-name marker identifying a RealToken transfer.
pub const REALTOKEN_NAME_MARKER: &str = "RealToken";

/// Prefix stripped from a RealToken name to recover the property address.
pub const PROPERTY_NAME_PREFIX: &str = "RealToken S ";

/// Stablecoins accepted as payment for p2p purchases and sales.
pub const PAYMENT_SYMBOLS: [&str; 2] = ["USDC", "WXDAI"];

/// Why a record (or a hash group built from records) was left out of matching.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    /// A required field is missing or not parseable as its type.
    MalformedRecord,
    /// An invoice or transfer date does not follow the expected format.
    UnparsableDate,
    /// A price or quantity computation failed (zero divisor, overflow,
    /// non-positive amount).
    ArithmeticFailure,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::MalformedRecord => "malformed record",
            Self::UnparsableDate => "unparsable date",
            Self::ArithmeticFailure => "arithmetic failure",
        };
        f.write_str(label)
    }
}

/// Token transfer as returned by the ledger-indexing API (`tokentx`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTransfer {
    pub block_number: Option<String>,
    /// Unix seconds, as decimal text.
    pub time_stamp: Option<String>,
    pub hash: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    /// Raw integer amount in the token's smallest unit.
    pub value: Option<String>,
    pub token_name: Option<String>,
    pub token_symbol: Option<String>,
    /// Position of the transfer's log within its transaction. Two transfers
    /// under one hash can be otherwise identical, so this is what tells them
    /// apart.
    #[serde(default)]
    pub log_index: Option<String>,
}

/// One on-chain token movement, normalized and validated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transfer {
    /// Transaction hash. Shared by every transfer of one atomic operation.
    pub hash: String,
    pub from: Address,
    pub to: Address,
    pub asset_symbol: String,
    /// Empty when the ledger did not report a name; such transfers never
    /// satisfy name-based filters.
    pub asset_name: String,
    pub raw_amount: String,
    pub decimal_amount: Decimal,
    pub timestamp: DateTime<Utc>,
    pub block_number: Option<u64>,
}

impl Transfer {
    /// Validates a ledger record.
    ///
    /// `hash`, `from`, `to`, `tokenSymbol` and `timeStamp` are required. A
    /// missing `value` normalizes to zero and a missing `tokenName` leaves the
    /// transfer non-matchable rather than rejected.
    pub fn from_raw(raw: &RawTransfer) -> Result<Self, SkipReason> {
        let hash = required(raw.hash.as_deref())?;
        let from = parse_address(raw.from.as_deref())?;
        let to = parse_address(raw.to.as_deref())?;
        let asset_symbol = required(raw.token_symbol.as_deref())?;

        let seconds = required(raw.time_stamp.as_deref())?
            .parse::<i64>()
            .map_err(|_| SkipReason::UnparsableDate)?;
        let timestamp = DateTime::from_timestamp(seconds, 0).ok_or(SkipReason::UnparsableDate)?;

        let raw_amount = raw.value.clone().unwrap_or_default();
        let decimal_amount = normalize(&asset_symbol, raw.value.as_deref())?;

        Ok(Self {
            hash,
            from,
            to,
            asset_name: raw.token_name.clone().unwrap_or_default(),
            raw_amount,
            decimal_amount,
            timestamp,
            block_number: raw
                .block_number
                .as_deref()
                .and_then(|n| n.trim().parse().ok()),
            asset_symbol,
        })
    }

    /// `true` for RealToken assets, judged by symbol.
    pub fn is_realtoken(&self) -> bool {
        self.asset_symbol.starts_with(REALTOKEN_SYMBOL_PREFIX)
    }

    /// `true` when the asset name carries the RealToken marker.
    pub fn has_realtoken_name(&self) -> bool {
        self.asset_name.starts_with(REALTOKEN_NAME_MARKER)
    }

    /// `true` for the stablecoins accepted as payment.
    pub fn is_payment(&self) -> bool {
        PAYMENT_SYMBOLS.contains(&self.asset_symbol.as_str())
    }

    /// Property address derived from the asset name.
    pub fn property_address(&self) -> String {
        property_from_asset_name(&self.asset_name)
    }
}

/// Strips the RealToken name prefix, e.g. `"RealToken S 123 Main St"` ->
/// `"123 Main St"`.
pub fn property_from_asset_name(asset_name: &str) -> String {
    asset_name.replace(PROPERTY_NAME_PREFIX, "")
}

fn required(value: Option<&str>) -> Result<String, SkipReason> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(SkipReason::MalformedRecord),
    }
}

fn parse_address(value: Option<&str>) -> Result<Address, SkipReason> {
    required(value)?
        .parse::<Address>()
        .map_err(|_| SkipReason::MalformedRecord)
}

/// Invoice line item as produced by the document extractor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLineItem {
    pub property_address: Option<String>,
    pub unit_price_usd: Option<Decimal>,
    pub quantity: Option<Decimal>,
}

/// Invoice as produced by the document extractor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawInvoice {
    pub invoice_number: Option<String>,
    /// Calendar date, e.g. `"January 1, 2024"`.
    pub invoice_date: Option<String>,
    pub order_number: Option<String>,
    pub payment_method: Option<String>,
    #[serde(default)]
    pub line_items: Vec<RawLineItem>,
    /// Transfer hashes that satisfied this invoice on the last run.
    #[serde(default)]
    pub linked_hashes: Vec<String>,
}

/// One priced product entry of an [`Invoice`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceLineItem {
    /// Free-text street address; the first comma-separated segment is the
    /// matching key.
    pub property_address: String,
    pub unit_price_usd: Decimal,
    pub quantity: Decimal,
}

impl InvoiceLineItem {
    /// Requires an address and a strictly positive price and quantity.
    pub fn from_raw(raw: &RawLineItem) -> Result<Self, SkipReason> {
        let property_address = required(raw.property_address.as_deref())?;
        let unit_price_usd = raw.unit_price_usd.ok_or(SkipReason::MalformedRecord)?;
        let quantity = raw.quantity.ok_or(SkipReason::MalformedRecord)?;
        if unit_price_usd <= Decimal::ZERO || quantity <= Decimal::ZERO {
            return Err(SkipReason::MalformedRecord);
        }

        Ok(Self {
            property_address,
            unit_price_usd,
            quantity,
        })
    }

    /// First comma-separated segment of the address, trimmed and lowercased.
    pub fn street(&self) -> String {
        self.property_address
            .split(',')
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase()
    }
}

/// A validated invoice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invoice {
    pub invoice_number: String,
    pub invoice_date: NaiveDate,
    pub order_number: Option<String>,
    pub line_items: Vec<InvoiceLineItem>,
    /// Line items dropped by validation.
    pub rejected_line_items: Vec<SkipReason>,
}

impl Invoice {
    /// Validates the invoice header; invalid line items are dropped and
    /// recorded in `rejected_line_items`.
    pub fn from_raw(raw: &RawInvoice) -> Result<Self, SkipReason> {
        let invoice_number = required(raw.invoice_number.as_deref())?;
        let invoice_date = parse_invoice_date(&required(raw.invoice_date.as_deref())?)?;

        let mut line_items = Vec::with_capacity(raw.line_items.len());
        let mut rejected_line_items = Vec::new();
        for item in &raw.line_items {
            match InvoiceLineItem::from_raw(item) {
                Ok(item) => line_items.push(item),
                Err(reason) => rejected_line_items.push(reason),
            }
        }

        Ok(Self {
            invoice_number,
            invoice_date,
            order_number: raw.order_number.clone(),
            line_items,
            rejected_line_items,
        })
    }
}

/// Parses invoice dates in the `"January 1, 2024"` form, falling back to ISO
/// `2024-01-01`.
pub fn parse_invoice_date(value: &str) -> Result<NaiveDate, SkipReason> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%B %d, %Y")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y-%m-%d"))
        .map_err(|_| SkipReason::UnparsableDate)
}

/// How a [`Purchase`] was discovered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseSource {
    /// Matched to an invoice line item.
    Invoice,
    /// Paid in stablecoin within the same transaction, no invoice.
    P2p,
    /// Moved in from the previous wallet.
    Transfer,
}

impl PurchaseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invoice => "invoice",
            Self::P2p => "p2p",
            Self::Transfer => "transfer",
        }
    }
}

impl fmt::Display for PurchaseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transfer that contributed quantity to a purchase.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedTransfer {
    pub hash: String,
    pub quantity: Decimal,
    pub transfer_date: DateTime<Utc>,
}

/// A purchase lot produced by the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Purchase {
    pub source: PurchaseSource,
    pub asset_symbol: String,
    pub asset_name: String,
    pub property_address: String,
    pub quantity: Decimal,
    /// `None` only when the cost basis is unknown.
    pub unit_price_usd: Option<Decimal>,
    pub transaction_hash: String,
    pub transfer_date: DateTime<Utc>,
    pub invoice_number: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    #[serde(default)]
    pub transfers: Vec<LinkedTransfer>,
}

impl Purchase {
    /// Upsert key: the hash alone for p2p and transfer purchases, the hash
    /// plus invoice number for invoice purchases.
    pub fn key(&self) -> String {
        match (self.source, self.invoice_number.as_deref()) {
            (PurchaseSource::Invoice, Some(number)) => {
                format!("{}#{}", self.transaction_hash, number)
            }
            _ => self.transaction_hash.clone(),
        }
    }
}

/// A realized sale with its return on investment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sale {
    pub asset_symbol: String,
    pub asset_name: String,
    pub property_address: String,
    pub sale_hash: String,
    pub purchase_date: DateTime<Utc>,
    pub sale_date: DateTime<Utc>,
    pub buy_price_usd: Decimal,
    pub sell_price_usd: Decimal,
    pub quantity: Decimal,
    pub total_received_usd: Decimal,
    pub payment_currency: String,
    pub roi_percent: Decimal,
    pub is_partial_sale: bool,
}
