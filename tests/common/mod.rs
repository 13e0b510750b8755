//! Shared test helpers and utilities.
//!
//! Factory functions for ledger rows, invoices and engine configuration with
//! sensible defaults.

#![allow(dead_code)]

use realt_data::store::Store;
use realt_data::{RawInvoice, RawLineItem, RawTransfer, Transfer};
use realt_recon::EngineConfig;
use rust_decimal::Decimal;

pub const WALLET: &str = "0x00000000000000000000000000000000000000aa";
pub const OLD_WALLET: &str = "0x00000000000000000000000000000000000000cc";
pub const COUNTERPARTY: &str = "0x00000000000000000000000000000000000000bb";

pub const MAIN_ST_SYMBOL: &str = "REALTOKEN-S-123-MAIN-ST";
pub const MAIN_ST_NAME: &str = "RealToken S 123 Main St";
pub const MAIN_ST_ADDRESS: &str = "123 Main St, City, ST 00000";

/// 2024-01-02 10:00:00 UTC
pub const JAN_2_2024_10AM: i64 = 1_704_189_600;

/// Creates an in-memory SQLite Store for integration tests.
///
/// # Panics
/// Panics if the in-memory database cannot be created (should never happen).
pub fn test_store() -> Store {
    Store::new(":memory:").expect("in-memory store should always open")
}

/// Engine configuration for [`WALLET`] with discovery-order allocation.
pub fn test_config() -> EngineConfig {
    EngineConfig::new(Some(WALLET), None).expect("valid wallet")
}

/// Engine configuration that also knows [`OLD_WALLET`].
pub fn migrating_config() -> EngineConfig {
    EngineConfig::new(Some(WALLET), Some(OLD_WALLET)).expect("valid wallets")
}

/// Raw ledger row as the transfer API returns it.
///
/// `value` is the raw integer amount; the token name is derived from the
/// symbol (`MAIN_ST_NAME` for the Main St token, the symbol itself otherwise).
pub fn raw_transfer(
    hash: &str,
    from: &str,
    to: &str,
    symbol: &str,
    value: &str,
    timestamp: i64,
) -> RawTransfer {
    let name = if symbol == MAIN_ST_SYMBOL {
        MAIN_ST_NAME.to_string()
    } else {
        symbol.to_string()
    };
    RawTransfer {
        block_number: Some("31000000".to_string()),
        time_stamp: Some(timestamp.to_string()),
        hash: Some(hash.to_string()),
        from: Some(from.to_string()),
        to: Some(to.to_string()),
        value: Some(value.to_string()),
        token_name: Some(name),
        token_symbol: Some(symbol.to_string()),
        log_index: None,
    }
}

/// [`raw_transfer`] with the ledger's per-transaction log index set.
pub fn with_log_index(row: RawTransfer, log_index: u32) -> RawTransfer {
    RawTransfer {
        log_index: Some(log_index.to_string()),
        ..row
    }
}

/// Raw amount with 18 decimals for a whole or fractional token count.
///
/// # Example
/// ```ignore
/// assert_eq!(wei(dec!(10)), "10000000000000000000");
/// ```
pub fn wei(amount: Decimal) -> String {
    (amount * Decimal::from(1_000_000_000_000_000_000u64))
        .trunc()
        .normalize()
        .to_string()
}

/// Raw USDC amount (6 decimals).
pub fn usdc(amount: Decimal) -> String {
    (amount * Decimal::from(1_000_000u64))
        .trunc()
        .normalize()
        .to_string()
}

/// Validated transfer built from [`raw_transfer`].
pub fn transfer(
    hash: &str,
    from: &str,
    to: &str,
    symbol: &str,
    value: &str,
    timestamp: i64,
) -> Transfer {
    Transfer::from_raw(&raw_transfer(hash, from, to, symbol, value, timestamp))
        .expect("factory transfer should validate")
}

/// Raw invoice with one line item per `(address, unit price, quantity)`.
pub fn raw_invoice(number: &str, date: &str, items: &[(&str, Decimal, Decimal)]) -> RawInvoice {
    RawInvoice {
        invoice_number: Some(number.to_string()),
        invoice_date: Some(date.to_string()),
        order_number: Some(format!("ORD-{number}")),
        payment_method: Some("card".to_string()),
        line_items: items
            .iter()
            .map(|&(address, price, quantity)| RawLineItem {
                property_address: Some(address.to_string()),
                unit_price_usd: Some(price),
                quantity: Some(quantity),
            })
            .collect(),
        linked_hashes: Vec::new(),
    }
}
