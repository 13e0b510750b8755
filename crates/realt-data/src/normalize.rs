//! Raw token amounts to decimal quantities.
//!
//! Ledger APIs report amounts as integers in the token's smallest unit. The
//! conversion is `raw / 10^decimals`, done with exact decimal scaling so no
//! float rounding creeps into quantity comparisons downstream.

use alloy::primitives::U256;
use rust_decimal::Decimal;

use crate::types::{SkipReason, REALTOKEN_SYMBOL_PREFIX};

/// Decimals assumed for symbols missing from the table.
pub const DEFAULT_DECIMALS: u32 = 18;

/// Decimal places used by `symbol`.
///
/// Every `REALTOKEN-*` asset uses 18; known stablecoins come from a fixed
/// table; anything else defaults to [`DEFAULT_DECIMALS`].
pub fn decimals(symbol: &str) -> u32 {
    if symbol.starts_with(REALTOKEN_SYMBOL_PREFIX) {
        return 18;
    }

    match symbol {
        "USDC" | "USDT" => 6,
        "DAI" | "WXDAI" => 18,
        _ => DEFAULT_DECIMALS,
    }
}

/// Converts a raw integer amount to a decimal quantity.
///
/// A missing, empty or zero amount is `0`. Non-integer text is a malformed
/// record; amounts beyond the 96-bit decimal mantissa are an arithmetic
/// failure.
pub fn normalize(symbol: &str, raw_amount: Option<&str>) -> Result<Decimal, SkipReason> {
    let raw = match raw_amount.map(str::trim) {
        None | Some("") => return Ok(Decimal::ZERO),
        Some(raw) => raw,
    };

    let value = raw
        .parse::<U256>()
        .map_err(|_| SkipReason::MalformedRecord)?;
    if value.is_zero() {
        return Ok(Decimal::ZERO);
    }

    let value: u128 = value
        .try_into()
        .map_err(|_| SkipReason::ArithmeticFailure)?;
    let value = i128::try_from(value).map_err(|_| SkipReason::ArithmeticFailure)?;

    Decimal::try_from_i128_with_scale(value, decimals(symbol))
        .map(|amount| amount.normalize())
        .map_err(|_| SkipReason::ArithmeticFailure)
}
