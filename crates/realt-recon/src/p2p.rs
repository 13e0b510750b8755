//! Purchases that bypass invoices.
//!
//! Two shapes are recognized among transfers the invoice matcher left
//! untouched:
//! - **p2p**: one transaction delivers a RealToken to the wallet and pays for
//!   it in stablecoin from the wallet. The unit price is payment / quantity.
//! - **wallet transfer**: a RealToken moved from the previous wallet to the
//!   current one. It is a migration, not a new purchase, so its cost basis
//!   comes from an earlier invoice with the same quantity and property when
//!   one can be found.

use std::collections::HashSet;

use realt_data::{Invoice, Purchase, PurchaseSource, SkipReason, Transfer};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::group::group_by_hash;
use crate::invoice_matcher::within_tolerance;
use crate::report::SkipCounters;

/// Unit price from a payment and a delivered quantity.
///
/// Both amounts must be strictly positive.
pub fn unit_price(payment: Decimal, quantity: Decimal) -> Result<Decimal, SkipReason> {
    if payment <= Decimal::ZERO || quantity <= Decimal::ZERO {
        return Err(SkipReason::ArithmeticFailure);
    }
    payment
        .checked_div(quantity)
        .ok_or(SkipReason::ArithmeticFailure)
}

/// Finds p2p purchases among transfers whose hash is not in `matched_hashes`.
#[tracing::instrument(skip_all, fields(transfers = transfers.len()))]
pub fn detect_p2p_purchases(
    config: &EngineConfig,
    transfers: &[Transfer],
    matched_hashes: &HashSet<String>,
    skipped: &mut SkipCounters,
) -> Vec<Purchase> {
    let wallet = config.wallet;
    let unmatched = transfers
        .iter()
        .filter(|t| !matched_hashes.contains(&t.hash));

    let mut purchases = Vec::new();
    for group in group_by_hash(unmatched) {
        if group.transfers.len() < 2 {
            continue;
        }

        let asset = group
            .transfers
            .iter()
            .filter(|t| t.to == wallet && t.is_realtoken())
            .last();
        let payment = group
            .transfers
            .iter()
            .filter(|t| t.from == wallet && t.is_payment())
            .last();

        let (Some(asset), Some(payment)) = (asset, payment) else {
            continue;
        };

        let price = match unit_price(payment.decimal_amount, asset.decimal_amount) {
            Ok(price) => price,
            Err(reason) => {
                warn!(hash = group.hash, %reason, "skipping p2p candidate");
                skipped.record(reason);
                continue;
            }
        };

        info!(
            hash = group.hash,
            symbol = %asset.asset_symbol,
            quantity = %asset.decimal_amount,
            paid = %payment.decimal_amount,
            currency = %payment.asset_symbol,
            %price,
            "p2p purchase found"
        );

        purchases.push(Purchase {
            source: PurchaseSource::P2p,
            asset_symbol: asset.asset_symbol.clone(),
            asset_name: asset.asset_name.clone(),
            property_address: asset.property_address(),
            quantity: asset.decimal_amount,
            unit_price_usd: Some(price),
            transaction_hash: group.hash.to_string(),
            transfer_date: asset.timestamp,
            invoice_number: None,
            invoice_date: None,
            transfers: Vec::new(),
        });
    }

    purchases
}

/// `true` when any non-empty comma-separated segment of the invoice address
/// appears in the property name (case-insensitive).
pub fn address_segment_matches(invoice_address: &str, property: &str) -> bool {
    let property = property.to_lowercase();
    invoice_address
        .split(',')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .any(|segment| property.contains(&segment.to_lowercase()))
}

/// Finds RealToken transfers from the previous wallet to the current one and
/// prices them from earlier invoices.
///
/// Returns nothing unless an old wallet is configured. An invoice listed in
/// `linked_invoices`, or already claimed by an earlier transfer in this call,
/// is not reused.
#[tracing::instrument(skip_all, fields(transfers = transfers.len(), invoices = invoices.len()))]
pub fn detect_wallet_transfers(
    config: &EngineConfig,
    transfers: &[Transfer],
    invoices: &[Invoice],
    matched_hashes: &HashSet<String>,
    linked_invoices: &HashSet<String>,
) -> Vec<Purchase> {
    let Some(old_wallet) = config.old_wallet else {
        return Vec::new();
    };

    let mut claimed: HashSet<&str> = HashSet::new();
    let mut purchases = Vec::new();

    for transfer in transfers.iter().filter(|t| {
        t.from == old_wallet
            && t.to == config.wallet
            && t.is_realtoken()
            && !matched_hashes.contains(&t.hash)
    }) {
        let property = transfer.property_address();

        let found = invoices
            .iter()
            .filter(|invoice| {
                invoice
                    .invoice_date
                    .and_hms_opt(0, 0, 0)
                    .is_some_and(|d| d.and_utc() < transfer.timestamp)
                    && !linked_invoices.contains(&invoice.invoice_number)
                    && !claimed.contains(invoice.invoice_number.as_str())
            })
            .find_map(|invoice| {
                invoice
                    .line_items
                    .iter()
                    .find(|item| {
                        within_tolerance(item.quantity, transfer.decimal_amount)
                            && address_segment_matches(&item.property_address, &property)
                    })
                    .map(|item| (invoice, item))
            });

        if let Some((invoice, _)) = found {
            claimed.insert(invoice.invoice_number.as_str());
        }

        match found {
            Some((invoice, item)) => info!(
                hash = %transfer.hash,
                symbol = %transfer.asset_symbol,
                quantity = %transfer.decimal_amount,
                invoice = %invoice.invoice_number,
                price = %item.unit_price_usd,
                "wallet transfer priced from invoice"
            ),
            None => debug!(
                hash = %transfer.hash,
                symbol = %transfer.asset_symbol,
                quantity = %transfer.decimal_amount,
                "wallet transfer without invoice"
            ),
        }

        purchases.push(Purchase {
            source: PurchaseSource::Transfer,
            asset_symbol: transfer.asset_symbol.clone(),
            asset_name: transfer.asset_name.clone(),
            property_address: property,
            quantity: transfer.decimal_amount,
            unit_price_usd: found.map(|(_, item)| item.unit_price_usd),
            transaction_hash: transfer.hash.clone(),
            transfer_date: transfer.timestamp,
            invoice_number: found.map(|(invoice, _)| invoice.invoice_number.clone()),
            invoice_date: found.map(|(invoice, _)| invoice.invoice_date),
            transfers: Vec::new(),
        });
    }

    purchases
}
