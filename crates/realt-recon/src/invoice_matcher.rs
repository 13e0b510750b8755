//! Invoice line items to on-chain deliveries.
//!
//! A line item is satisfied by incoming RealToken transfers to the wallet
//! observed between the invoice date and 120 hours later, whose asset name
//! correlates with the line item's street address.
//!
//! ## Resolution order
//!
//! Candidates are grouped by hash; the first strategy that succeeds wins:
//! 1. **Exact hash**: all transfers under one hash sum to the quantity.
//! 2. **Exact transfer**: one transfer anywhere in the pool carries the
//!    whole quantity.
//! 3. **Greedy aggregate**: walk the pool consuming every transfer that fits
//!    in the unmatched remainder until the remainder reaches zero.
//!
//! All comparisons use an absolute tolerance of [`QUANTITY_TOLERANCE`]. A
//! transfer consumed by one line item is not offered to later ones.

use std::collections::HashSet;

use alloy::primitives::Address;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use realt_data::{Invoice, InvoiceLineItem, LinkedTransfer, Purchase, PurchaseSource, Transfer};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::group::group_by_key;
use crate::report::UnmatchedLineItem;

/// Grace period after the invoice date during which deliveries are accepted.
pub const MATCH_WINDOW_HOURS: i64 = 120;

/// Absolute tolerance for quantity equality.
pub const QUANTITY_TOLERANCE: Decimal = dec!(0.0001);

/// `true` when `a` and `b` differ by less than [`QUANTITY_TOLERANCE`].
pub fn within_tolerance(a: Decimal, b: Decimal) -> bool {
    (a - b).abs() < QUANTITY_TOLERANCE
}

/// Which resolution step satisfied a line item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchStrategy {
    ExactHash,
    ExactTransfer,
    GreedyAggregate,
}

/// Transfers (by index into the input slice) satisfying one line item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineItemMatch {
    pub strategy: MatchStrategy,
    pub transfers: Vec<usize>,
    /// Sum of the matched transfer amounts.
    pub quantity: Decimal,
}

/// Result of matching every invoice against the transfer set.
#[derive(Clone, Debug, Default)]
pub struct InvoiceMatchOutcome {
    pub purchases: Vec<Purchase>,
    /// Hashes of every transfer consumed by a line item.
    pub matched_hashes: HashSet<String>,
    /// Hashes linked to each invoice, for invoices with at least one match.
    pub invoice_links: Vec<(String, Vec<String>)>,
    pub line_items: usize,
    pub unmatched: Vec<UnmatchedLineItem>,
}

fn digits(s: &str) -> String {
    s.chars().filter(char::is_ascii_digit).collect()
}

/// Two-stage address filter.
///
/// The street's digits must appear inside the asset name's digits, and at
/// least one whitespace-separated word of the street must appear in the
/// asset name (case-insensitive).
pub fn address_correlates(street: &str, asset_name: &str) -> bool {
    if !digits(asset_name).contains(&digits(street)) {
        return false;
    }

    let name = asset_name.to_lowercase();
    street
        .split_whitespace()
        .any(|part| name.contains(&part.to_lowercase()))
}

fn window(invoice_date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = invoice_date.and_time(NaiveTime::MIN).and_utc();
    (start, start + Duration::hours(MATCH_WINDOW_HOURS))
}

/// Indices of transfers eligible for a line item, in source order.
pub fn candidate_transfers(
    item: &InvoiceLineItem,
    invoice_date: NaiveDate,
    transfers: &[Transfer],
    wallet: Address,
    consumed: &HashSet<usize>,
) -> Vec<usize> {
    let (start, end) = window(invoice_date);
    let street = item.street();

    transfers
        .iter()
        .enumerate()
        .filter(|(i, t)| {
            !consumed.contains(i)
                && t.to == wallet
                && t.has_realtoken_name()
                && t.decimal_amount > Decimal::ZERO
                && t.timestamp >= start
                && t.timestamp <= end
                && address_correlates(&street, &t.asset_name)
        })
        .map(|(i, _)| i)
        .collect()
}

/// Finds the transfers satisfying one line item, if any.
pub fn match_line_item(
    item: &InvoiceLineItem,
    invoice_date: NaiveDate,
    transfers: &[Transfer],
    wallet: Address,
    consumed: &HashSet<usize>,
) -> Option<LineItemMatch> {
    let candidates = candidate_transfers(item, invoice_date, transfers, wallet, consumed);
    if candidates.is_empty() {
        return None;
    }

    let groups = group_by_key(candidates, |&i| transfers[i].hash.as_str());
    let amount = |i: usize| transfers[i].decimal_amount;

    for (_, indices) in &groups {
        let total: Decimal = indices.iter().map(|&i| amount(i)).sum();
        if within_tolerance(total, item.quantity) {
            return Some(LineItemMatch {
                strategy: MatchStrategy::ExactHash,
                transfers: indices.clone(),
                quantity: total,
            });
        }
    }

    let pool: Vec<usize> = groups.into_iter().flat_map(|(_, indices)| indices).collect();

    if let Some(&i) = pool
        .iter()
        .find(|&&i| within_tolerance(amount(i), item.quantity))
    {
        return Some(LineItemMatch {
            strategy: MatchStrategy::ExactTransfer,
            transfers: vec![i],
            quantity: amount(i),
        });
    }

    let mut remainder = item.quantity;
    let mut consumed_here = Vec::new();
    for &i in &pool {
        let value = amount(i);
        if value <= remainder || within_tolerance(value, remainder) {
            consumed_here.push(i);
            remainder -= value;
            if remainder.abs() < QUANTITY_TOLERANCE {
                return Some(LineItemMatch {
                    strategy: MatchStrategy::GreedyAggregate,
                    quantity: consumed_here.iter().map(|&j| amount(j)).sum(),
                    transfers: consumed_here,
                });
            }
        }
    }

    None
}

/// Matches every line item of every invoice and builds invoice purchases.
#[tracing::instrument(skip_all, fields(invoices = invoices.len(), transfers = transfers.len()))]
pub fn match_invoices(
    config: &EngineConfig,
    invoices: &[Invoice],
    transfers: &[Transfer],
) -> InvoiceMatchOutcome {
    let mut outcome = InvoiceMatchOutcome::default();
    let mut consumed: HashSet<usize> = HashSet::new();

    for invoice in invoices {
        let mut linked: Vec<String> = Vec::new();

        for item in &invoice.line_items {
            outcome.line_items += 1;

            let Some(found) = match_line_item(
                item,
                invoice.invoice_date,
                transfers,
                config.wallet,
                &consumed,
            ) else {
                debug!(
                    invoice = %invoice.invoice_number,
                    address = %item.property_address,
                    quantity = %item.quantity,
                    "no transfer for line item"
                );
                outcome.unmatched.push(UnmatchedLineItem {
                    invoice_number: invoice.invoice_number.clone(),
                    invoice_date: invoice.invoice_date,
                    property_address: item.property_address.clone(),
                    quantity: item.quantity,
                    unit_price_usd: item.unit_price_usd,
                });
                continue;
            };

            let matched: Vec<&Transfer> = found.transfers.iter().map(|&i| &transfers[i]).collect();
            consumed.extend(found.transfers.iter().copied());

            for t in &matched {
                outcome.matched_hashes.insert(t.hash.clone());
                if !linked.contains(&t.hash) {
                    linked.push(t.hash.clone());
                }
            }

            // `match_line_item` never returns an empty transfer list.
            let first = matched[0];
            let purchase = Purchase {
                source: PurchaseSource::Invoice,
                asset_symbol: first.asset_symbol.clone(),
                asset_name: first.asset_name.clone(),
                property_address: item.property_address.clone(),
                quantity: found.quantity,
                unit_price_usd: Some(item.unit_price_usd),
                transaction_hash: first.hash.clone(),
                transfer_date: first.timestamp,
                invoice_number: Some(invoice.invoice_number.clone()),
                invoice_date: Some(invoice.invoice_date),
                transfers: matched
                    .iter()
                    .map(|t| LinkedTransfer {
                        hash: t.hash.clone(),
                        quantity: t.decimal_amount,
                        transfer_date: t.timestamp,
                    })
                    .collect(),
            };

            info!(
                invoice = %invoice.invoice_number,
                hash = %purchase.transaction_hash,
                symbol = %purchase.asset_symbol,
                quantity = %purchase.quantity,
                strategy = ?found.strategy,
                "invoice purchase matched"
            );
            outcome.purchases.push(purchase);
        }

        if !linked.is_empty() {
            outcome
                .invoice_links
                .push((invoice.invoice_number.clone(), linked));
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const WALLET: &str = "0x00000000000000000000000000000000000000aa";
    const SELLER: &str = "0x00000000000000000000000000000000000000bb";

    fn wallet() -> Address {
        Address::from_str(WALLET).expect("address")
    }

    fn delivery(hash: &str, name: &str, amount: Decimal, timestamp: i64) -> Transfer {
        Transfer {
            hash: hash.to_string(),
            from: Address::from_str(SELLER).expect("address"),
            to: wallet(),
            asset_symbol: format!(
                "REALTOKEN-{}",
                name.trim_start_matches("RealToken ")
                    .to_uppercase()
                    .replace(' ', "-")
            ),
            asset_name: name.to_string(),
            raw_amount: String::new(),
            decimal_amount: amount,
            timestamp: DateTime::from_timestamp(timestamp, 0).expect("timestamp"),
            block_number: None,
        }
    }

    fn item(address: &str, quantity: Decimal) -> InvoiceLineItem {
        InvoiceLineItem {
            property_address: address.to_string(),
            unit_price_usd: dec!(50),
            quantity,
        }
    }

    fn jan_1() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).expect("date")
    }

    // 2024-01-02 10:00:00 UTC
    const JAN_2_10AM: i64 = 1_704_189_600;

    #[test]
    fn address_filter_requires_digits_and_a_word() {
        assert!(address_correlates("123 main st", "RealToken S 123 Main St"));
        assert!(!address_correlates("123 main st", "RealToken S 124 Main St"));
        // No digits to compare, and no word of the street appears.
        assert!(!address_correlates("oak avenue", "RealToken S 12 Pine Rd"));
        assert!(address_correlates("pine rd", "RealToken S 12 Pine Rd"));
        // Digit substring: 23 is inside 123.
        assert!(address_correlates("23 main st", "RealToken S 123 Main St"));
    }

    #[test]
    fn exact_single_hash_match() {
        let transfers = vec![delivery("0x1", "RealToken S 123 Main St", dec!(10), JAN_2_10AM)];
        let found = match_line_item(
            &item("123 Main St, City, ST 00000", dec!(10)),
            jan_1(),
            &transfers,
            wallet(),
            &HashSet::new(),
        )
        .expect("should match");

        assert_eq!(found.strategy, MatchStrategy::ExactHash);
        assert_eq!(found.transfers, vec![0]);
        assert_eq!(found.quantity, dec!(10));
    }

    #[test]
    fn hash_total_aggregates_split_delivery() {
        let transfers = vec![
            delivery("0x1", "RealToken S 123 Main St", dec!(5), JAN_2_10AM),
            delivery("0x1", "RealToken S 123 Main St", dec!(5), JAN_2_10AM),
        ];
        let found = match_line_item(
            &item("123 Main St", dec!(10)),
            jan_1(),
            &transfers,
            wallet(),
            &HashSet::new(),
        )
        .expect("should match");

        assert_eq!(found.strategy, MatchStrategy::ExactHash);
        assert_eq!(found.transfers, vec![0, 1]);
    }

    #[test]
    fn exact_transfer_inside_larger_hash() {
        let transfers = vec![
            delivery("0x1", "RealToken S 123 Main St", dec!(4), JAN_2_10AM),
            delivery("0x1", "RealToken S 123 Main St", dec!(10), JAN_2_10AM),
        ];
        let found = match_line_item(
            &item("123 Main St", dec!(10)),
            jan_1(),
            &transfers,
            wallet(),
            &HashSet::new(),
        )
        .expect("should match");

        assert_eq!(found.strategy, MatchStrategy::ExactTransfer);
        assert_eq!(found.transfers, vec![1]);
    }

    #[test]
    fn greedy_aggregation_across_hashes() {
        let transfers = vec![
            delivery("0x1", "RealToken S 123 Main St", dec!(6), JAN_2_10AM),
            delivery("0x2", "RealToken S 123 Main St", dec!(7), JAN_2_10AM + 60),
            delivery("0x3", "RealToken S 123 Main St", dec!(4.00005), JAN_2_10AM + 120),
        ];
        let found = match_line_item(
            &item("123 Main St", dec!(10)),
            jan_1(),
            &transfers,
            wallet(),
            &HashSet::new(),
        )
        .expect("should match");

        assert_eq!(found.strategy, MatchStrategy::GreedyAggregate);
        assert_eq!(found.transfers, vec![0, 2]);
        assert!(within_tolerance(found.quantity, dec!(10)));
    }

    #[test]
    fn window_is_inclusive_of_120_hours() {
        let end = window(jan_1()).1.timestamp();
        let inside = vec![delivery("0x1", "RealToken S 123 Main St", dec!(10), end)];
        let outside = vec![delivery("0x1", "RealToken S 123 Main St", dec!(10), end + 1)];
        let before = vec![delivery(
            "0x1",
            "RealToken S 123 Main St",
            dec!(10),
            window(jan_1()).0.timestamp() - 1,
        )];

        let line = item("123 Main St", dec!(10));
        let none = HashSet::new();
        assert!(match_line_item(&line, jan_1(), &inside, wallet(), &none).is_some());
        assert!(match_line_item(&line, jan_1(), &outside, wallet(), &none).is_none());
        assert!(match_line_item(&line, jan_1(), &before, wallet(), &none).is_none());
    }

    #[test]
    fn outgoing_and_non_realtoken_transfers_are_ignored() {
        let mut outgoing = delivery("0x1", "RealToken S 123 Main St", dec!(10), JAN_2_10AM);
        outgoing.to = Address::from_str(SELLER).expect("address");
        let mut unnamed = delivery("0x2", "RealToken S 123 Main St", dec!(10), JAN_2_10AM);
        unnamed.asset_name = "Wrapped 123 Main St".to_string();

        let transfers = vec![outgoing, unnamed];
        assert!(match_line_item(
            &item("123 Main St", dec!(10)),
            jan_1(),
            &transfers,
            wallet(),
            &HashSet::new()
        )
        .is_none());
    }

    #[test]
    fn match_invoices_builds_purchases_and_consumes_transfers() {
        let config = EngineConfig::new(Some(WALLET), None).expect("config");
        let invoice = |number: &str| Invoice {
            invoice_number: number.to_string(),
            invoice_date: jan_1(),
            order_number: None,
            line_items: vec![item("123 Main St, City, ST 00000", dec!(10))],
            rejected_line_items: Vec::new(),
        };
        let invoices = vec![invoice("1001"), invoice("1002")];
        let transfers = vec![delivery("0x1", "RealToken S 123 Main St", dec!(10), JAN_2_10AM)];

        let outcome = match_invoices(&config, &invoices, &transfers);
        assert_eq!(outcome.line_items, 2);
        assert_eq!(outcome.purchases.len(), 1);
        assert_eq!(outcome.unmatched.len(), 1);
        assert_eq!(outcome.unmatched[0].invoice_number, "1002");

        let purchase = &outcome.purchases[0];
        assert_eq!(purchase.source, PurchaseSource::Invoice);
        assert_eq!(purchase.quantity, dec!(10));
        assert_eq!(purchase.unit_price_usd, Some(dec!(50)));
        assert_eq!(purchase.property_address, "123 Main St, City, ST 00000");
        assert_eq!(purchase.transfers.len(), 1);
        assert!(outcome.matched_hashes.contains("0x1"));
        assert_eq!(
            outcome.invoice_links,
            vec![("1001".to_string(), vec!["0x1".to_string()])]
        );
    }
}
