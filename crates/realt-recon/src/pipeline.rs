//! Engine entry points.
//!
//! The `reconcile_*` functions are pure: records in, records and a report
//! out. The `match_*` functions wrap them with loading from and writing to a
//! [`Store`]. Writes are upserts, so running a stage twice over unchanged
//! inputs leaves the store unchanged.

use std::collections::HashSet;

use eyre::{Context, Result};
use realt_data::store::Store;
use realt_data::{Invoice, Purchase, PurchaseSource, Sale, Transfer};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::allocator::{allocate_sales, roi_percent};
use crate::config::EngineConfig;
use crate::invoice_matcher::match_invoices;
use crate::p2p::{detect_p2p_purchases, detect_wallet_transfers};
use crate::report::{PurchaseReport, SaleReport, SkipCounters};
use crate::sales::find_sale_pairs;

/// Validates stored ledger rows, skipping and counting malformed ones.
///
/// # Errors
/// Returns error if the store cannot be read.
pub fn load_transfers(store: &Store) -> Result<(Vec<Transfer>, SkipCounters)> {
    let raw = store.load_transfers().wrap_err("failed to load transfers")?;
    let mut skipped = SkipCounters::default();
    let mut transfers = Vec::with_capacity(raw.len());

    for record in &raw {
        match Transfer::from_raw(record) {
            Ok(transfer) => transfers.push(transfer),
            Err(reason) => {
                warn!(hash = ?record.hash, %reason, "skipping transfer");
                skipped.record(reason);
            }
        }
    }

    Ok((transfers, skipped))
}

/// Validated invoices plus how many were rejected at the header.
pub struct LoadedInvoices {
    pub invoices: Vec<Invoice>,
    pub invoices_skipped: usize,
    pub skipped: SkipCounters,
}

/// Validates stored invoices. Invoices without a number or a parsable date
/// are skipped; so are individual malformed line items.
///
/// # Errors
/// Returns error if the store cannot be read.
pub fn load_invoices(store: &Store) -> Result<LoadedInvoices> {
    let raw = store.load_invoices().wrap_err("failed to load invoices")?;
    let mut loaded = LoadedInvoices {
        invoices: Vec::with_capacity(raw.len()),
        invoices_skipped: 0,
        skipped: SkipCounters::default(),
    };

    for record in &raw {
        match Invoice::from_raw(record) {
            Ok(invoice) => {
                for &reason in &invoice.rejected_line_items {
                    warn!(invoice = %invoice.invoice_number, %reason, "skipping line item");
                    loaded.skipped.record(reason);
                }
                loaded.invoices.push(invoice);
            }
            Err(reason) => {
                warn!(invoice = ?record.invoice_number, %reason, "skipping invoice");
                loaded.invoices_skipped += 1;
                loaded.skipped.record(reason);
            }
        }
    }

    Ok(loaded)
}

/// Output of purchase reconciliation.
#[derive(Clone, Debug, Default)]
pub struct PurchaseReconciliation {
    /// Invoice purchases, then p2p purchases, then wallet transfers.
    pub purchases: Vec<Purchase>,
    /// Transfer hashes that satisfied each invoice.
    pub invoice_links: Vec<(String, Vec<String>)>,
    pub report: PurchaseReport,
}

/// Runs the invoice matcher, then p2p and wallet-transfer detection over the
/// transfers it left unmatched.
pub fn reconcile_purchases(
    config: &EngineConfig,
    invoices: &[Invoice],
    transfers: &[Transfer],
) -> PurchaseReconciliation {
    let matched = match_invoices(config, invoices, transfers);
    let mut report = PurchaseReport {
        line_items: matched.line_items,
        invoice_purchases: matched.purchases.len(),
        unmatched_line_items: matched.unmatched,
        ..PurchaseReport::default()
    };

    let p2p = detect_p2p_purchases(config, transfers, &matched.matched_hashes, &mut report.skipped);
    report.p2p_purchases = p2p.len();

    let linked_invoices: HashSet<String> = matched
        .invoice_links
        .iter()
        .map(|(number, _)| number.clone())
        .collect();
    let moved = detect_wallet_transfers(
        config,
        transfers,
        invoices,
        &matched.matched_hashes,
        &linked_invoices,
    );
    report.transfer_purchases = moved.len();

    let mut invoice_links = matched.invoice_links;
    for purchase in &moved {
        if let Some(number) = &purchase.invoice_number {
            report.transfers_with_invoice += 1;
            invoice_links.push((number.clone(), vec![purchase.transaction_hash.clone()]));
        }
    }

    let mut purchases = matched.purchases;
    purchases.extend(p2p);
    purchases.extend(moved);

    let mut keys: HashSet<String> = HashSet::new();
    for purchase in &purchases {
        let key = purchase.key();
        if !keys.insert(key.clone()) {
            report.overwritten_purchases += 1;
            warn!(
                key = %key,
                symbol = %purchase.asset_symbol,
                quantity = %purchase.quantity,
                "purchase key already used in this run, earlier lot will be overwritten"
            );
        }
    }

    PurchaseReconciliation {
        purchases,
        invoice_links,
        report,
    }
}

/// Reconciles stored invoices and transfers into purchases and persists them.
///
/// # Errors
/// Returns error if loading or writing records fails.
#[tracing::instrument(skip_all)]
pub fn match_purchases(config: &EngineConfig, store: &Store) -> Result<PurchaseReport> {
    let (transfers, transfer_skips) = load_transfers(store)?;
    let loaded = load_invoices(store)?;

    let mut run = reconcile_purchases(config, &loaded.invoices, &transfers);
    run.report.invoices_skipped = loaded.invoices_skipped;
    run.report.skipped.merge(&transfer_skips);
    run.report.skipped.merge(&loaded.skipped);

    for purchase in &run.purchases {
        store
            .upsert_purchase(purchase)
            .wrap_err_with(|| format!("failed to store purchase {}", purchase.key()))?;
    }
    for (number, hashes) in &run.invoice_links {
        if !store.set_invoice_links(number, hashes)? {
            warn!(invoice = %number, "linked invoice not found in store");
        }
    }

    let report = run.report;
    info!(
        purchases = report.total_purchases(),
        invoice = report.invoice_purchases,
        p2p = report.p2p_purchases,
        transfer = report.transfer_purchases,
        unmatched_line_items = report.unmatched_line_items.len(),
        overwritten = report.overwritten_purchases,
        skipped = report.skipped.total(),
        "purchase matching complete"
    );
    Ok(report)
}

/// Investment totals over recorded sales: `(invested, received, roi)`.
///
/// ROI is `None` when nothing was invested.
pub fn sale_totals(sales: &[Sale]) -> (Decimal, Decimal, Option<Decimal>) {
    let invested = sales.iter().fold(Decimal::ZERO, |acc, sale| {
        acc.saturating_add(sale.buy_price_usd.saturating_mul(sale.quantity))
    });
    let received = sales
        .iter()
        .fold(Decimal::ZERO, |acc, sale| acc.saturating_add(sale.total_received_usd));
    (invested, received, roi_percent(invested, received).ok())
}

/// Pairs sales out of the transfer set and allocates them against purchases.
pub fn reconcile_sales(
    config: &EngineConfig,
    purchases: &[Purchase],
    transfers: &[Transfer],
) -> (Vec<Sale>, SaleReport) {
    let mut report = SaleReport::default();
    let candidates = find_sale_pairs(config, transfers, &mut report.skipped);
    report.sale_pairs = candidates.len();

    let outcome = allocate_sales(purchases, &candidates, config.allocation_order);
    report.sales = outcome.sales.len();
    report.unmatched_sales = outcome.unmatched;
    report.skipped.merge(&outcome.skipped);

    let (invested, received, roi) = sale_totals(&outcome.sales);
    report.total_invested_usd = invested;
    report.total_received_usd = received;
    report.overall_roi_percent = roi;

    (outcome.sales, report)
}

/// Allocates sales against stored purchases and persists them.
///
/// # Errors
/// Returns error if loading or writing records fails.
#[tracing::instrument(skip_all)]
pub fn match_sales(config: &EngineConfig, store: &Store) -> Result<SaleReport> {
    let (transfers, transfer_skips) = load_transfers(store)?;
    let purchases = store.load_purchases().wrap_err("failed to load purchases")?;

    let (sales, mut report) = reconcile_sales(config, &purchases, &transfers);
    report.skipped.merge(&transfer_skips);

    for sale in &sales {
        store
            .upsert_sale(sale)
            .wrap_err_with(|| format!("failed to store sale {}", sale.sale_hash))?;
    }

    info!(
        sale_pairs = report.sale_pairs,
        sales = report.sales,
        unmatched = report.unmatched_sales.len(),
        unpriced = report.unpriced_sales(),
        invested = %report.total_invested_usd,
        received = %report.total_received_usd,
        "sale allocation complete"
    );
    Ok(report)
}

/// Number of stored purchases per source, in `invoice, p2p, transfer` order.
pub fn purchases_by_source(purchases: &[Purchase]) -> [(PurchaseSource, usize); 3] {
    [PurchaseSource::Invoice, PurchaseSource::P2p, PurchaseSource::Transfer]
        .map(|source| (source, purchases.iter().filter(|p| p.source == source).count()))
}
