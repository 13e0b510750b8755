//! Import of invoices already extracted from invoice documents.
//!
//! The extractor writes JSON: either one invoice object or an array of them,
//! in the [`RawInvoice`] shape. Validation into [`crate::types::Invoice`]
//! happens later, when the engine loads records, so an incomplete invoice is
//! still stored and reported rather than lost at import time.

use std::path::Path;

use eyre::{Context, Result};
use tracing::{info, warn};

use crate::store::Store;
use crate::types::RawInvoice;

/// Parses extractor output.
///
/// # Errors
/// Returns error if the content is neither an invoice object nor an array of them.
pub fn parse_invoices_json(content: &str) -> Result<Vec<RawInvoice>> {
    let value: serde_json::Value =
        serde_json::from_str(content).wrap_err("invoice file is not valid JSON")?;

    if value.is_array() {
        serde_json::from_value(value).wrap_err("unexpected invoice array shape")
    } else {
        let invoice: RawInvoice =
            serde_json::from_value(value).wrap_err("unexpected invoice shape")?;
        Ok(vec![invoice])
    }
}

/// Reads one extractor output file and upserts its invoices.
///
/// Returns the number of invoices written.
///
/// # Errors
/// Returns error if the file cannot be read or parsed, or a store write fails.
pub fn import_invoices(path: &Path, store: &Store) -> Result<usize> {
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    let invoices = parse_invoices_json(&content)
        .wrap_err_with(|| format!("failed to parse {}", path.display()))?;

    for invoice in &invoices {
        if invoice.invoice_number.is_none() {
            warn!(path = %path.display(), "invoice without number imported; it will be skipped when matching");
        }
        store.upsert_invoice(invoice)?;
    }

    info!(path = %path.display(), invoices = invoices.len(), "invoices imported");
    Ok(invoices.len())
}
