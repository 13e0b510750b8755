//! SQLite record store for transfers, invoices, purchases and sales.
//!
//! Uses WAL mode and applies migrations on open. Engine outputs are upserted
//! on their identity keys so replaying a run never duplicates records, and
//! loads return rows in first-insert order (the "discovery order" the sale
//! allocator relies on).
//!
//! Ledger rows are deduplicated on a `dedup_key`. Rows carrying a log index
//! key on `(hash, log_index)`. Rows without one key on their full contents
//! plus an occurrence ordinal within the batch, so identical legs of one
//! transaction are all kept and re-fetching the same page inserts nothing.

use eyre::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::HashMap;

use crate::types::{Purchase, RawInvoice, RawLineItem, RawTransfer, Sale};

pub struct Store {
    conn: RefCell<Connection>,
}

/// Row counts per table, for status output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub transfers: u64,
    pub invoices: u64,
    pub purchases: u64,
    pub sales: u64,
}

impl Store {
    /// Creates or opens a SQLite database with WAL mode enabled.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or migrations fail.
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: RefCell::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn.borrow_mut().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS transfers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hash TEXT,
                block_number TEXT,
                time_stamp TEXT,
                from_address TEXT,
                to_address TEXT,
                value TEXT,
                token_name TEXT,
                token_symbol TEXT,
                log_index TEXT,
                dedup_key TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS invoices (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                invoice_number TEXT UNIQUE,
                invoice_date TEXT,
                order_number TEXT,
                payment_method TEXT,
                line_items TEXT NOT NULL,
                linked_hashes TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS purchases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                purchase_key TEXT NOT NULL UNIQUE,
                source TEXT NOT NULL,
                asset_symbol TEXT NOT NULL,
                transaction_hash TEXT NOT NULL,
                invoice_number TEXT,
                record TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sales (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sale_hash TEXT NOT NULL UNIQUE,
                asset_symbol TEXT NOT NULL,
                record TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transfers_hash ON transfers (hash);
            CREATE INDEX IF NOT EXISTS idx_purchases_symbol ON purchases (asset_symbol);
            ",
        )?;
        Ok(())
    }

    /// Batch insert ledger transfers, ignoring rows already stored.
    ///
    /// Returns the number of newly inserted rows.
    ///
    /// # Errors
    /// Returns error if database insert fails.
    pub fn insert_transfers(&self, transfers: &[RawTransfer]) -> Result<usize> {
        let keys = dedup_keys(transfers)?;
        let mut conn = self.conn.borrow_mut();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "
                INSERT OR IGNORE INTO transfers (
                    hash, block_number, time_stamp, from_address, to_address,
                    value, token_name, token_symbol, log_index, dedup_key
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )?;

            for (t, key) in transfers.iter().zip(&keys) {
                inserted += stmt.execute(params![
                    t.hash,
                    t.block_number,
                    t.time_stamp,
                    t.from,
                    t.to,
                    t.value,
                    t.token_name,
                    t.token_symbol,
                    t.log_index,
                    key,
                ])?;
            }
        }

        tx.commit()?;
        Ok(inserted)
    }

    /// All stored transfers, in insertion order.
    ///
    /// # Errors
    /// Returns error if the query fails.
    pub fn load_transfers(&self) -> Result<Vec<RawTransfer>> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare(
            "
            SELECT block_number, time_stamp, hash, from_address, to_address,
                   value, token_name, token_symbol, log_index
            FROM transfers ORDER BY id
            ",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok(RawTransfer {
                    block_number: row.get(0)?,
                    time_stamp: row.get(1)?,
                    hash: row.get(2)?,
                    from: row.get(3)?,
                    to: row.get(4)?,
                    value: row.get(5)?,
                    token_name: row.get(6)?,
                    token_symbol: row.get(7)?,
                    log_index: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Insert or update an invoice by invoice number.
    ///
    /// Re-importing an invoice keeps the transfer hashes already linked to it.
    ///
    /// # Errors
    /// Returns error if serialization or the upsert fails.
    pub fn upsert_invoice(&self, invoice: &RawInvoice) -> Result<()> {
        let line_items = serde_json::to_string(&invoice.line_items)?;
        let linked_hashes = serde_json::to_string(&invoice.linked_hashes)?;
        self.conn.borrow_mut().execute(
            "
            INSERT INTO invoices (
                invoice_number, invoice_date, order_number, payment_method,
                line_items, linked_hashes
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (invoice_number) DO UPDATE SET
                invoice_date = excluded.invoice_date,
                order_number = excluded.order_number,
                payment_method = excluded.payment_method,
                line_items = excluded.line_items
            ",
            params![
                invoice.invoice_number,
                invoice.invoice_date,
                invoice.order_number,
                invoice.payment_method,
                line_items,
                linked_hashes,
            ],
        )?;
        Ok(())
    }

    /// All stored invoices, in insertion order.
    ///
    /// # Errors
    /// Returns error if the query fails or stored JSON is corrupt.
    pub fn load_invoices(&self) -> Result<Vec<RawInvoice>> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare(
            "
            SELECT invoice_number, invoice_date, order_number, payment_method,
                   line_items, linked_hashes
            FROM invoices ORDER BY id
            ",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(invoice_number, invoice_date, order_number, payment_method, items, linked)| {
                    let line_items: Vec<RawLineItem> = serde_json::from_str(&items)
                        .wrap_err("corrupt line_items column")?;
                    let linked_hashes: Vec<String> = serde_json::from_str(&linked)
                        .wrap_err("corrupt linked_hashes column")?;
                    Ok(RawInvoice {
                        invoice_number,
                        invoice_date,
                        order_number,
                        payment_method,
                        line_items,
                        linked_hashes,
                    })
                },
            )
            .collect()
    }

    /// Replace the transfer hashes linked to an invoice.
    ///
    /// Returns `false` when no invoice carries that number.
    ///
    /// # Errors
    /// Returns error if the update fails.
    pub fn set_invoice_links(&self, invoice_number: &str, hashes: &[String]) -> Result<bool> {
        let linked = serde_json::to_string(hashes)?;
        let updated = self.conn.borrow_mut().execute(
            "UPDATE invoices SET linked_hashes = ? WHERE invoice_number = ?",
            params![linked, invoice_number],
        )?;
        Ok(updated > 0)
    }

    /// Insert or update a purchase by its identity key.
    ///
    /// An update keeps the row's original position in discovery order.
    ///
    /// # Errors
    /// Returns error if serialization or the upsert fails.
    pub fn upsert_purchase(&self, purchase: &Purchase) -> Result<()> {
        let record = serde_json::to_string(purchase)?;
        self.conn.borrow_mut().execute(
            "
            INSERT INTO purchases (
                purchase_key, source, asset_symbol, transaction_hash, invoice_number, record
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (purchase_key) DO UPDATE SET
                source = excluded.source,
                asset_symbol = excluded.asset_symbol,
                transaction_hash = excluded.transaction_hash,
                invoice_number = excluded.invoice_number,
                record = excluded.record
            ",
            params![
                purchase.key(),
                purchase.source.as_str(),
                purchase.asset_symbol,
                purchase.transaction_hash,
                purchase.invoice_number,
                record,
            ],
        )?;
        Ok(())
    }

    /// All purchases in discovery order.
    ///
    /// # Errors
    /// Returns error if the query fails or a stored record is corrupt.
    pub fn load_purchases(&self) -> Result<Vec<Purchase>> {
        self.load_records("SELECT record FROM purchases ORDER BY id", params![])
    }

    /// Purchases of one asset, in discovery order.
    ///
    /// # Errors
    /// Returns error if the query fails or a stored record is corrupt.
    pub fn purchases_for_symbol(&self, symbol: &str) -> Result<Vec<Purchase>> {
        self.load_records(
            "SELECT record FROM purchases WHERE asset_symbol = ? ORDER BY id",
            params![symbol],
        )
    }

    /// Purchases matching an arbitrary predicate, in discovery order.
    ///
    /// # Errors
    /// Returns error if loading purchases fails.
    pub fn find_purchases<F>(&self, predicate: F) -> Result<Vec<Purchase>>
    where
        F: Fn(&Purchase) -> bool,
    {
        Ok(self
            .load_purchases()?
            .into_iter()
            .filter(|purchase| predicate(purchase))
            .collect())
    }

    /// Insert or update a sale by sale hash.
    ///
    /// # Errors
    /// Returns error if serialization or the upsert fails.
    pub fn upsert_sale(&self, sale: &Sale) -> Result<()> {
        let record = serde_json::to_string(sale)?;
        self.conn.borrow_mut().execute(
            "
            INSERT INTO sales (sale_hash, asset_symbol, record) VALUES (?, ?, ?)
            ON CONFLICT (sale_hash) DO UPDATE SET
                asset_symbol = excluded.asset_symbol,
                record = excluded.record
            ",
            params![sale.sale_hash, sale.asset_symbol, record],
        )?;
        Ok(())
    }

    /// All sales, in insertion order.
    ///
    /// # Errors
    /// Returns error if the query fails or a stored record is corrupt.
    pub fn load_sales(&self) -> Result<Vec<Sale>> {
        self.load_records("SELECT record FROM sales ORDER BY id", params![])
    }

    /// Look up one sale by hash.
    ///
    /// # Errors
    /// Returns error if the query fails or the stored record is corrupt.
    pub fn get_sale(&self, sale_hash: &str) -> Result<Option<Sale>> {
        let record: Option<String> = self
            .conn
            .borrow()
            .query_row(
                "SELECT record FROM sales WHERE sale_hash = ?",
                [sale_hash],
                |row| row.get(0),
            )
            .optional()?;

        record
            .map(|json| serde_json::from_str(&json).wrap_err("corrupt sale record"))
            .transpose()
    }

    /// Row counts for every table.
    ///
    /// # Errors
    /// Returns error if a count query fails.
    pub fn counts(&self) -> Result<StoreCounts> {
        let conn = self.conn.borrow();
        let count = |table: &str| -> Result<u64> {
            let n: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            Ok(n as u64)
        };

        Ok(StoreCounts {
            transfers: count("transfers")?,
            invoices: count("invoices")?,
            purchases: count("purchases")?,
            sales: count("sales")?,
        })
    }

    fn load_records<T, P>(&self, sql: &str, params: P) -> Result<Vec<T>>
    where
        T: serde::de::DeserializeOwned,
        P: rusqlite::Params,
    {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare(sql)?;
        let records = stmt
            .query_map(params, |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        records
            .iter()
            .map(|json| serde_json::from_str(json).wrap_err("corrupt stored record"))
            .collect()
    }
}

/// Unique key per ledger row, aligned with `transfers`.
///
/// Missing fields serialize as `null`, so rows lacking a hash still get a
/// stable non-null key.
fn dedup_keys(transfers: &[RawTransfer]) -> Result<Vec<String>> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut keys = Vec::with_capacity(transfers.len());
    for t in transfers {
        let key = match (&t.hash, &t.log_index) {
            (Some(hash), Some(log_index)) => format!("log:{}:{log_index}", hash.to_lowercase()),
            _ => {
                let fingerprint = serde_json::to_string(t)?;
                let ordinal = seen.entry(fingerprint.clone()).or_insert(0);
                let key = format!("row:{fingerprint}#{ordinal}");
                *ordinal += 1;
                key
            }
        };
        keys.push(key);
    }
    Ok(keys)
}
