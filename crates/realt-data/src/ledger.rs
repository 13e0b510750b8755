//! # Ledger Transfer Fetcher
//!
//! Pulls ERC-20 transfer history for a wallet from an Etherscan-compatible
//! `module=account&action=tokentx` endpoint (Gnosisscan by default) and hands
//! back [`RawTransfer`] rows for the store.
//!
//! Pages are requested in ascending block order, 1000 rows at a time, until a
//! short page comes back. The API only serves the first 10 000 rows of a
//! query, so once that window is used up paging restarts from the last block
//! seen (`startblock`). HTTP 429 responses are retried after the server's
//! `Retry-After` delay, at most [`MAX_RATE_LIMIT_RETRIES`] times in a row.

use eyre::{eyre, Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::types::RawTransfer;

/// Gnosisscan API base URL.
pub const DEFAULT_API_URL: &str = "https://api.gnosisscan.io/api";

/// Maximum rows requested per page.
const PAGE_SIZE: u32 = 1000;

/// Rows one query may page through (`page * offset`).
const RESULT_WINDOW: u32 = 10_000;

/// Consecutive HTTP 429 responses tolerated before giving up.
pub const MAX_RATE_LIMIT_RETRIES: u32 = 5;

/// Message returned with an empty result set.
const NO_TRANSACTIONS_MESSAGE: &str = "No transactions found";

/// Etherscan-style response envelope.
#[derive(Debug, Deserialize)]
struct TokenTxResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    result: serde_json::Value,
}

/// HTTP client for the ledger-indexing API.
#[derive(Debug, Clone)]
pub struct LedgerClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    page_size: u32,
    result_window: u32,
}

/// Position of the next page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageCursor {
    start_block: u64,
    page: u32,
}

impl PageCursor {
    fn new() -> Self {
        Self {
            start_block: 0,
            page: 1,
        }
    }

    /// Moves past a full page.
    ///
    /// When the next page would leave the result window, paging restarts at
    /// the last block collected. That block's rows are dropped from
    /// `collected` since the restarted query returns them again.
    fn advance(
        &mut self,
        collected: &mut Vec<RawTransfer>,
        page_size: u32,
        result_window: u32,
    ) -> Result<()> {
        if (self.page + 1).saturating_mul(page_size) <= result_window {
            self.page += 1;
            return Ok(());
        }

        let last_block = collected
            .last()
            .and_then(block_of)
            .ok_or_else(|| eyre!("cannot page past the result window: last row has no block number"))?;
        if last_block == self.start_block {
            return Err(eyre!(
                "block {last_block} holds more transfers than the API result window"
            ));
        }

        collected.retain(|t| block_of(t) != Some(last_block));
        debug!(start_block = last_block, "result window exhausted, restarting from block");
        self.start_block = last_block;
        self.page = 1;
        Ok(())
    }
}

fn block_of(transfer: &RawTransfer) -> Option<u64> {
    transfer.block_number.as_deref()?.parse().ok()
}

impl LedgerClient {
    /// Builds a client against `base_url`.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be constructed.
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .wrap_err("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            page_size: PAGE_SIZE,
            result_window: RESULT_WINDOW,
        })
    }

    /// Overrides the page size and result window, for providers whose
    /// limits differ from Gnosisscan's.
    pub fn with_paging(mut self, page_size: u32, result_window: u32) -> Self {
        self.page_size = page_size.max(1);
        self.result_window = result_window.max(self.page_size);
        self
    }

    /// Fetches every token transfer touching `address`, optionally restricted
    /// to one token contract.
    ///
    /// # Errors
    /// Returns error if a request fails or the API reports an error.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_token_transfers(
        &self,
        address: &str,
        contract: Option<&str>,
    ) -> Result<Vec<RawTransfer>> {
        let mut all_transfers = Vec::new();
        let mut cursor = PageCursor::new();
        let mut requests = 0u32;
        let mut rate_limited = 0u32;

        loop {
            let page_str = cursor.page.to_string();
            let offset_str = self.page_size.to_string();
            let start_str = cursor.start_block.to_string();
            let mut query = vec![
                ("module", "account"),
                ("action", "tokentx"),
                ("address", address),
                ("page", page_str.as_str()),
                ("offset", offset_str.as_str()),
                ("startblock", start_str.as_str()),
                ("endblock", "99999999"),
                ("sort", "asc"),
                ("apikey", self.api_key.as_str()),
            ];
            if let Some(contract) = contract {
                query.push(("contractaddress", contract));
            }

            debug!(page = cursor.page, start_block = cursor.start_block, "fetching transfer page");

            let response = self
                .client
                .get(&self.base_url)
                .query(&query)
                .send()
                .await
                .wrap_err("ledger API HTTP request failed")?;
            requests += 1;

            let status = response.status();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                rate_limited += 1;
                if rate_limited > MAX_RATE_LIMIT_RETRIES {
                    return Err(eyre!(
                        "ledger API still rate limiting after {MAX_RATE_LIMIT_RETRIES} retries"
                    ));
                }
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(5);
                warn!(
                    retry_after_s = retry_after,
                    attempt = rate_limited,
                    "ledger API rate limit hit, waiting"
                );
                tokio::time::sleep(std::time::Duration::from_secs(retry_after)).await;
                continue;
            }
            rate_limited = 0;

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(eyre!("ledger API returned HTTP {}: {}", status.as_u16(), body));
            }

            let body = response
                .text()
                .await
                .wrap_err("failed to read ledger API response body")?;
            let batch = parse_tokentx_response(&body)?;
            let batch_len = batch.len();
            all_transfers.extend(batch);

            if batch_len < self.page_size as usize {
                break;
            }
            cursor.advance(&mut all_transfers, self.page_size, self.result_window)?;
        }

        info!(
            transfers = all_transfers.len(),
            requests,
            "ledger transfer fetch complete"
        );

        Ok(all_transfers)
    }
}

/// Parses one `tokentx` response page.
///
/// An empty result set (`"No transactions found"`) yields an empty page. A
/// non-array `result` is the API's way of reporting an error.
///
/// # Errors
/// Returns error if the body is not valid JSON or the API reports an error.
pub fn parse_tokentx_response(body: &str) -> Result<Vec<RawTransfer>> {
    let response: TokenTxResponse =
        serde_json::from_str(body).wrap_err("failed to parse ledger API JSON")?;

    match response.result {
        serde_json::Value::Array(rows) => rows
            .into_iter()
            .map(|row| {
                serde_json::from_value::<RawTransfer>(row).wrap_err("unexpected transfer row shape")
            })
            .collect(),
        other => {
            if response.message.as_deref() == Some(NO_TRANSACTIONS_MESSAGE) {
                return Ok(Vec::new());
            }
            Err(eyre!(
                "ledger API error (status {}): {} {}",
                response.status.as_deref().unwrap_or("?"),
                response.message.as_deref().unwrap_or(""),
                other
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    const WALLET: &str = "0x00000000000000000000000000000000000000aa";

    fn row(block: u64) -> serde_json::Value {
        serde_json::json!({
            "blockNumber": block.to_string(),
            "timeStamp": "1704189600",
            "hash": format!("0x{block:x}"),
            "from": "0x00000000000000000000000000000000000000bb",
            "to": WALLET,
            "value": "1000000000000000000",
            "tokenName": "RealToken S 123 Main St",
            "tokenSymbol": "REALTOKEN-S-123-MAIN-ST",
            "logIndex": "0"
        })
    }

    fn page(blocks: &[u64]) -> serde_json::Value {
        serde_json::json!({
            "status": "1",
            "message": "OK",
            "result": blocks.iter().map(|&b| row(b)).collect::<Vec<_>>()
        })
    }

    #[tokio::test]
    async fn pages_past_the_result_window_from_last_block() {
        let server = MockServer::start_async().await;
        for (start, page_no, blocks) in [
            ("0", "1", vec![10, 11]),
            ("0", "2", vec![12, 13]),
            ("13", "1", vec![13, 14]),
            ("13", "2", vec![15]),
        ] {
            server
                .mock_async(|when, then| {
                    when.method(GET)
                        .path("/api")
                        .query_param("startblock", start)
                        .query_param("page", page_no);
                    then.status(200).json_body(page(&blocks));
                })
                .await;
        }

        let client = LedgerClient::new(&server.url("/api"), "key")
            .expect("client")
            .with_paging(2, 4);
        let rows = client
            .fetch_token_transfers(WALLET, None)
            .await
            .expect("fetch");

        let blocks: Vec<Option<u64>> = rows.iter().map(block_of).collect();
        assert_eq!(
            blocks,
            vec![Some(10), Some(11), Some(12), Some(13), Some(14), Some(15)]
        );
    }

    #[tokio::test]
    async fn persistent_rate_limiting_gives_up() {
        let server = MockServer::start_async().await;
        let limited = server
            .mock_async(|when, then| {
                when.method(GET).path("/api");
                then.status(429).header("Retry-After", "0");
            })
            .await;

        let client = LedgerClient::new(&server.url("/api"), "key").expect("client");
        let err = client
            .fetch_token_transfers(WALLET, None)
            .await
            .expect_err("should stop retrying");

        assert!(err.to_string().contains("rate limiting"));
        limited
            .assert_hits_async(MAX_RATE_LIMIT_RETRIES as usize + 1)
            .await;
    }

    #[test]
    fn single_block_larger_than_window_is_an_error() {
        let mut cursor = PageCursor {
            start_block: 7,
            page: 2,
        };
        let mut collected: Vec<RawTransfer> = (0..4)
            .map(|_| RawTransfer {
                block_number: Some("7".to_string()),
                ..RawTransfer::default()
            })
            .collect();

        assert!(cursor.advance(&mut collected, 2, 4).is_err());
        assert_eq!(collected.len(), 4);
    }

    #[test]
    fn parses_transfer_rows() {
        let body = r#"{
            "status": "1",
            "message": "OK",
            "result": [{
                "blockNumber": "31000000",
                "timeStamp": "1704189600",
                "hash": "0xabc",
                "from": "0x00000000000000000000000000000000000000bb",
                "to": "0x00000000000000000000000000000000000000aa",
                "value": "10000000000000000000",
                "tokenName": "RealToken S 123 Main St",
                "tokenSymbol": "REALTOKEN-S-123-MAIN-ST",
                "tokenDecimal": "18",
                "logIndex": "5",
                "gasUsed": "51234"
            }]
        }"#;

        let rows = parse_tokentx_response(body).expect("should parse");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].hash.as_deref(), Some("0xabc"));
        assert_eq!(rows[0].time_stamp.as_deref(), Some("1704189600"));
        assert_eq!(rows[0].token_symbol.as_deref(), Some("REALTOKEN-S-123-MAIN-ST"));
        assert_eq!(rows[0].log_index.as_deref(), Some("5"));
    }

    #[test]
    fn tolerates_missing_optional_fields() {
        let body = r#"{"status":"1","message":"OK","result":[{"hash":"0x1"}]}"#;
        let rows = parse_tokentx_response(body).expect("should parse");
        assert_eq!(rows[0].token_name, None);
    }

    #[test]
    fn empty_result_set_is_not_an_error() {
        let body = r#"{"status":"0","message":"No transactions found","result":[]}"#;
        assert!(parse_tokentx_response(body).expect("empty").is_empty());

        let body = r#"{"status":"0","message":"No transactions found","result":null}"#;
        assert!(parse_tokentx_response(body).expect("empty").is_empty());
    }

    #[test]
    fn string_result_is_an_api_error() {
        let body = r#"{"status":"0","message":"NOTOK","result":"Invalid API Key"}"#;
        let err = parse_tokentx_response(body).expect_err("should fail");
        assert!(err.to_string().contains("NOTOK"));
    }
}
