//! Engine configuration, passed explicitly to every entry point.

use std::fmt;
use std::str::FromStr;

use alloy::primitives::Address;
use eyre::{eyre, Result};

/// Order in which the allocator offers purchase lots to a sale.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AllocationOrder {
    /// First lot in discovery (store insertion) order.
    #[default]
    Discovery,
    /// Oldest lot by transfer date; ties keep discovery order.
    Chronological,
}

impl FromStr for AllocationOrder {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "discovery" => Ok(Self::Discovery),
            "chronological" | "fifo" => Ok(Self::Chronological),
            other => Err(eyre!(
                "unknown allocation order '{other}'; use 'discovery' or 'chronological'"
            )),
        }
    }
}

impl fmt::Display for AllocationOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discovery => f.write_str("discovery"),
            Self::Chronological => f.write_str("chronological"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Wallet whose purchases and sales are reconciled.
    pub wallet: Address,
    /// Previous wallet; enables wallet-transfer detection.
    pub old_wallet: Option<Address>,
    pub allocation_order: AllocationOrder,
}

impl EngineConfig {
    /// Builds a configuration from textual addresses.
    ///
    /// # Errors
    /// Fails when the wallet address is missing, empty or not a 20-byte hex
    /// address, or when a given old wallet address is invalid.
    pub fn new(wallet: Option<&str>, old_wallet: Option<&str>) -> Result<Self> {
        let wallet = match wallet.map(str::trim) {
            Some(w) if !w.is_empty() => w,
            _ => return Err(eyre!("wallet address is not configured")),
        };
        let wallet = wallet
            .parse::<Address>()
            .map_err(|e| eyre!("invalid wallet address '{wallet}': {e}"))?;

        let old_wallet = match old_wallet.map(str::trim) {
            Some(w) if !w.is_empty() => Some(
                w.parse::<Address>()
                    .map_err(|e| eyre!("invalid old wallet address '{w}': {e}"))?,
            ),
            _ => None,
        };

        Ok(Self {
            wallet,
            old_wallet,
            allocation_order: AllocationOrder::default(),
        })
    }

    pub fn with_allocation_order(mut self, order: AllocationOrder) -> Self {
        self.allocation_order = order;
        self
    }
}
