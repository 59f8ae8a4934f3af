use std::time::Duration;

use chain_store::ChainRecord;

use crate::client::{FetchError, RpcError};

/// Client implementations selectable through a chain record's
/// `client_kind` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Evm,
}

impl ClientKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "evm" => Some(Self::Evm),
            _ => None,
        }
    }
}

/// Per-chain view for one control-loop pass. Descriptors are rebuilt from
/// the registry snapshot every pass; only the cursor behind them is durable.
#[derive(Debug, Clone)]
pub struct ChainDescriptor {
    pub id: u64,
    pub key: String,
    pub client_kind: String,
    /// Decrypted connection string. Empty means the chain cannot be
    /// synchronized this pass and is skipped without touching its cursor.
    pub endpoint: String,
    /// Last height fully ingested.
    pub cursor: u64,
}

impl ChainDescriptor {
    #[must_use]
    pub fn from_record(record: ChainRecord, endpoint: String) -> Self {
        Self {
            id: record.id,
            key: record.key,
            client_kind: record.client_kind,
            endpoint,
            cursor: record.cursor,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Blocks behind the tip considered too close to fetch safely.
    pub safety_margin: u64,
    /// Pause applied to a chain that has reached the safety boundary.
    pub cooldown: Duration,
    /// Minimum sleep between passes.
    pub pass_interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            safety_margin: 3,
            cooldown: Duration::from_secs(5),
            pass_interval: Duration::from_secs(1),
        }
    }
}

/// What happened to one chain during one pass.
#[derive(Debug)]
pub enum ChainOutcome {
    /// The chain was behind the safety boundary; one block was fetched and
    /// the cursor advanced to `cursor`.
    Lagging { fetched: u64, cursor: u64 },
    /// Cursor sits exactly on `tip - safety_margin`; cooldown applies.
    AtBoundary,
    /// Cursor is past the safety boundary; nothing to do.
    Synced,
    Skipped(SkipReason),
}

#[derive(Debug)]
pub enum SkipReason {
    EmptyEndpoint,
    UnknownClientKind,
    InvalidEndpoint(url::ParseError),
    TipQuery(RpcError),
    Fetch(FetchError),
}
