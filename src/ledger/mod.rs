//! Ledger collaborator: transaction lookup, contract calls and event feeds.

pub mod rest;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::LedgerError;

pub use rest::RestLedger;

/// An amount in one denomination. Amounts travel as decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    #[serde(with = "amount_string")]
    pub amount: u128,
}

impl Coin {
    pub fn new(denom: impl Into<String>, amount: u128) -> Self {
        Self {
            denom: denom.into(),
            amount,
        }
    }
}

/// One bank transfer inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub from: String,
    pub to: String,
    pub amount: Vec<Coin>,
}

impl Transfer {
    /// Total transferred in `denom`.
    pub fn amount_of(&self, denom: &str) -> u128 {
        self.amount
            .iter()
            .filter(|c| c.denom == denom)
            .map(|c| c.amount)
            .sum()
    }
}

/// A committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    pub hash: String,
    /// Zero on success.
    pub code: u32,
    pub height: u64,
    pub transfers: Vec<Transfer>,
    #[serde(default)]
    pub raw_log: String,
}

impl TxRecord {
    pub fn succeeded(&self) -> bool {
        self.code == 0
    }
}

/// A service the provider offers, as advertised at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub service_type: String,
    pub max_complexity: u64,
    /// Seconds.
    pub avg_completion_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceInfo {
    pub base_price: String,
    pub unit: String,
}

/// Execute messages understood by the marketplace contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractMsg {
    RegisterProvider {
        name: String,
        capabilities: Vec<Capability>,
        pricing: BTreeMap<String, PriceInfo>,
        endpoint: String,
    },
    HeartBeat {},
    CompleteJob {
        job_id: u64,
        result_hash: String,
        result_url: String,
    },
    FailJob {
        job_id: u64,
        reason: String,
    },
}

impl ContractMsg {
    /// Short name for logs.
    pub fn action(&self) -> &'static str {
        match self {
            Self::RegisterProvider { .. } => "register_provider",
            Self::HeartBeat {} => "heart_beat",
            Self::CompleteJob { .. } => "complete_job",
            Self::FailJob { .. } => "fail_job",
        }
    }
}

/// A state-changing call. Signing and broadcasting happen outside this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerCall {
    Contract { contract: String, msg: ContractMsg },
    Send { to: String, amount: Coin, memo: String },
}

impl LedgerCall {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Contract { msg, .. } => msg.action(),
            Self::Send { .. } => "send",
        }
    }
}

/// Outcome of a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastResult {
    pub tx_hash: String,
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub height: Option<u64>,
    #[serde(default)]
    pub raw_log: String,
}

/// A job as stored by the marketplace contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractJob {
    pub id: u64,
    pub client: String,
    #[serde(default)]
    pub provider: String,
    pub job_type: String,
    /// JSON-encoded parameter object.
    pub parameters: String,
    #[serde(default)]
    pub payment_amount: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub result_hash: Option<String>,
    #[serde(default)]
    pub result_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
}

/// Which contract events to subscribe to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub contract_address: String,
    pub action: String,
    pub provider: String,
}

impl EventFilter {
    /// New-job events addressed to `provider`.
    pub fn submitted_jobs(contract_address: &str, provider: &str) -> Self {
        Self {
            contract_address: contract_address.to_string(),
            action: "submit_job".to_string(),
            provider: provider.to_string(),
        }
    }

    /// Tendermint event query string.
    pub fn query(&self) -> String {
        format!(
            "wasm._contract_address='{}' AND wasm.action='{}' AND wasm.provider='{}'",
            self.contract_address, self.action, self.provider
        )
    }
}

/// A matching contract event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEvent {
    pub job_id: u64,
}

/// Live event feed. Closes when the underlying connection drops.
pub type EventStream = mpsc::Receiver<LedgerEvent>;

/// The external ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Look up a committed transaction.
    async fn query_tx(&self, hash: &str) -> Result<TxRecord, LedgerError>;

    /// Latest block height, for confirmation counting.
    async fn latest_height(&self) -> Result<u64, LedgerError>;

    /// Sign and broadcast a call.
    async fn execute(&self, call: LedgerCall) -> Result<BroadcastResult, LedgerError>;

    /// Fetch a job from the marketplace contract.
    async fn contract_job(&self, contract: &str, job_id: u64) -> Result<ContractJob, LedgerError>;

    /// Subscribe to contract events.
    async fn subscribe(&self, filter: &EventFilter) -> Result<EventStream, LedgerError>;
}

mod amount_string {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(amount: &u128, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u128, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }
        match Raw::deserialize(d)? {
            Raw::Text(s) => s.trim().parse().map_err(D::Error::custom),
            Raw::Number(n) => Ok(u128::from(n)),
        }
    }
}
