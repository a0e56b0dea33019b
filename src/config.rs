//! Configuration types.
//!
//! Every section has a `Default` matching the provider node's stock settings and
//! is overridable through `MARKET_*` environment variables. Parsing goes through a
//! lookup function so it can be exercised without touching the process env.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;

use crate::error::ConfigError;
use crate::pricing::Tier;

/// Scheduler and worker-pool configuration.
#[derive(Debug, Clone)]
pub struct MarketConfig {
    /// Maximum number of non-terminal jobs admitted at once.
    pub max_jobs: usize,
    /// Fixed number of worker slots.
    pub workers: usize,
    /// How often an idle worker re-checks the queues without a wake-up.
    pub idle_poll_interval: Duration,
    /// Cancel jobs that run past their tier's `max_runtime`.
    pub enforce_max_runtime: bool,
    /// Capacity of each job's progress channel.
    pub progress_buffer: usize,
    /// Terminal jobs older than this are purged by the cleanup sweep.
    pub retention: Duration,
    /// Interval of the background cleanup sweep.
    pub cleanup_interval: Duration,
    /// How long shutdown waits for in-flight work before abandoning it.
    pub shutdown_grace: Duration,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            max_jobs: 10,
            workers: 4,
            idle_poll_interval: Duration::from_millis(500),
            enforce_max_runtime: true,
            progress_buffer: 10,
            retention: Duration::from_secs(24 * 3600), // 1 day
            cleanup_interval: Duration::from_secs(600), // 10 minutes
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Payment-gate configuration.
#[derive(Debug, Clone)]
pub struct PaymentConfig {
    /// Address that must receive client payments.
    pub service_address: String,
    /// Address receiving the fee share of every verified job.
    pub community_address: String,
    /// On-chain denomination of payments.
    pub denom: String,
    /// Base units per whole token (umedas per MEDAS).
    pub units_per_token: u64,
    /// Accepted shortfall as a fraction of the expected amount.
    pub tolerance: Decimal,
    /// Confirmations required when `wait_for_confirmations` is set.
    pub min_confirmations: u64,
    /// Block until the transaction has `min_confirmations`.
    pub wait_for_confirmations: bool,
    /// Upper bound for a single verification, ledger round-trips included.
    pub verification_timeout: Duration,
    /// Poll interval while waiting for confirmations.
    pub confirmation_poll_interval: Duration,
    /// Attempts for each fee-distribution transfer.
    pub fee_max_attempts: u32,
    /// Initial backoff between fee-distribution attempts.
    pub fee_retry_backoff: Duration,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            service_address: String::new(),
            community_address: String::new(),
            denom: "umedas".to_string(),
            units_per_token: 1_000_000,
            tolerance: dec!(0.01),
            min_confirmations: 2,
            wait_for_confirmations: false,
            verification_timeout: Duration::from_secs(30),
            confirmation_poll_interval: Duration::from_secs(2),
            fee_max_attempts: 5,
            fee_retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Ledger endpoint configuration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Cosmos REST (LCD) base URL.
    pub rest_url: String,
    /// Tendermint RPC WebSocket URL used for event subscriptions.
    pub ws_url: String,
    /// External signer that signs and broadcasts ledger calls.
    pub signer_url: String,
    /// Bearer token for the signer, if it requires one.
    pub signer_token: Option<SecretString>,
    /// Timeout applied to every ledger request.
    pub request_timeout: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://api.medas-digital.io:1317".to_string(),
            ws_url: "wss://rpc.medas-digital.io:26657/websocket".to_string(),
            signer_url: "http://127.0.0.1:9090".to_string(),
            signer_token: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Provider event bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Marketplace contract address.
    pub contract_address: String,
    /// This provider's address (events are filtered on it).
    pub provider_address: String,
    /// Display name used at registration.
    pub provider_name: String,
    /// Public base URL where results are served.
    pub endpoint_url: String,
    /// Tier applied to jobs arriving from the contract.
    pub tier: Tier,
    /// Interval between job status polls.
    pub poll_interval: Duration,
    /// Give up waiting for a job after this long.
    pub job_timeout: Duration,
    /// Heartbeat interval; `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// Subscription reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Upper bound of the reconnect backoff.
    pub max_reconnect_backoff: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            contract_address: String::new(),
            provider_address: String::new(),
            provider_name: "compute-provider".to_string(),
            endpoint_url: "http://localhost:8080".to_string(),
            tier: Tier::Standard,
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(30 * 60), // 30 minutes
            heartbeat_interval: Some(Duration::from_secs(5 * 60)),
            max_reconnect_attempts: 10,
            max_reconnect_backoff: Duration::from_secs(60),
        }
    }
}

/// Complete provider configuration.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub market: MarketConfig,
    pub payment: PaymentConfig,
    pub ledger: LedgerConfig,
    pub bridge: BridgeConfig,
}

impl ProviderConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(&lookup);
        let defaults = Self::default();

        let market = MarketConfig {
            max_jobs: env.parse("MARKET_MAX_JOBS")?.unwrap_or(defaults.market.max_jobs),
            workers: env.parse("MARKET_WORKERS")?.unwrap_or(defaults.market.workers),
            enforce_max_runtime: env
                .parse("MARKET_ENFORCE_MAX_RUNTIME")?
                .unwrap_or(defaults.market.enforce_max_runtime),
            retention: env
                .secs("MARKET_RETENTION_SECS")?
                .unwrap_or(defaults.market.retention),
            ..defaults.market
        };
        if market.workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MARKET_WORKERS".to_string(),
                message: "at least one worker is required".to_string(),
            });
        }

        let payment = PaymentConfig {
            service_address: env.required("MARKET_SERVICE_ADDRESS")?,
            community_address: env.required("MARKET_COMMUNITY_ADDRESS")?,
            denom: env.string("MARKET_DENOM").unwrap_or(defaults.payment.denom),
            tolerance: env
                .parse("MARKET_PAYMENT_TOLERANCE")?
                .unwrap_or(defaults.payment.tolerance),
            min_confirmations: env
                .parse("MARKET_MIN_CONFIRMATIONS")?
                .unwrap_or(defaults.payment.min_confirmations),
            wait_for_confirmations: env
                .parse("MARKET_WAIT_FOR_CONFIRMATIONS")?
                .unwrap_or(defaults.payment.wait_for_confirmations),
            verification_timeout: env
                .secs("MARKET_VERIFICATION_TIMEOUT_SECS")?
                .unwrap_or(defaults.payment.verification_timeout),
            ..defaults.payment
        };
        if payment.tolerance < Decimal::ZERO || payment.tolerance >= Decimal::ONE {
            return Err(ConfigError::InvalidValue {
                key: "MARKET_PAYMENT_TOLERANCE".to_string(),
                message: format!("{} is outside [0, 1)", payment.tolerance),
            });
        }

        let ledger = LedgerConfig {
            rest_url: env.string("MARKET_LEDGER_REST_URL").unwrap_or(defaults.ledger.rest_url),
            ws_url: env.string("MARKET_LEDGER_WS_URL").unwrap_or(defaults.ledger.ws_url),
            signer_url: env
                .string("MARKET_SIGNER_URL")
                .unwrap_or(defaults.ledger.signer_url),
            signer_token: env.string("MARKET_SIGNER_TOKEN").map(SecretString::from),
            request_timeout: env
                .secs("MARKET_LEDGER_TIMEOUT_SECS")?
                .unwrap_or(defaults.ledger.request_timeout),
        };

        let heartbeat_interval = match env.parse::<u64>("MARKET_HEARTBEAT_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.bridge.heartbeat_interval,
        };
        let bridge = BridgeConfig {
            contract_address: env.string("MARKET_CONTRACT_ADDRESS").unwrap_or_default(),
            provider_address: env.string("MARKET_PROVIDER_ADDRESS").unwrap_or_default(),
            provider_name: env
                .string("MARKET_PROVIDER_NAME")
                .unwrap_or(defaults.bridge.provider_name),
            endpoint_url: env
                .string("MARKET_ENDPOINT_URL")
                .unwrap_or(defaults.bridge.endpoint_url),
            tier: env.parse("MARKET_BRIDGE_TIER")?.unwrap_or(defaults.bridge.tier),
            heartbeat_interval,
            ..defaults.bridge
        };

        Ok(Self {
            market,
            payment,
            ledger,
            bridge,
        })
    }

    /// Whether the bridge has enough configuration to subscribe to the contract.
    pub fn bridge_enabled(&self) -> bool {
        !self.bridge.contract_address.is_empty() && !self.bridge.provider_address.is_empty()
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.string(key)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()
    }

    fn secs(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_secs))
    }
}
