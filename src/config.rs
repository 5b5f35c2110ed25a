use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};
use crate::types::U256;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Name this node is known by on the inter-node transport.
    pub node_name: String,
    pub data_dir: PathBuf,
    pub rpc_listen: SocketAddr,
    #[serde(default)]
    pub sequencer: SequencerConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub engine: TransactionEngineConfig,
    #[serde(default)]
    pub gas_price: GasPriceConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

impl NodeConfig {
    pub fn load(path: &Path) -> EngineResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| EngineError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> EngineResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| EngineError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> EngineResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "node1".to_string(),
            data_dir: PathBuf::from("./data"),
            rpc_listen: "127.0.0.1:8548".parse().expect("valid socket addr"),
            sequencer: SequencerConfig::default(),
            writer: WriterConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            engine: TransactionEngineConfig::default(),
            gas_price: GasPriceConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// How long a sequencer with no in-flight transactions lingers before
    /// it is retired.
    #[serde(default = "default_stale_timeout_ms")]
    pub stale_timeout_ms: u64,
    /// Assemblies in flight at once per sequencer. State reservations
    /// require this to stay at 1.
    #[serde(default = "default_assembly_concurrency")]
    pub assembly_concurrency: usize,
    /// Per-request endorsement timeout before the request is re-sent.
    #[serde(default = "default_endorsement_request_timeout_ms")]
    pub endorsement_request_timeout_ms: u64,
    /// Soft deadline for a whole attestation plan; on breach the
    /// transaction is re-driven.
    #[serde(default = "default_endorsement_gather_timeout_ms")]
    pub endorsement_gather_timeout_ms: u64,
    /// Re-drives after gather deadline breaches before the transaction is
    /// finalized as reverted.
    #[serde(default = "default_max_redrives")]
    pub max_redrives: u32,
}

impl SequencerConfig {
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms)
    }

    pub fn endorsement_request_timeout(&self) -> Duration {
        Duration::from_millis(self.endorsement_request_timeout_ms)
    }

    pub fn endorsement_gather_timeout(&self) -> Duration {
        Duration::from_millis(self.endorsement_gather_timeout_ms)
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            stale_timeout_ms: default_stale_timeout_ms(),
            assembly_concurrency: default_assembly_concurrency(),
            endorsement_request_timeout_ms: default_endorsement_request_timeout_ms(),
            endorsement_gather_timeout_ms: default_endorsement_gather_timeout_ms(),
            max_redrives: default_max_redrives(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriterConfig {
    #[serde(default = "default_writer_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_writer_batch_max_size")]
    pub batch_max_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            worker_count: default_writer_worker_count(),
            batch_max_size: default_writer_batch_max_size(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound on concurrently live per-signer orchestrators.
    #[serde(default = "default_max_in_flight_orchestrators")]
    pub max_in_flight_orchestrators: usize,
    /// Unconfirmed transactions one orchestrator keeps in its submission
    /// window; further rows wait until the window drains.
    #[serde(default = "default_max_in_flight_per_signer")]
    pub max_in_flight_per_signer: usize,
    /// Interval between submission sweeps within one orchestrator.
    #[serde(default = "default_orchestrator_interval_ms")]
    pub interval_ms: u64,
    /// How long a submitted transaction may sit unconfirmed before it is
    /// resubmitted with a bumped gas price.
    #[serde(default = "default_resubmit_interval_ms")]
    pub resubmit_interval_ms: u64,
}

impl OrchestratorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn resubmit_interval(&self) -> Duration {
        Duration::from_millis(self.resubmit_interval_ms)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_in_flight_orchestrators: default_max_in_flight_orchestrators(),
            max_in_flight_per_signer: default_max_in_flight_per_signer(),
            interval_ms: default_orchestrator_interval_ms(),
            resubmit_interval_ms: default_resubmit_interval_ms(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionEngineConfig {
    #[serde(default = "default_max_overload_process_time_ms")]
    pub max_overload_process_time_ms: u64,
    #[serde(default = "default_max_stale_time_ms")]
    pub max_stale_time_ms: u64,
    #[serde(default = "default_max_idle_time_ms")]
    pub max_idle_time_ms: u64,
    #[serde(default = "default_engine_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl TransactionEngineConfig {
    pub fn max_overload_process_time(&self) -> Duration {
        Duration::from_millis(self.max_overload_process_time_ms)
    }

    pub fn max_stale_time(&self) -> Duration {
        Duration::from_millis(self.max_stale_time_ms)
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.max_idle_time_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for TransactionEngineConfig {
    fn default() -> Self {
        Self {
            max_overload_process_time_ms: default_max_overload_process_time_ms(),
            max_stale_time_ms: default_max_stale_time_ms(),
            max_idle_time_ms: default_max_idle_time_ms(),
            interval_ms: default_engine_interval_ms(),
            retry: RetryConfig::default(),
        }
    }
}

/// Capped exponential backoff for transient failures.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_retry_factor")]
    pub factor: f64,
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
}

impl RetryConfig {
    /// Delay before attempt `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.factor.powi(attempt as i32);
        Duration::from_millis((base as u64).min(self.max_delay_ms))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_retry_initial_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            factor: default_retry_factor(),
            max_attempts: default_retry_max_attempts(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GasPriceConfig {
    /// Percentage bump applied on each resubmission.
    #[serde(default = "default_gas_increase_percentage")]
    pub increase_percentage: u64,
    /// Absolute ceiling for bumped gas prices.
    #[serde(default)]
    pub increase_max: Option<U256>,
    /// Fixed gas price; bypasses the node estimate entirely.
    #[serde(default)]
    pub fixed: Option<U256>,
    #[serde(default = "default_use_node_estimate")]
    pub use_node_estimate: bool,
}

impl Default for GasPriceConfig {
    fn default() -> Self {
        Self {
            increase_percentage: default_gas_increase_percentage(),
            increase_max: None,
            fixed: None,
            use_node_estimate: default_use_node_estimate(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Known peers, `name -> address`. The in-process transport ignores the
    /// address part; a socket transport dials it.
    #[serde(default)]
    pub peers: std::collections::HashMap<String, String>,
    #[serde(default = "default_delegation_ack_timeout_ms")]
    pub delegation_ack_timeout_ms: u64,
}

impl TransportConfig {
    pub fn delegation_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.delegation_ack_timeout_ms)
    }
}

fn default_stale_timeout_ms() -> u64 {
    60_000
}

fn default_assembly_concurrency() -> usize {
    1
}

fn default_endorsement_request_timeout_ms() -> u64 {
    2_000
}

fn default_endorsement_gather_timeout_ms() -> u64 {
    30_000
}

fn default_max_redrives() -> u32 {
    3
}

fn default_writer_worker_count() -> usize {
    4
}

fn default_writer_batch_max_size() -> usize {
    50
}

fn default_max_in_flight_orchestrators() -> usize {
    50
}

fn default_max_in_flight_per_signer() -> usize {
    500
}

fn default_orchestrator_interval_ms() -> u64 {
    100
}

fn default_resubmit_interval_ms() -> u64 {
    5_000
}

fn default_max_overload_process_time_ms() -> u64 {
    600_000
}

fn default_max_stale_time_ms() -> u64 {
    60_000
}

fn default_max_idle_time_ms() -> u64 {
    10_000
}

fn default_engine_interval_ms() -> u64 {
    500
}

fn default_retry_initial_delay_ms() -> u64 {
    250
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_retry_factor() -> f64 {
    2.0
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_gas_increase_percentage() -> u64 {
    50
}

fn default_use_node_estimate() -> bool {
    true
}

fn default_delegation_ack_timeout_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let config = NodeConfig::default();
        let encoded = toml::to_string_pretty(&config).expect("encode");
        let decoded: NodeConfig = toml::from_str(&encoded).expect("decode");
        assert_eq!(decoded.node_name, config.node_name);
        assert_eq!(
            decoded.sequencer.assembly_concurrency,
            config.sequencer.assembly_concurrency
        );
        assert_eq!(decoded.orchestrator.max_in_flight_orchestrators, 50);
        assert_eq!(decoded.orchestrator.max_in_flight_per_signer, 500);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let decoded: NodeConfig = toml::from_str(
            r#"
node_name = "node2"
data_dir = "./data"
rpc_listen = "127.0.0.1:9000"
"#,
        )
        .expect("decode");
        assert_eq!(decoded.sequencer.assembly_concurrency, 1);
        assert_eq!(decoded.engine.retry.max_attempts, 5);
        assert!(decoded.gas_price.use_node_estimate);
    }

    #[test]
    fn retry_delay_is_capped() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay(0), Duration::from_millis(250));
        assert_eq!(retry.delay(1), Duration::from_millis(500));
        assert_eq!(retry.delay(20), Duration::from_millis(10_000));
    }
}
