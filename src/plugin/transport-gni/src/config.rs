use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fabric_api::{GNIX_DOM_NAME, GNIX_INJECT_SIZE, GNIX_MAX_MSG_SIZE};
use fabric_common::logging::LogConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GniConfig {
    /// Name a domain must carry in its attributes, if it names one at all.
    pub domain_name: String,
    /// Consecutive backpressure answers a replayable request tolerates
    /// before it fails.
    pub max_retries: u32,
    /// Upper bound, in progress calls, of the pause after a backpressure.
    pub retry_backoff_cap: u32,
    /// Whether transmit requests are replayed after backpressure at all.
    /// When off, the first backpressure answer fails the request.
    pub replay_backpressured: bool,
    /// Largest chunk handed to the driver in one post.
    pub max_transfer_size: u64,
    pub inject_size: usize,
    /// Bound datagrams per CM NIC, one per handshake in flight.
    pub n_bnd_dgrams: usize,
    /// Wildcard datagrams per CM NIC, accepting handshakes from peers.
    pub n_wc_dgrams: usize,
    pub datagram_timeout_ms: u64,
    pub max_nics_per_domain: usize,
    /// Depth of the device completion queue behind each NIC.
    pub tx_cq_size: usize,
    /// Size of a completion queue opened without one.
    pub cq_size: usize,
    /// Chunks a virtual connection posts per progress call.
    pub progress_budget: usize,
    /// Requests a single endpoint may hold before submission reports
    /// would-block.
    pub ep_queue_depth: usize,
    /// Progress passes an endpoint close spends draining posted requests.
    pub close_drain_iters: usize,
    pub log: LogConfig,
}

impl Default for GniConfig {
    fn default() -> Self {
        GniConfig {
            domain_name: String::from(GNIX_DOM_NAME),
            max_retries: 5,
            retry_backoff_cap: 8,
            replay_backpressured: true,
            max_transfer_size: GNIX_MAX_MSG_SIZE,
            inject_size: GNIX_INJECT_SIZE,
            n_bnd_dgrams: 128,
            n_wc_dgrams: 4,
            datagram_timeout_ms: 1000,
            max_nics_per_domain: 1,
            tx_cq_size: 2048,
            cq_size: 1024,
            progress_budget: 64,
            ep_queue_depth: 4096,
            close_drain_iters: 1024,
            log: LogConfig::default(),
        }
    }
}

impl GniConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config = toml::from_str(content)?;
        Ok(config)
    }

    #[inline]
    pub fn datagram_timeout(&self) -> Duration {
        Duration::from_millis(self.datagram_timeout_ms)
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.max_transfer_size == 0 {
            return Err(crate::Error::inval("max_transfer_size must be positive"));
        }
        if self.n_bnd_dgrams == 0 {
            return Err(crate::Error::inval("n_bnd_dgrams must be positive"));
        }
        if self.max_nics_per_domain == 0 {
            return Err(crate::Error::inval("max_nics_per_domain must be positive"));
        }
        if self.progress_budget == 0 {
            return Err(crate::Error::inval("progress_budget must be positive"));
        }
        if self.ep_queue_depth == 0 {
            return Err(crate::Error::inval("ep_queue_depth must be positive"));
        }
        Ok(())
    }
}
