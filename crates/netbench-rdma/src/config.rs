//! Tuning for the reliable-connection transport.
//!
//! Every rank must load the same values: the queue pair attributes below are
//! applied symmetrically on both ends of each connection.

use netbench_verbs::Mtu;
use serde::{Deserialize, Serialize};

/// When connections to peers are set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectMode {
    /// Connect to every peer while the transport is created.
    Eager,
    /// Connect on first use. Not supported; rejected at creation.
    OnDemand,
}

/// Configuration of an [`RcTransport`](crate::RcTransport).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RcConfig {
    /// Index of the device to open in the provider's device list.
    #[serde(default)]
    pub device_index: usize,

    /// HCA port used by every queue pair.
    #[serde(default = "default_port_num")]
    pub port_num: u8,

    #[serde(default = "default_connect_mode")]
    pub connect_mode: ConnectMode,

    /// Path MTU applied on RTR.
    #[serde(default = "default_path_mtu")]
    pub path_mtu: Mtu,

    /// Entries of each send and receive completion queue.
    #[serde(default = "default_cq_entries")]
    pub cq_entries: u32,

    #[serde(default = "default_max_wr")]
    pub max_send_wr: u32,

    #[serde(default = "default_max_wr")]
    pub max_recv_wr: u32,

    #[serde(default = "default_max_sge")]
    pub max_sge: u32,

    /// P-Key index.
    #[serde(default)]
    pub pkey_index: u16,

    /// Starting packet sequence number, sent to the peer during the exchange.
    #[serde(default)]
    pub start_psn: u32,

    /// QP timeout exponent. The actual timeout is `4.096us * 2^timeout`.
    #[serde(default = "default_timeout")]
    pub timeout: u8,

    /// Number of transport-level retries.
    #[serde(default = "default_retry_cnt")]
    pub retry_cnt: u8,

    /// Number of RNR retries; 7 means retry forever.
    #[serde(default = "default_rnr_retry")]
    pub rnr_retry: u8,

    /// Minimum RNR NAK timer code advertised on RTR.
    #[serde(default = "default_min_rnr_timer")]
    pub min_rnr_timer: u8,

    /// Outstanding RDMA reads/atomics, both as initiator and as target.
    #[serde(default = "default_max_rd_atomic")]
    pub max_rd_atomic: u8,

    /// Busy receive posts tolerated before a drain cycle.
    #[serde(default = "default_recv_post_retries")]
    pub recv_post_retries: u32,

    /// Pages walked backwards when resolving an address to its region.
    #[serde(default = "default_probe_limit")]
    pub probe_limit: usize,

    /// Retries of one operation after retryable completion errors.
    /// Unbounded when absent.
    #[serde(default)]
    pub max_completion_retries: Option<u32>,

    /// Completion queue polls per wait before giving up. Unbounded when absent.
    #[serde(default)]
    pub max_poll_spins: Option<u64>,
}

fn default_port_num() -> u8 {
    1
}
fn default_connect_mode() -> ConnectMode {
    ConnectMode::Eager
}
fn default_path_mtu() -> Mtu {
    Mtu::Mtu1024
}
fn default_cq_entries() -> u32 {
    128
}
fn default_max_wr() -> u32 {
    64
}
fn default_max_sge() -> u32 {
    1
}
fn default_timeout() -> u8 {
    14
}
fn default_retry_cnt() -> u8 {
    7
}
fn default_rnr_retry() -> u8 {
    7
}
fn default_min_rnr_timer() -> u8 {
    12
}
fn default_max_rd_atomic() -> u8 {
    1
}
fn default_recv_post_retries() -> u32 {
    8
}
fn default_probe_limit() -> usize {
    1000
}

impl Default for RcConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            port_num: default_port_num(),
            connect_mode: default_connect_mode(),
            path_mtu: default_path_mtu(),
            cq_entries: default_cq_entries(),
            max_send_wr: default_max_wr(),
            max_recv_wr: default_max_wr(),
            max_sge: default_max_sge(),
            pkey_index: 0,
            start_psn: 0,
            timeout: default_timeout(),
            retry_cnt: default_retry_cnt(),
            rnr_retry: default_rnr_retry(),
            min_rnr_timer: default_min_rnr_timer(),
            max_rd_atomic: default_max_rd_atomic(),
            recv_post_retries: default_recv_post_retries(),
            probe_limit: default_probe_limit(),
            max_completion_retries: None,
            max_poll_spins: None,
        }
    }
}

impl RcConfig {
    /// Whether `retries` retryable failures still allow another attempt.
    pub(crate) fn may_retry(&self, retries: u32) -> bool {
        self.max_completion_retries.map_or(true, |max| retries < max)
    }

    /// Whether a wait that has polled `spins` times may keep polling.
    pub(crate) fn may_spin(&self, spins: u64) -> bool {
        self.max_poll_spins.map_or(true, |max| spins < max)
    }
}
