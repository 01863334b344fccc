use crate::wire::HDR_SIZE;
use lodestone::shared::{FaultKind, XferError, XferResult};
use serde_derive::Deserialize;

/// Endpoint tunables. Loadable from TOML; every field falls back to its
/// default when absent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Frame size used for provider packet buffers.
    pub mtu: usize,
    /// User bytes carried by one data packet.
    pub max_data_payload: usize,
    /// Completions drained from one transport queue per progress tick.
    pub cq_read_size: usize,

    pub tx_entry_chunk: usize,
    pub rx_entry_chunk: usize,
    pub pkt_chunk: usize,

    /// Target number of internal receive buffers kept posted per transport.
    pub rx_post_depth: usize,

    /// Floor of the per-transfer credit request, in packets.
    pub tx_min_credits: u32,
    /// Credits assumed for a fresh peer and advertised in our handshake.
    pub peer_credits: u32,

    pub backoff_min_us: u64,
    pub backoff_max_us: u64,

    /// How long the receive-buffer quota may sit exhausted before the
    /// watchdog forcibly resets it.
    pub watchdog_interval_ms: u64,

    /// Transfers at least this large go over the rendezvous read protocol
    /// when both sides support it.
    pub read_threshold: usize,

    pub cq_capacity: usize,
    pub min_multi_recv: usize,
    pub zero_copy_recv: bool,

    /// Receive-buffer quota backing flow-control grants.
    pub available_rx_bufs: usize,
}

impl Default for EndpointConfig {
    fn default() -> EndpointConfig {
        EndpointConfig {
            mtu: 8256,
            max_data_payload: 8192,
            cq_read_size: 64,
            tx_entry_chunk: 64,
            rx_entry_chunk: 64,
            pkt_chunk: 64,
            rx_post_depth: 32,
            tx_min_credits: 4,
            peer_credits: 64,
            backoff_min_us: 100,
            backoff_max_us: 100_000,
            watchdog_interval_ms: 1000,
            read_threshold: 1 << 22,
            cq_capacity: 1024,
            min_multi_recv: 64,
            zero_copy_recv: false,
            available_rx_bufs: 256,
        }
    }
}

impl EndpointConfig {
    pub fn from_toml(toml: &str) -> XferResult<EndpointConfig> {
        let config: EndpointConfig =
            serdeconv::from_toml_str(toml).map_err(|_| XferError::Fault(FaultKind::Config))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> XferResult<()> {
        let sane = self.mtu > HDR_SIZE
            && self.max_data_payload > 0
            && self.max_data_payload + HDR_SIZE <= self.mtu
            && self.cq_read_size > 0
            && self.tx_entry_chunk > 0
            && self.rx_entry_chunk > 0
            && self.pkt_chunk > 0
            && self.rx_post_depth > 0
            && self.tx_min_credits > 0
            && self.peer_credits >= self.tx_min_credits
            && self.backoff_min_us > 0
            && self.backoff_max_us >= self.backoff_min_us
            && self.cq_capacity > 0
            && self.available_rx_bufs > 0;

        match sane {
            true => Ok(()),
            false => Err(XferError::Fault(FaultKind::Config)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        EndpointConfig::default().validate().unwrap();
    }

    #[test]
    fn test_from_toml_overrides() {
        let config = EndpointConfig::from_toml(
            r#"
max_data_payload = 1024
mtu = 1500
peer_credits = 16
"#,
        )
        .unwrap();

        assert_eq!(config.max_data_payload, 1024);
        assert_eq!(config.mtu, 1500);
        assert_eq!(config.peer_credits, 16);
        // Untouched fields keep their defaults
        assert_eq!(config.cq_read_size, 64);
    }

    #[test]
    fn test_rejects_payload_larger_than_mtu() {
        let mut config = EndpointConfig::default();
        config.max_data_payload = config.mtu;

        assert_eq!(
            config.validate().unwrap_err(),
            XferError::Fault(FaultKind::Config)
        );
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let result = EndpointConfig::from_toml("mtu = \"not a number\"");
        assert_eq!(result.unwrap_err(), XferError::Fault(FaultKind::Config));
    }
}
