//! Daemon configuration.
//!
//! Supports loading from a YAML file, with environment variable overrides
//! (`AVB_*`) applied on top, lowered into an `avb_core::ConfigRegistry` for
//! the engine to consume. CLI flags (parsed in `main.rs`) are applied last.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use avb_core::{keys, ConfigRegistry};
use serde::Deserialize;

/// Daemon configuration loaded from YAML with environment overrides.
/// Field names mirror the registry keys of spec §6 without their dotted
/// namespacing (`tx.maxbandwidth.high` -> `tx_maxbandwidth_high`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// NIC interface name to bind TX/RX sockets to.
    /// Override: `AVB_INTERFACE`
    pub interface: String,

    /// Packet pool capacity (total packets across all streams/queues).
    pub packet_pool_capacity: usize,

    pub tspec_interval_high_ns: u64,
    pub tspec_interval_low_ns: u64,
    pub tspec_vlanid_high: u16,
    pub tspec_vlanid_low: u16,
    pub tspec_vlanprio_high: u8,
    pub tspec_vlanprio_low: u8,
    pub tspec_presentation_offset_high_ns: u64,
    pub tspec_presentation_offset_low_ns: u64,

    pub tx_maxbandwidth_high_kbps: u32,
    pub tx_maxbandwidth_low_kbps: u32,
    pub tx_maxframelength_high: u16,
    pub tx_maxframelength_low: u16,
    pub tx_delay_ns: u64,

    pub xmit_window_width_ns: u64,
    pub xmit_window_pitch_ns: u64,
    pub xmit_window_cue_threshold_ns: u64,
    pub xmit_window_prefetch_threshold_ns: u64,
    pub xmit_window_max_reset_count: u32,
    pub xmit_window_max_drop_count: u32,
    pub xmit_strict_pkt_order: bool,

    /// Override: `AVB_RECEIVE_IDLEWAIT_NS`
    pub receive_idlewait_ns: u64,
    pub rx_ignore_stream_id: bool,
    pub rx_discard_after: u64,
    pub rx_socket_rxbufsize: u64,
    pub rx_direct_dma: bool,

    pub clock_hwcapture_nominal_mhz: u64,
    pub clock_hwcapture_time_constant_ms: u64,
    pub clockdriver_filename: Option<String>,

    pub sched_policy: String,
    pub sched_priority: i64,

    pub local_alsa_frames: u64,
    pub local_alsa_periods: u64,
    pub local_alsa_basefreq: u64,
    pub local_alsa_baseperiod: u64,

    /// "SAF" or "legacy".
    pub compatibility_audio: String,

    /// Directory for persistent state (preconfigured RX streams, etc).
    /// Override: `AVB_DATA_DIR`
    pub data_dir: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            packet_pool_capacity: 256,

            tspec_interval_high_ns: 125_000,
            tspec_interval_low_ns: 1_333_000,
            tspec_vlanid_high: 2,
            tspec_vlanid_low: 2,
            tspec_vlanprio_high: 3,
            tspec_vlanprio_low: 2,
            tspec_presentation_offset_high_ns: 2_000_000,
            tspec_presentation_offset_low_ns: 2_000_000,

            tx_maxbandwidth_high_kbps: 50_000,
            tx_maxbandwidth_low_kbps: 50_000,
            tx_maxframelength_high: 1500,
            tx_maxframelength_low: 1500,
            tx_delay_ns: 0,

            xmit_window_width_ns: 250_000,
            xmit_window_pitch_ns: 125_000,
            xmit_window_cue_threshold_ns: 100_000,
            xmit_window_prefetch_threshold_ns: 500_000,
            xmit_window_max_reset_count: 10,
            xmit_window_max_drop_count: 5,
            xmit_strict_pkt_order: false,

            receive_idlewait_ns: 200_000_000,
            rx_ignore_stream_id: false,
            rx_discard_after: 8,
            rx_socket_rxbufsize: 1 << 20,
            rx_direct_dma: false,

            clock_hwcapture_nominal_mhz: 0,
            clock_hwcapture_time_constant_ms: 1000,
            clockdriver_filename: None,

            sched_policy: "fifo".to_string(),
            sched_priority: 1,

            local_alsa_frames: 1024,
            local_alsa_periods: 4,
            local_alsa_basefreq: 48_000,
            local_alsa_baseperiod: 256,

            compatibility_audio: "SAF".to_string(),
            data_dir: None,
        }
    }
}

impl DaemonConfig {
    /// Loads configuration from a YAML file (if given), then applies
    /// `AVB_*` environment variable overrides.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or fails to parse.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("AVB_INTERFACE") {
            self.interface = val;
        }
        if let Ok(val) = std::env::var("AVB_RECEIVE_IDLEWAIT_NS") {
            if let Ok(ns) = val.parse() {
                self.receive_idlewait_ns = ns;
            }
        }
        if let Ok(val) = std::env::var("AVB_TX_MAXBANDWIDTH_HIGH_KBPS") {
            if let Ok(kbps) = val.parse() {
                self.tx_maxbandwidth_high_kbps = kbps;
            }
        }
        if let Ok(val) = std::env::var("AVB_TX_MAXBANDWIDTH_LOW_KBPS") {
            if let Ok(kbps) = val.parse() {
                self.tx_maxbandwidth_low_kbps = kbps;
            }
        }
        // AVB_DATA_DIR is handled by clap via #[arg(env = ...)] in main.rs.
    }

    /// Lowers this configuration into a fresh [`ConfigRegistry`] for
    /// `avb_core::EngineContext::new`.
    #[must_use]
    pub fn to_registry(&self) -> ConfigRegistry {
        let reg = ConfigRegistry::new();
        reg.set(keys::NW_IF_NAME, self.interface.as_str());

        reg.set(keys::TSPEC_INTERVAL_HIGH, self.tspec_interval_high_ns);
        reg.set(keys::TSPEC_INTERVAL_LOW, self.tspec_interval_low_ns);
        reg.set(keys::TSPEC_VLANID_HIGH, u64::from(self.tspec_vlanid_high));
        reg.set(keys::TSPEC_VLANID_LOW, u64::from(self.tspec_vlanid_low));
        reg.set(keys::TSPEC_VLANPRIO_HIGH, u64::from(self.tspec_vlanprio_high));
        reg.set(keys::TSPEC_VLANPRIO_LOW, u64::from(self.tspec_vlanprio_low));
        reg.set(keys::TSPEC_PRES_OFFSET_HIGH, self.tspec_presentation_offset_high_ns);
        reg.set(keys::TSPEC_PRES_OFFSET_LOW, self.tspec_presentation_offset_low_ns);

        reg.set(keys::TX_MAXBANDWIDTH_HIGH, u64::from(self.tx_maxbandwidth_high_kbps));
        reg.set(keys::TX_MAXBANDWIDTH_LOW, u64::from(self.tx_maxbandwidth_low_kbps));
        reg.set(keys::TX_MAXFRAMELENGTH_HIGH, u64::from(self.tx_maxframelength_high));
        reg.set(keys::TX_MAXFRAMELENGTH_LOW, u64::from(self.tx_maxframelength_low));
        reg.set(keys::TX_DELAY, self.tx_delay_ns);

        reg.set(keys::XMIT_WINDOW_WIDTH, self.xmit_window_width_ns);
        reg.set(keys::XMIT_WINDOW_PITCH, self.xmit_window_pitch_ns);
        reg.set(keys::XMIT_WINDOW_CUE_THRESHOLD, self.xmit_window_cue_threshold_ns);
        reg.set(keys::XMIT_WINDOW_PREFETCH_THRESHOLD, self.xmit_window_prefetch_threshold_ns);
        reg.set(keys::XMIT_WINDOW_MAX_RESET_COUNT, u64::from(self.xmit_window_max_reset_count));
        reg.set(keys::XMIT_WINDOW_MAX_DROP_COUNT, u64::from(self.xmit_window_max_drop_count));
        reg.set(keys::XMIT_STRICT_PKT_ORDER, self.xmit_strict_pkt_order);

        reg.set(keys::RECEIVE_IDLEWAIT, self.receive_idlewait_ns);
        reg.set(keys::RX_IGNORE_STREAM_ID, self.rx_ignore_stream_id);
        reg.set(keys::RX_DISCARD_AFTER, self.rx_discard_after);
        reg.set(keys::RX_SOCKET_RXBUFSIZE, self.rx_socket_rxbufsize);
        reg.set(keys::RX_DIRECT_DMA, self.rx_direct_dma);

        reg.set(keys::CLOCK_HWCAPTURE_NOMINAL, self.clock_hwcapture_nominal_mhz);
        reg.set(keys::CLOCK_HWCAPTURE_TIME_CONSTANT, self.clock_hwcapture_time_constant_ms);
        if let Some(filename) = &self.clockdriver_filename {
            reg.set(keys::CLOCKDRIVER_FILENAME, filename.as_str());
        }

        reg.set(keys::SCHED_POLICY, self.sched_policy.as_str());
        reg.set(keys::SCHED_PRIORITY, self.sched_priority as u64);

        reg.set(keys::LOCAL_ALSA_FRAMES, self.local_alsa_frames);
        reg.set(keys::LOCAL_ALSA_PERIODS, self.local_alsa_periods);
        reg.set(keys::LOCAL_ALSA_BASEFREQ, self.local_alsa_basefreq);
        reg.set(keys::LOCAL_ALSA_BASEPERIOD, self.local_alsa_baseperiod);

        reg.set(keys::COMPATIBILITY_AUDIO, self.compatibility_audio.as_str());
        reg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_lowers_to_registry_without_panicking() {
        let cfg = DaemonConfig::default();
        let reg = cfg.to_registry();
        assert_eq!(reg.get_str(keys::NW_IF_NAME, ""), "eth0");
        assert_eq!(reg.get_u64(keys::TX_MAXBANDWIDTH_HIGH, 0), 50_000);
    }
}
