//! Configuration registry: a key-value store consulted by every component
//! instead of hardcoded constants. Recognized keys and their defaults
//! mirror a hardware AVB stack's registry key table.

use std::collections::HashMap;

use parking_lot::RwLock;

/// A value held in the [`ConfigRegistry`].
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryValue {
    U64(u64),
    Str(String),
    Bool(bool),
}

impl From<u64> for RegistryValue {
    fn from(v: u64) -> Self {
        Self::U64(v)
    }
}

impl From<&str> for RegistryValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for RegistryValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<bool> for RegistryValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Well-known registry key names, grouped by the component that consumes
/// them. Kept as plain `&'static str` constants rather than an enum so that
/// unrecognized keys set by a configuration plugin do not need a variant.
pub mod keys {
    pub const NW_IF_NAME: &str = "network.interface.name";
    pub const NW_IF_PTP_DEV: &str = "network.interface.ptp.dev";

    pub const TSPEC_INTERVAL_HIGH: &str = "tspec.interval.high";
    pub const TSPEC_INTERVAL_LOW: &str = "tspec.interval.low";
    pub const TSPEC_VLANID_HIGH: &str = "tspec.vlanid.high";
    pub const TSPEC_VLANID_LOW: &str = "tspec.vlanid.low";
    pub const TSPEC_VLANPRIO_HIGH: &str = "tspec.vlanprio.high";
    pub const TSPEC_VLANPRIO_LOW: &str = "tspec.vlanprio.low";
    pub const TSPEC_PRES_OFFSET_HIGH: &str = "tspec.presentation.time.offset.high";
    pub const TSPEC_PRES_OFFSET_LOW: &str = "tspec.presentation.time.offset.low";

    pub const TX_MAXSTREAMS_HIGH: &str = "tx.maxstreams.high";
    pub const TX_MAXSTREAMS_LOW: &str = "tx.maxstreams.low";
    pub const TX_MAXBANDWIDTH_HIGH: &str = "tx.maxbandwidth.high";
    pub const TX_MAXBANDWIDTH_LOW: &str = "tx.maxbandwidth.low";
    pub const TX_MAXFRAMELENGTH_HIGH: &str = "tx.maxframelength.high";
    pub const TX_MAXFRAMELENGTH_LOW: &str = "tx.maxframelength.low";
    pub const TX_DELAY: &str = "tx.delay";

    pub const XMIT_WINDOW_WIDTH: &str = "xmit.window.width";
    pub const XMIT_WINDOW_PITCH: &str = "xmit.window.pitch";
    pub const XMIT_WINDOW_CUE_THRESHOLD: &str = "xmit.window.cue_threshold";
    pub const XMIT_WINDOW_RESET_THRESHOLD: &str = "xmit.window.reset_threshold";
    pub const XMIT_WINDOW_PREFETCH_THRESHOLD: &str = "xmit.window.prefetch_threshold";
    pub const XMIT_WINDOW_MAX_RESET_COUNT: &str = "xmit.window.max_reset_count";
    pub const XMIT_WINDOW_MAX_DROP_COUNT: &str = "xmit.window.max_drop_count";
    pub const XMIT_STRICT_PKT_ORDER: &str = "xmit.strict_pkt_order";

    pub const RECEIVE_IDLEWAIT: &str = "receive.idlewait";
    pub const RX_IGNORE_STREAM_ID: &str = "rx.ignore.stream_id";
    pub const RX_DISCARD_AFTER: &str = "rx.discard_after";
    pub const RX_SOCKET_RXBUFSIZE: &str = "rx.socket.rxbufsize";
    pub const RX_DIRECT_DMA: &str = "rx.direct_dma";

    pub const CLOCK_HWCAPTURE_NOMINAL: &str = "clock.hwcapture.nominal";
    pub const CLOCK_HWCAPTURE_TIME_CONSTANT: &str = "clock.hwcapture.time_constant";
    pub const CLOCKDRIVER_FILENAME: &str = "clockdriver.filename";

    pub const SCHED_POLICY: &str = "sched.policy";
    pub const SCHED_PRIORITY: &str = "sched.priority";

    pub const LOCAL_ALSA_FRAMES: &str = "local.alsa.frames";
    pub const LOCAL_ALSA_PERIODS: &str = "local.alsa.periods";
    pub const LOCAL_ALSA_BASEFREQ: &str = "local.alsa.basefreq";
    pub const LOCAL_ALSA_BASEPERIOD: &str = "local.alsa.baseperiod";
    pub const ALSA_GROUPNAME: &str = "alsa.groupname";
    pub const VIDEO_GROUPNAME: &str = "video.groupname";

    pub const COMPATIBILITY_AUDIO: &str = "compatibility.audio";
}

/// Key-value configuration store, with typed accessors and documented
/// defaults for every key recognized by the engine.
///
/// Unknown keys are accepted (a configuration plugin may define
/// implementation-specific keys the core never reads); they are simply not
/// consulted by any component.
pub struct ConfigRegistry {
    values: RwLock<HashMap<String, RegistryValue>>,
}

impl Default for ConfigRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigRegistry {
    /// Creates an empty registry; accessors fall back to hardcoded defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
        }
    }

    /// Sets a key to a value, overwriting any previous value.
    pub fn set(&self, key: &str, value: impl Into<RegistryValue>) {
        self.values.write().insert(key.to_string(), value.into());
    }

    /// Returns the raw stored value for `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<RegistryValue> {
        self.values.read().get(key).cloned()
    }

    /// Returns the `u64` value for `key`, or `default` if absent or of the
    /// wrong type.
    #[must_use]
    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        match self.get(key) {
            Some(RegistryValue::U64(v)) => v,
            _ => default,
        }
    }

    /// Returns the string value for `key`, or `default` if absent or of the
    /// wrong type.
    #[must_use]
    pub fn get_str(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Some(RegistryValue::Str(v)) => v,
            _ => default.to_string(),
        }
    }

    /// Returns the boolean value for `key`, or `default` if absent or of the
    /// wrong type.
    #[must_use]
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(RegistryValue::Bool(v)) => v,
            _ => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_key_returns_default() {
        let reg = ConfigRegistry::new();
        assert_eq!(reg.get_u64(keys::TX_DELAY, 42), 42);
    }

    #[test]
    fn set_then_get_round_trips() {
        let reg = ConfigRegistry::new();
        reg.set(keys::NW_IF_NAME, "eth0");
        assert_eq!(reg.get_str(keys::NW_IF_NAME, ""), "eth0");
    }

    #[test]
    fn wrong_type_falls_back_to_default() {
        let reg = ConfigRegistry::new();
        reg.set(keys::TX_DELAY, "not-a-number");
        assert_eq!(reg.get_u64(keys::TX_DELAY, 100), 100);
    }
}
