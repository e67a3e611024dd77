//! Stream objects: per-1722-subtype packet build/parse plus diagnostics,
//! unified behind one capability set per direction (tagged variants, no
//! vtables).

pub mod rx;
pub mod tx;

pub use rx::{RxStream, StreamRx};
pub use tx::{StreamTx, TxStream};

use crate::wire::MacAddr;

/// Stream Reservation traffic class. High = 125us measurement interval,
/// Low = 1.333ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SrClass {
    High,
    Low,
}

impl SrClass {
    /// Default measurement interval in nanoseconds for this class.
    #[must_use]
    pub const fn default_interval_ns(self) -> u64 {
        match self {
            Self::High => 125_000,
            Self::Low => 1_333_000,
        }
    }
}

/// Per-stream traffic specification: measurement interval, framing and
/// VLAN/presentation parameters.
#[derive(Debug, Clone)]
pub struct TSpec {
    pub measurement_interval_ns: u64,
    pub max_frame_size: u16,
    pub frames_per_interval: u32,
    pub vlan_id: u16,
    pub vlan_prio: u8,
    pub presentation_offset_ns: u64,
}

impl TSpec {
    #[must_use]
    pub fn for_class(class: SrClass) -> Self {
        Self {
            measurement_interval_ns: class.default_interval_ns(),
            max_frame_size: 1500,
            frames_per_interval: 1,
            vlan_id: 2,
            vlan_prio: if matches!(class, SrClass::High) { 3 } else { 2 },
            presentation_offset_ns: 2_000_000,
        }
    }
}

/// Channel-layout byte semantics for AAF audio, selected by the
/// `compatibility.audio` registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    Saf,
    Legacy,
}

impl Default for ChannelLayout {
    fn default() -> Self {
        Self::Saf
    }
}

/// Audio sample format supported by this core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    S16,
    S32,
    F32,
}

impl SampleFormat {
    #[must_use]
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            Self::S16 => 2,
            Self::S32 | Self::F32 => 4,
        }
    }
}

/// Video payload framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFormat {
    Iec61883,
    Rtp,
}

/// RX stream state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Inactive,
    NoData,
    InvalidData,
    Valid,
}

/// Per-stream diagnostic counters, field-for-field grounded on the original
/// implementation's `IasAvbStreamDiagnostics`.
#[derive(Debug, Clone, Default)]
pub struct StreamDiagnostics {
    pub media_locked: u32,
    pub media_unlocked: u32,
    pub stream_interrupted: u32,
    pub seq_num_mismatch: u32,
    pub media_reset: u32,
    pub timestamp_uncertain: u32,
    pub timestamp_valid: u32,
    pub timestamp_not_valid: u32,
    pub unsupported_format: u32,
    pub late_timestamp: u32,
    pub early_timestamp: u32,
    pub frames_rx: u32,
    pub frames_tx: u32,
    pub reset_count: u32,
}

/// Identity shared by every stream variant, TX or RX.
#[derive(Debug, Clone)]
pub struct StreamIdentity {
    pub stream_id: u64,
    pub dmac: MacAddr,
    pub sr_class: SrClass,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_class_interval_is_125us() {
        assert_eq!(SrClass::High.default_interval_ns(), 125_000);
    }

    #[test]
    fn low_class_interval_is_1333us() {
        assert_eq!(SrClass::Low.default_interval_ns(), 1_333_000);
    }
}
