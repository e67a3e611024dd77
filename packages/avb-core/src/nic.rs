//! NIC driver contract: the boundary this core assumes of an i210-class
//! Ethernet controller with queued, time-triggered packet launch, a
//! credit-based shaper, TX descriptor reclaim and flexible RX filters.
//! The register-level implementation is out of scope; only the trait
//! boundary is specified here.

use crate::error::Result;
use crate::packet::PacketHandle;

/// Index of a hardware TX/RX queue.
pub type QueueIndex = u8;

/// Number of flexible receive filters the direct-DMA RX mode can use.
pub const MAX_RX_FILTERS: usize = 8;

/// A packet paired with its target launch time, as handed to
/// [`NicDriver::send_batch`].
#[derive(Debug, Clone, Copy)]
pub struct LaunchPacket {
    pub handle: PacketHandle,
    pub launch_time_ns: u64,
}

/// Result of a reclaim pass: which handles the hardware has finished
/// transmitting and returned ownership of.
#[derive(Debug, Default, Clone)]
pub struct ReclaimReport {
    pub reclaimed: Vec<PacketHandle>,
}

/// Abstraction over the NIC hardware. Implementations must be internally
/// synchronized: the handle is shared between every TX sequencer and the RX
/// worker, each operating on its own queue index.
pub trait NicDriver: Send + Sync {
    /// Enqueues packets with per-packet hardware launch times on `queue`.
    /// Returns `Err` (typically [`crate::error::Error::TryAgain`]) on
    /// backpressure (ring full); the sequencer treats this as `TxError` and
    /// sleeps one pitch rather than retrying in a hot loop.
    fn send_batch(&self, queue: QueueIndex, packets: &[LaunchPacket]) -> Result<()>;

    /// Walks the queue's "transmitted" descriptor ring and returns
    /// ownership of completed packets to the caller (who returns them to
    /// the pool).
    fn reclaim(&self, queue: QueueIndex) -> Result<ReclaimReport>;

    /// Programs the 802.1Qav credit-based shaper for `queue`.
    fn set_shaper(&self, queue: QueueIndex, idle_slope_kbps: u32, hi_credit: i32) -> Result<()>;

    /// Reads up to `buf.len()` bytes of one received frame from `queue` into
    /// `buf` (direct-DMA / socket RX path); returns the frame length, or
    /// `None` if no frame is currently available.
    fn read_rx(&self, queue: QueueIndex, buf: &mut [u8]) -> Result<Option<usize>>;

    /// True once the link has been confirmed up since the last down event.
    fn link_up(&self) -> bool;
}

#[cfg(test)]
pub mod testutil {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory NIC double: accepts sends unconditionally (unless told to
    /// fail), immediately makes them reclaimable, and serves RX frames from
    /// a pre-loaded queue. Enough to drive the sequencer/engine/RX-engine
    /// test suites without real hardware.
    pub struct SoftwareNic {
        link_up: AtomicBool,
        fail_send: AtomicBool,
        sent: parking_lot::Mutex<Vec<LaunchPacket>>,
        rx_queue: parking_lot::Mutex<VecDeque<Vec<u8>>>,
        shaper_calls: parking_lot::Mutex<Vec<(QueueIndex, u32, i32)>>,
    }

    impl Default for SoftwareNic {
        fn default() -> Self {
            Self {
                link_up: AtomicBool::new(true),
                fail_send: AtomicBool::new(false),
                sent: parking_lot::Mutex::new(Vec::new()),
                rx_queue: parking_lot::Mutex::new(VecDeque::new()),
                shaper_calls: parking_lot::Mutex::new(Vec::new()),
            }
        }
    }

    impl SoftwareNic {
        pub fn set_link(&self, up: bool) {
            self.link_up.store(up, Ordering::SeqCst);
        }

        pub fn set_fail_send(&self, fail: bool) {
            self.fail_send.store(fail, Ordering::SeqCst);
        }

        pub fn push_rx_frame(&self, frame: Vec<u8>) {
            self.rx_queue.lock().push_back(frame);
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock().len()
        }

        pub fn shaper_calls(&self) -> Vec<(QueueIndex, u32, i32)> {
            self.shaper_calls.lock().clone()
        }
    }

    impl NicDriver for SoftwareNic {
        fn send_batch(&self, _queue: QueueIndex, packets: &[LaunchPacket]) -> Result<()> {
            if self.fail_send.load(Ordering::SeqCst) {
                return Err(crate::error::Error::TryAgain);
            }
            self.sent.lock().extend_from_slice(packets);
            Ok(())
        }

        fn reclaim(&self, _queue: QueueIndex) -> Result<ReclaimReport> {
            let handles = self
                .sent
                .lock()
                .drain(..)
                .map(|p| p.handle)
                .collect::<Vec<_>>();
            Ok(ReclaimReport {
                reclaimed: handles,
            })
        }

        fn set_shaper(&self, queue: QueueIndex, idle_slope_kbps: u32, hi_credit: i32) -> Result<()> {
            self.shaper_calls
                .lock()
                .push((queue, idle_slope_kbps, hi_credit));
            Ok(())
        }

        fn read_rx(&self, _queue: QueueIndex, buf: &mut [u8]) -> Result<Option<usize>> {
            let mut q = self.rx_queue.lock();
            match q.pop_front() {
                Some(frame) => {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    Ok(Some(n))
                }
                None => Ok(None),
            }
        }

        fn link_up(&self) -> bool {
            self.link_up.load(Ordering::SeqCst)
        }
    }
}
