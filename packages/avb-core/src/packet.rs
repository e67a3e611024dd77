//! Fixed-size, refcount-free packet pool.
//!
//! A [`PacketPool`] allocates its backing store once and distributes
//! [`PacketHandle`]s through [`PacketPool::get`]/[`PacketPool::put`]. This
//! avoids per-packet allocation in the TX hot loop and bounds worst-case
//! memory use. Ownership of a handle is meant to transition one-way per
//! sequencer iteration: free-list -> a stream's ready queue -> an in-flight
//! NIC descriptor -> the reclaim path -> free-list.

use crate::error::{Error, Result};

/// Maximum Ethernet frame payload a [`Packet`] can carry (VLAN-tagged AVTP
/// frame, including header).
pub const MAX_FRAME_LEN: usize = 1522;

/// Per-packet metadata flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// Filler packet sent to keep the shaper draining credit when a
    /// stream has nothing to send; carries no real payload.
    pub const DUMMY: Self = Self(0b0000_0001);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

/// A fixed-capacity frame buffer plus the metadata the TX sequencer and NIC
/// driver need to schedule and reclaim it.
#[derive(Debug, Clone)]
pub struct Packet {
    buf: [u8; MAX_FRAME_LEN],
    payload_len: usize,
    pub launch_time_ns: u64,
    pub flags: PacketFlags,
    pool_index: u32,
}

impl Packet {
    fn new(pool_index: u32) -> Self {
        Self {
            buf: [0u8; MAX_FRAME_LEN],
            payload_len: 0,
            launch_time_ns: 0,
            flags: PacketFlags::empty(),
            pool_index,
        }
    }

    /// Returns the populated portion of the frame buffer.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.payload_len]
    }

    /// Returns a mutable view of the whole backing buffer, for in-place
    /// frame construction, plus lets the caller set the final length via
    /// [`Packet::set_payload_len`].
    pub fn buf_mut(&mut self) -> &mut [u8; MAX_FRAME_LEN] {
        &mut self.buf
    }

    /// Sets how many bytes of `buf_mut()` are valid payload.
    pub fn set_payload_len(&mut self, len: usize) {
        debug_assert!(len <= MAX_FRAME_LEN);
        self.payload_len = len.min(MAX_FRAME_LEN);
    }

    /// The pool slot this packet occupies; stable for the packet's lifetime.
    #[must_use]
    pub fn pool_index(&self) -> u32 {
        self.pool_index
    }
}

/// An owned reference to a pool slot. Only the owning [`PacketPool`] can
/// dereference it (via [`PacketPool::packet`]/[`PacketPool::packet_mut`]),
/// so a handle by itself cannot be used to access freed memory out from
/// under the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHandle(u32);

impl PacketHandle {
    /// The underlying pool slot index (used by NIC descriptor bookkeeping).
    #[must_use]
    pub fn index(&self) -> u32 {
        self.0
    }
}

/// Fixed array of packets allocated once at construction and handed out
/// round-robin via a free-list. Invariant: `|free| + |in_flight| ==
/// capacity`, checked by the unit tests below.
pub struct PacketPool {
    slots: Vec<parking_lot::Mutex<Packet>>,
    free: parking_lot::Mutex<Vec<u32>>,
    capacity: usize,
}

impl PacketPool {
    /// Allocates `capacity` packet slots, all initially free.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|i| parking_lot::Mutex::new(Packet::new(i as u32)))
            .collect();
        let free = (0..capacity as u32).rev().collect();
        Self {
            slots,
            free: parking_lot::Mutex::new(free),
            capacity,
        }
    }

    /// Total number of slots, free or in-flight.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of currently free slots.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Takes one packet from the free-list, clearing its previous contents.
    pub fn get(&self) -> Result<PacketHandle> {
        let mut free = self.free.lock();
        match free.pop() {
            Some(idx) => {
                let mut pkt = self.slots[idx as usize].lock();
                pkt.payload_len = 0;
                pkt.launch_time_ns = 0;
                pkt.flags = PacketFlags::empty();
                Ok(PacketHandle(idx))
            }
            None => Err(Error::OutOfMemory),
        }
    }

    /// Returns a packet to the free-list. Returning the same handle twice is
    /// a logic error and is rejected in debug builds.
    pub fn put(&self, handle: PacketHandle) {
        let mut free = self.free.lock();
        debug_assert!(
            !free.contains(&handle.0),
            "double free of packet pool slot {}",
            handle.0
        );
        free.push(handle.0);
    }

    /// Runs `f` with shared access to the packet behind `handle`.
    pub fn with_packet<R>(&self, handle: PacketHandle, f: impl FnOnce(&Packet) -> R) -> R {
        let pkt = self.slots[handle.0 as usize].lock();
        f(&pkt)
    }

    /// Runs `f` with exclusive access to the packet behind `handle`.
    pub fn with_packet_mut<R>(
        &self,
        handle: PacketHandle,
        f: impl FnOnce(&mut Packet) -> R,
    ) -> R {
        let mut pkt = self.slots[handle.0 as usize].lock();
        f(&mut pkt)
    }

    /// Forces every outstanding packet back onto the free-list. Called on
    /// link-down: any handle a caller is still holding becomes logically
    /// invalid (reusing it silently races with a new allocation, which is
    /// the same contract a real NIC driver has for in-flight DMA
    /// descriptors after a reset).
    pub fn reset_all(&self) {
        let mut free = self.free.lock();
        free.clear();
        free.extend((0..self.capacity as u32).rev());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_invariant_holds_after_get_and_put() {
        let pool = PacketPool::new(4);
        assert_eq!(pool.free_count(), 4);
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert_eq!(pool.free_count(), 2);
        pool.put(a);
        pool.put(b);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn exhausted_pool_returns_out_of_memory() {
        let pool = PacketPool::new(1);
        let _h = pool.get().unwrap();
        assert!(matches!(pool.get(), Err(Error::OutOfMemory)));
    }

    #[test]
    fn reset_all_restores_full_capacity() {
        let pool = PacketPool::new(3);
        let _a = pool.get().unwrap();
        let _b = pool.get().unwrap();
        pool.reset_all();
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn payload_round_trips_through_handle() {
        let pool = PacketPool::new(1);
        let h = pool.get().unwrap();
        pool.with_packet_mut(h, |p| {
            p.buf_mut()[..3].copy_from_slice(b"abc");
            p.set_payload_len(3);
        });
        pool.with_packet(h, |p| assert_eq!(p.payload(), b"abc"));
    }
}
