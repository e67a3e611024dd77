//! Single-producer/single-consumer byte ring, used to connect a local
//! endpoint (ALSA worker, IPC video producer) to a TX/RX stream object. One
//! ring per stream; created together, destroyed together.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Shared {
    buf: UnsafeCell<Box<[u8]>>,
    capacity: usize,
    head: AtomicUsize, // next byte the consumer will read
    tail: AtomicUsize, // next byte the producer will write
}

// SAFETY: `buf` is only ever written through `RingProducer` (sole writer)
// at indices in `[tail, tail+free)` and only ever read through
// `RingConsumer` (sole reader) at indices in `[head, head+len)`. The two
// ranges never overlap because `len() <= capacity` is maintained by
// `RingProducer::write` bounding writes to `free()`. `head`/`tail` are
// published with Release and observed with Acquire, so this is a standard
// SPSC ring.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

/// Creates a connected producer/consumer pair over a ring of `capacity`
/// bytes.
#[must_use]
pub fn channel(capacity: usize) -> (RingProducer, RingConsumer) {
    assert!(capacity > 0, "ring capacity must be positive");
    let shared = Arc::new(Shared {
        buf: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
        capacity,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });
    (
        RingProducer {
            shared: shared.clone(),
        },
        RingConsumer { shared },
    )
}

impl Shared {
    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    fn free(&self) -> usize {
        self.capacity - self.len()
    }
}

/// Producer half of a [`channel`]. Writes PCM/video bytes from the local
/// endpoint; never blocks, reports how much it actually wrote.
pub struct RingProducer {
    shared: Arc<Shared>,
}

impl RingProducer {
    /// Writes as much of `data` as fits; returns the number of bytes
    /// written.
    pub fn write(&self, data: &[u8]) -> usize {
        let free = self.shared.free();
        let n = data.len().min(free);
        let tail = self.shared.tail.load(Ordering::Relaxed);
        let cap = self.shared.capacity;
        // SAFETY: sole writer; target indices lie entirely within the
        // currently-free region, disjoint from the reader's live region.
        let buf = unsafe { &mut *self.shared.buf.get() };
        for (i, byte) in data[..n].iter().enumerate() {
            let idx = (tail + i) % cap;
            buf[idx] = *byte;
        }
        self.shared
            .tail
            .store(tail.wrapping_add(n), Ordering::Release);
        n
    }

    /// Bytes available to write without the consumer catching up further.
    #[must_use]
    pub fn free_space(&self) -> usize {
        self.shared.free()
    }
}

/// Consumer half of a [`channel`]. Reads PCM/video bytes for delivery to a
/// TX stream's `prepare_packet`, or is written to by an RX stream's
/// `dispatch`.
pub struct RingConsumer {
    shared: Arc<Shared>,
}

impl RingConsumer {
    /// Reads up to `out.len()` bytes; returns the number actually read.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let avail = self.shared.len();
        let n = out.len().min(avail);
        let head = self.shared.head.load(Ordering::Relaxed);
        let cap = self.shared.capacity;
        // SAFETY: sole reader; source indices lie entirely within the
        // currently-occupied region, disjoint from the writer's free region.
        let buf = unsafe { &*self.shared.buf.get() };
        for (i, slot) in out[..n].iter_mut().enumerate() {
            let idx = (head + i) % cap;
            *slot = buf[idx];
        }
        self.shared
            .head
            .store(head.wrapping_add(n), Ordering::Release);
        n
    }

    /// Bytes currently available to read.
    #[must_use]
    pub fn available(&self) -> usize {
        self.shared.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let (p, c) = channel(16);
        assert_eq!(p.write(b"hello"), 5);
        let mut out = [0u8; 5];
        assert_eq!(c.read(&mut out), 5);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn write_is_bounded_by_capacity() {
        let (p, _c) = channel(4);
        assert_eq!(p.write(b"abcdef"), 4);
    }

    #[test]
    fn read_is_bounded_by_available() {
        let (p, c) = channel(16);
        p.write(b"ab");
        let mut out = [0u8; 8];
        assert_eq!(c.read(&mut out), 2);
    }

    #[test]
    fn wraps_around_correctly() {
        let (p, c) = channel(4);
        p.write(b"ab");
        let mut out = [0u8; 2];
        c.read(&mut out);
        p.write(b"cd");
        let mut out2 = [0u8; 2];
        assert_eq!(c.read(&mut out2), 2);
        assert_eq!(&out2, b"cd");
    }

    #[test]
    fn sent_across_threads() {
        let (p, c) = channel(64);
        let handle = std::thread::spawn(move || {
            for _ in 0..100 {
                p.write(b"x");
            }
        });
        handle.join().unwrap();
        assert!(c.available() > 0);
    }
}
