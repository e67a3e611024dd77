//! RX ingress abstraction: how the RX engine pulls raw Ethernet frames in
//! socket mode. Direct-DMA mode instead polls `NicDriver::read_rx` directly
//! and never touches this trait.

use std::time::Duration;

use crate::error::Result;

/// One blocking (bounded by `timeout`) raw-frame source.
pub trait RxIngress: Send {
    /// Waits up to `timeout` for one frame, writing it (minus any L2
    /// addressing the implementation already stripped) into `buf`. Returns
    /// its length, or `None` on timeout.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>>;
}

/// AVTP's registered EtherType (IEEE 1722-2016 §5.1).
pub const ETH_P_AVTP: u16 = 0x22F0;

#[cfg(target_os = "linux")]
mod raw_socket {
    use std::ffi::CString;
    use std::mem::size_of;
    use std::time::Duration;

    use socket2::{Domain, Protocol, SockAddr, Socket, Type};

    use super::{RxIngress, ETH_P_AVTP};
    use crate::error::{Error, Result};

    /// `AF_PACKET`/`SOCK_RAW` ingress bound to one interface and the AVTP
    /// EtherType, mirroring the socket-mode path the NIC driver contract
    /// assumes when direct-DMA RX is not enabled.
    pub struct RawSocketIngress {
        socket: Socket,
    }

    impl RawSocketIngress {
        /// Opens and binds a raw socket on `interface`.
        ///
        /// # Errors
        /// [`Error::NotFound`] if the interface name does not resolve;
        /// [`Error::Errno`] for any other socket setup failure.
        pub fn bind(interface: &str) -> Result<Self> {
            let ifindex = interface_index(interface)?;
            let protocol = Protocol::from(i32::from(ETH_P_AVTP.to_be()));
            let socket = Socket::new(Domain::PACKET, Type::RAW, Some(protocol))
                .map_err(|e| Error::from_io(&e))?;
            socket.bind(&sockaddr_ll(ifindex, ETH_P_AVTP)).map_err(|e| Error::from_io(&e))?;
            Ok(Self { socket })
        }
    }

    impl RxIngress for RawSocketIngress {
        fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
            self.socket
                .set_read_timeout(Some(timeout))
                .map_err(|e| Error::from_io(&e))?;
            match self.socket.read(buf) {
                Ok(n) => Ok(Some(n)),
                Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => Ok(None),
                Err(e) => Err(Error::from_io(&e)),
            }
        }
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
        let cname = CString::new(name)
            .map_err(|_| Error::InvalidParam("interface name contains NUL".into()))?;
        // SAFETY: `cname` is a valid NUL-terminated string for the duration
        // of this call.
        let idx = unsafe { libc::if_nametoindex(cname.as_ptr()) };
        if idx == 0 {
            return Err(Error::NotFound(format!("network interface {name}")));
        }
        Ok(idx as i32)
    }
}

#[cfg(target_os = "linux")]
pub use raw_socket::RawSocketIngress;

#[cfg(test)]
pub mod testutil {
    use std::collections::VecDeque;
    use std::time::Duration;

    use super::RxIngress;
    use crate::error::Result;

    /// Deterministic ingress double fed by `push`, consumed in FIFO order.
    #[derive(Default)]
    pub struct QueueIngress {
        frames: VecDeque<Vec<u8>>,
    }

    impl QueueIngress {
        pub fn push(&mut self, frame: Vec<u8>) {
            self.frames.push_back(frame);
        }
    }

    impl RxIngress for QueueIngress {
        fn recv(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<Option<usize>> {
            match self.frames.pop_front() {
                Some(frame) => {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    Ok(Some(n))
                }
                None => Ok(None),
            }
        }
    }
}
