//! Datagram channel seam between the transmission controllers and the OS.
//!
//! The controllers only ever need two primitives: fire-and-forget send of one
//! frame, and a non-blocking receive where "no data yet" is a normal outcome.
//! `UdpChannel` is the production implementation; `MemoryChannel` is a
//! lossless in-process pair used by the integration tests.

use std::io;
use std::net::{SocketAddr, UdpSocket};

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

/// Non-blocking datagram transport.
pub trait DatagramChannel {
    /// Send one frame to the peer.
    fn send(&self, frame: &[u8]) -> io::Result<()>;

    /// Try to receive one frame into `buf`. Returns `Ok(None)` when nothing
    /// is pending; the caller is expected to sleep briefly and retry.
    fn try_recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>>;
}

/// UDP transport with the protocol's two-socket layout: one bound socket for
/// inbound frames, one ephemeral socket for outbound frames.
pub struct UdpChannel {
    recv_socket: UdpSocket,
    send_socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpChannel {
    /// Bind the inbound socket on `local` and aim outbound frames at `peer`.
    pub fn bind(local: SocketAddr, peer: SocketAddr) -> io::Result<Self> {
        let recv_socket = UdpSocket::bind(local)?;
        recv_socket.set_nonblocking(true)?;
        let _ = set_recv_buffer(&recv_socket, 4 * 1024 * 1024);

        let send_socket = UdpSocket::bind((local.ip(), 0))?;
        let _ = set_send_buffer(&send_socket, 4 * 1024 * 1024);

        Ok(UdpChannel {
            recv_socket,
            send_socket,
            peer,
        })
    }

    /// Address the inbound socket actually bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.recv_socket.local_addr()
    }
}

impl DatagramChannel for UdpChannel {
    fn send(&self, frame: &[u8]) -> io::Result<()> {
        self.send_socket.send_to(frame, self.peer).map(|_| ())
    }

    fn try_recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.recv_socket.recv_from(buf) {
            Ok((len, _src)) => Ok(Some(len)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// One endpoint of an in-memory datagram pair.
pub struct MemoryChannel {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

/// Create a connected pair of in-memory channels. Frames sent on one end
/// arrive on the other, in order and without loss.
pub fn memory_pair() -> (MemoryChannel, MemoryChannel) {
    let (left_tx, left_rx) = unbounded();
    let (right_tx, right_rx) = unbounded();
    (
        MemoryChannel {
            tx: left_tx,
            rx: right_rx,
        },
        MemoryChannel {
            tx: right_tx,
            rx: left_rx,
        },
    )
}

impl DatagramChannel for MemoryChannel {
    fn send(&self, frame: &[u8]) -> io::Result<()> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer channel dropped"))
    }

    fn try_recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.rx.try_recv() {
            Ok(frame) => {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(Some(len))
            }
            Err(TryRecvError::Empty) => Ok(None),
            // Peer hung up: behaves like a silent link, the controller's own
            // timeouts decide what happens next.
            Err(TryRecvError::Disconnected) => Ok(None),
        }
    }
}

/// Set the OS receive buffer size on a UDP socket.
fn set_recv_buffer(socket: &UdpSocket, size: usize) -> io::Result<()> {
    #[cfg(unix)]
    {
        use socket2::Socket;
        use std::os::unix::io::{AsRawFd, FromRawFd};
        let raw = socket.as_raw_fd();
        let s2 = unsafe { Socket::from_raw_fd(raw) };
        let result = s2.set_recv_buffer_size(size);
        std::mem::forget(s2);
        result
    }
    #[cfg(windows)]
    {
        use socket2::Socket;
        use std::os::windows::io::{AsRawSocket, FromRawSocket};
        let raw = socket.as_raw_socket();
        let s2 = unsafe { Socket::from_raw_socket(raw) };
        let result = s2.set_recv_buffer_size(size);
        std::mem::forget(s2);
        result
    }
}

/// Set the OS send buffer size on a UDP socket.
fn set_send_buffer(socket: &UdpSocket, size: usize) -> io::Result<()> {
    #[cfg(unix)]
    {
        use socket2::Socket;
        use std::os::unix::io::{AsRawFd, FromRawFd};
        let raw = socket.as_raw_fd();
        let s2 = unsafe { Socket::from_raw_fd(raw) };
        let result = s2.set_send_buffer_size(size);
        std::mem::forget(s2);
        result
    }
    #[cfg(windows)]
    {
        use socket2::Socket;
        use std::os::windows::io::{AsRawSocket, FromRawSocket};
        let raw = socket.as_raw_socket();
        let s2 = unsafe { Socket::from_raw_socket(raw) };
        let result = s2.set_send_buffer_size(size);
        std::mem::forget(s2);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_pair_delivers_in_order() {
        let (a, b) = memory_pair();
        a.send(&[1, 2, 3]).unwrap();
        a.send(&[4]).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(b.try_recv(&mut buf).unwrap(), Some(3));
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(b.try_recv(&mut buf).unwrap(), Some(1));
        assert_eq!(buf[0], 4);
        assert_eq!(b.try_recv(&mut buf).unwrap(), None);
    }

    #[test]
    fn dropped_peer_reads_as_silence() {
        let (a, b) = memory_pair();
        drop(a);
        let mut buf = [0u8; 16];
        assert_eq!(b.try_recv(&mut buf).unwrap(), None);
    }
}
