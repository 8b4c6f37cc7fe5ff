use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
};

use tracing::warn;

use crate::{network::messages::Message, NonBlockingSocket};

const RECV_BUFFER_SIZE: usize = 4096;
/// Payloads above this risk IP fragmentation; a fragmented datagram is lost
/// whenever any fragment is. Usually a sign the input type is too large.
const IDEAL_MAX_UDP_PAYLOAD: usize = 508;

/// A non-blocking UDP transport bound to `0.0.0.0:port`, ready to plug into
/// a [`SessionBuilder`](crate::SessionBuilder).
#[derive(Debug)]
pub struct UdpNonBlockingSocket {
    socket: UdpSocket,
    buffer: [u8; RECV_BUFFER_SIZE],
}

impl UdpNonBlockingSocket {
    /// Binds to `0.0.0.0:port` in non-blocking mode.
    ///
    /// # Errors
    /// Forwards the OS error if binding fails.
    pub fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            buffer: [0; RECV_BUFFER_SIZE],
        })
    }

    /// The local address the socket is bound to.
    ///
    /// # Errors
    /// Forwards the OS error if the address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }
}

impl NonBlockingSocket<SocketAddr> for UdpNonBlockingSocket {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) {
        let bytes = match bincode::serialize(msg) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("failed to serialize message, dropping it: {err}");
                return;
            }
        };

        if bytes.len() > IDEAL_MAX_UDP_PAYLOAD {
            warn!(
                "sending a {} byte datagram (over the {} byte fragmentation threshold); \
                 consider shrinking the input type",
                bytes.len(),
                IDEAL_MAX_UDP_PAYLOAD
            );
        }

        // UDP is best effort; a failed send is just a lost packet
        if let Err(err) = self.socket.send_to(&bytes, addr) {
            warn!("udp send to {addr} failed: {err}");
        }
    }

    fn receive_all(&mut self) -> Vec<(SocketAddr, Message)> {
        let mut received = Vec::new();
        loop {
            match self.socket.recv_from(&mut self.buffer) {
                Ok((len, from)) => {
                    if let Ok(msg) = bincode::deserialize(&self.buffer[..len]) {
                        received.push((from, msg));
                    }
                    // anything that does not parse is silently dropped
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return received,
                // spurious on datagram sockets after a send to a closed port
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    warn!("udp receive failed: {err}");
                    return received;
                }
            }
        }
    }
}

// #########
// # TESTS #
// #########
