//! Non-blocking socket layer. A single reactor thread owns every socket and
//! translates readiness events into messages posted to the owning services'
//! mailboxes; other threads talk to it exclusively through the control
//! channel exposed by [`SocketApi`].
//!
//! [`SocketApi`]: crate::net::reactor::SocketApi

pub mod buffer;
pub mod reactor;
pub mod slot;

pub use self::reactor::{SocketApi, SocketServer};

use byteorder::{BigEndian, ByteOrder};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Opaque socket id handed out by the reactor. Ids are never reused while
/// the underlying slot is live; a stale id is detected and rejected.
pub type SocketId = i32;

const UDP_FAMILY_V4: u8 = 1;
const UDP_FAMILY_V6: u8 = 2;

/// A UDP peer address in its compact wire form:
/// `family(1) | be_port(2) | addr(4 or 16)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UdpAddress(pub SocketAddr);

impl UdpAddress {
    /// Append the wire form to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut port = [0u8; 2];
        BigEndian::write_u16(&mut port, self.0.port());
        match self.0.ip() {
            IpAddr::V4(ip) => {
                out.push(UDP_FAMILY_V4);
                out.extend_from_slice(&port);
                out.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                out.push(UDP_FAMILY_V6);
                out.extend_from_slice(&port);
                out.extend_from_slice(&ip.octets());
            }
        }
    }

    /// Parse the wire form from the head of `data`, returning the address
    /// and the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Option<(UdpAddress, usize)> {
        match data.first()? {
            &UDP_FAMILY_V4 if data.len() >= 7 => {
                let port = BigEndian::read_u16(&data[1..3]);
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&data[3..7]);
                Some((UdpAddress(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port)), 7))
            }
            &UDP_FAMILY_V6 if data.len() >= 19 => {
                let port = BigEndian::read_u16(&data[1..3]);
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[3..19]);
                Some((UdpAddress(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)), 19))
            }
            _ => None,
        }
    }
}

/// Event delivered to a socket's owning service, wrapped in a `SOCKET`
/// protocol message. The receiving service owns any carried buffer.
#[derive(Debug)]
pub enum SocketMessage {
    /// Stream bytes arrived.
    Data { id: SocketId, data: Box<[u8]> },
    /// A datagram arrived, with its sender.
    Udp {
        id: SocketId,
        data: Box<[u8]>,
        from: UdpAddress,
    },
    /// The socket reached its connected/listening state.
    Connect { id: SocketId, addr: String },
    /// A listening socket accepted `peer`; call `start` to adopt it.
    Accept {
        id: SocketId,
        peer: SocketId,
        addr: String,
    },
    /// The socket is gone; the slot has been recycled.
    Close { id: SocketId },
    /// Something failed; the slot has been recycled.
    Error { id: SocketId, reason: String },
    /// Unsent bytes crossed another mebibyte boundary.
    Warning { id: SocketId, pending_kb: usize },
}

impl SocketMessage {
    /// The socket the event concerns.
    pub fn id(&self) -> SocketId {
        match self {
            SocketMessage::Data { id, .. }
            | SocketMessage::Udp { id, .. }
            | SocketMessage::Connect { id, .. }
            | SocketMessage::Accept { id, .. }
            | SocketMessage::Close { id }
            | SocketMessage::Error { id, .. }
            | SocketMessage::Warning { id, .. } => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_address_v4_roundtrip() {
        let addr = UdpAddress("127.0.0.1:8125".parse().unwrap());
        let mut wire = Vec::new();
        addr.encode(&mut wire);
        assert_eq!(wire.len(), 7);
        assert_eq!(wire[0], UDP_FAMILY_V4);

        let (decoded, used) = UdpAddress::decode(&wire).unwrap();
        assert_eq!(used, 7);
        assert_eq!(decoded, addr);
    }

    #[test]
    fn test_udp_address_v6_roundtrip() {
        let addr = UdpAddress("[::1]:53".parse().unwrap());
        let mut wire = Vec::new();
        addr.encode(&mut wire);
        assert_eq!(wire.len(), 19);

        let (decoded, used) = UdpAddress::decode(&wire).unwrap();
        assert_eq!(used, 19);
        assert_eq!(decoded, addr);
    }

    #[test]
    fn test_udp_address_decode_rejects_short() {
        assert!(UdpAddress::decode(&[UDP_FAMILY_V4, 0, 1, 2]).is_none());
        assert!(UdpAddress::decode(&[9, 0, 0]).is_none());
        assert!(UdpAddress::decode(&[]).is_none());
    }
}
