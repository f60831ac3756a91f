use crate::handle::Handle;
use crate::net::buffer::{ReadHint, WriteList};
use crate::net::{SocketId, UdpAddress};
use mio::net::{TcpListener, TcpStream, UdpSocket};
use std::fs::File;

/// Number of slots in the pool; must stay a power of two because ids map to
/// slots by masking.
pub const MAX_SOCKET: usize = 1 << 12;
pub const SLOT_MASK: i32 = MAX_SOCKET as i32 - 1;

/// Unsent bytes at which the first backpressure warning fires; doubles for
/// each subsequent warning on the same socket.
pub const WARNING_SIZE: usize = 1024 * 1024;

/// Life cycle of one socket slot. The only edges are
/// `Reserve -> (Plisten | Paccept | Connecting) -> (Listen | Connected)
/// -> Halfclose -> Invalid`; everything else goes straight to `Invalid`
/// through an error.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SocketState {
    Invalid,
    Reserve,
    Plisten,
    Listen,
    Connecting,
    Connected,
    Halfclose,
    Paccept,
    Bind,
}

/// The kernel object held by a slot.
pub enum SocketHolder {
    Stream(TcpStream),
    Listener(TcpListener),
    Udp(UdpSocket),
    /// An externally created fd (e.g. stdin) wrapped for event delivery.
    Raw(File),
}

pub struct Slot {
    pub id: SocketId,
    pub owner: Handle,
    pub state: SocketState,
    pub holder: Option<SocketHolder>,
    pub high: WriteList,
    pub low: WriteList,
    /// Total unsent bytes across both lists, mirrored into the shared meter
    /// the sending thread reads.
    pub wb_size: usize,
    /// Next warning boundary; doubles every time it is crossed.
    pub warn_size: usize,
    pub read_hint: ReadHint,
    /// Default peer for a "connected" UDP socket.
    pub udp_peer: Option<UdpAddress>,
    /// Write interest currently registered with the poll.
    pub writing: bool,
    /// Whether the holder is registered with the poll at all.
    pub registered: bool,
}

impl Slot {
    pub fn vacant(id: SocketId) -> Slot {
        Slot {
            id,
            owner: 0,
            state: SocketState::Invalid,
            holder: None,
            high: WriteList::new(),
            low: WriteList::new(),
            wb_size: 0,
            warn_size: 0,
            read_hint: ReadHint::new(),
            udp_peer: None,
            writing: false,
            registered: false,
        }
    }

    /// Claim this slot for a fresh id. The previous tenant must be gone.
    pub fn reserve(&mut self, id: SocketId, owner: Handle) {
        debug_assert_eq!(self.state, SocketState::Invalid);
        self.id = id;
        self.owner = owner;
        self.state = SocketState::Reserve;
        self.wb_size = 0;
        self.warn_size = 0;
        self.read_hint = ReadHint::new();
        self.udp_peer = None;
        self.writing = false;
        self.registered = false;
    }

    /// Release everything and return to the pool.
    pub fn recycle(&mut self) {
        self.holder = None;
        self.high.clear();
        self.low.clear();
        self.wb_size = 0;
        self.udp_peer = None;
        self.state = SocketState::Invalid;
        self.owner = 0;
        self.writing = false;
        self.registered = false;
    }

    #[inline]
    pub fn has_pending_writes(&self) -> bool {
        !self.high.is_empty() || !self.low.is_empty()
    }

    /// Index of the slot an id maps to.
    #[inline]
    pub fn index_of(id: SocketId) -> usize {
        (id & SLOT_MASK) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_masks_high_bits() {
        assert_eq!(Slot::index_of(1), 1);
        assert_eq!(Slot::index_of(MAX_SOCKET as i32 + 5), 5);
        assert_eq!(Slot::index_of(3 * MAX_SOCKET as i32 + 7), 7);
    }

    #[test]
    fn test_reserve_recycle() {
        let mut slot = Slot::vacant(0);
        slot.reserve(42, 0x0100_0001);
        assert_eq!(slot.state, SocketState::Reserve);
        assert_eq!(slot.owner, 0x0100_0001);

        slot.recycle();
        assert_eq!(slot.state, SocketState::Invalid);
        assert_eq!(slot.owner, 0);
        assert!(!slot.has_pending_writes());
    }
}
