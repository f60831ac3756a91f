use byteorder::{BigEndian, WriteBytesExt};
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::fmt;

/// Maximum payload length a 2-byte header can describe.
pub const MAX_PACKET: usize = 0xffff;

/// A complete reassembled packet.
#[derive(Debug, Eq, PartialEq)]
pub struct Packet {
    pub fd: i32,
    pub buffer: Vec<u8>,
}

/// Outcome of feeding one read event into the framer.
#[derive(Debug, Eq, PartialEq)]
pub enum Filtered {
    /// No complete packet yet; bytes were absorbed into the partial record.
    None,
    /// Exactly one packet completed and the input was fully consumed.
    Data(Packet),
    /// More than one packet completed; drain them with [`Framer::pop`].
    More,
}

#[derive(Debug, Eq, PartialEq)]
pub struct TooLong(pub usize);

impl fmt::Display for TooLong {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "payload of {} bytes exceeds the {} byte frame limit", self.0, MAX_PACKET)
    }
}

impl std::error::Error for TooLong {}

// In-progress packet for one fd. A single delivered byte is only half of the
// length header; that state is explicit so byte-at-a-time callers progress.
enum Partial {
    HalfHeader(u8),
    Body { expect: usize, buffer: Vec<u8> },
}

/// Reassembles `u16_be length | payload` frames from arbitrarily chunked
/// stream reads. Frames for one fd come out in arrival order; fds never
/// interleave within a frame.
pub struct Framer {
    partial: HashMap<i32, Partial>,
    queue: VecDeque<Packet>,
}

impl Framer {
    pub fn new() -> Framer {
        Framer {
            partial: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    /// Frame a payload for the wire.
    pub fn pack(payload: &[u8]) -> Result<Vec<u8>, TooLong> {
        if payload.len() > MAX_PACKET {
            return Err(TooLong(payload.len()));
        }
        let mut out = Vec::with_capacity(2 + payload.len());
        out.write_u16::<BigEndian>(payload.len() as u16).unwrap();
        out.extend_from_slice(payload);
        Ok(out)
    }

    /// Feed one read event. Completed packets beyond the first are queued;
    /// a [`Filtered::More`] result tells the caller to drain via [`pop`].
    ///
    /// [`pop`]: Framer::pop
    pub fn filter(&mut self, fd: i32, mut data: &[u8]) -> Filtered {
        if data.is_empty() {
            return Filtered::None;
        }

        let mut complete: Vec<Packet> = Vec::new();

        if let Some(partial) = self.partial.remove(&fd) {
            data = self.resume(fd, partial, data, &mut complete);
        }

        while !data.is_empty() {
            if data.len() == 1 {
                self.partial.insert(fd, Partial::HalfHeader(data[0]));
                break;
            }
            let expect = usize::from(data[0]) << 8 | usize::from(data[1]);
            data = &data[2..];
            if data.len() < expect {
                let mut buffer = Vec::with_capacity(expect);
                buffer.extend_from_slice(data);
                self.partial.insert(fd, Partial::Body { expect, buffer });
                break;
            }
            complete.push(Packet {
                fd,
                buffer: data[..expect].to_vec(),
            });
            data = &data[expect..];
        }

        match complete.len() {
            0 => Filtered::None,
            1 if self.queue.is_empty() => Filtered::Data(complete.pop().unwrap()),
            _ => {
                self.queue.extend(complete);
                Filtered::More
            }
        }
    }

    /// Continue a partial record with fresh bytes, returning the unconsumed
    /// remainder.
    fn resume<'d>(
        &mut self,
        fd: i32,
        partial: Partial,
        data: &'d [u8],
        complete: &mut Vec<Packet>,
    ) -> &'d [u8] {
        match partial {
            Partial::HalfHeader(high) => {
                let expect = usize::from(high) << 8 | usize::from(data[0]);
                let data = &data[1..];
                if data.len() < expect {
                    let mut buffer = Vec::with_capacity(expect);
                    buffer.extend_from_slice(data);
                    self.partial.insert(fd, Partial::Body { expect, buffer });
                    return &[];
                }
                complete.push(Packet {
                    fd,
                    buffer: data[..expect].to_vec(),
                });
                &data[expect..]
            }
            Partial::Body { expect, mut buffer } => {
                let need = expect - buffer.len();
                if data.len() < need {
                    buffer.extend_from_slice(data);
                    self.partial.insert(fd, Partial::Body { expect, buffer });
                    return &[];
                }
                buffer.extend_from_slice(&data[..need]);
                complete.push(Packet { fd, buffer });
                &data[need..]
            }
        }
    }

    /// Drain one queued packet after a [`Filtered::More`] result.
    pub fn pop(&mut self) -> Option<Packet> {
        self.queue.pop_front()
    }

    /// Forget the partial record of a closed fd.
    pub fn close(&mut self, fd: i32) {
        self.partial.remove(&fd);
    }

    /// Drop every partial record and queued packet.
    pub fn clear(&mut self) {
        self.partial.clear();
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn collect(framer: &mut Framer, fd: i32, data: &[u8]) -> Vec<Packet> {
        let mut out = Vec::new();
        match framer.filter(fd, data) {
            Filtered::None => {}
            Filtered::Data(packet) => out.push(packet),
            Filtered::More => {
                while let Some(packet) = framer.pop() {
                    out.push(packet);
                }
            }
        }
        out
    }

    #[test]
    fn test_pack() {
        assert_eq!(Framer::pack(b"hello").unwrap(), b"\x00\x05hello");
        assert_eq!(Framer::pack(&[]).unwrap(), b"\x00\x00");
        assert_eq!(Framer::pack(&vec![0; 70000]).unwrap_err(), TooLong(70000));
    }

    #[test]
    fn test_single_packet() {
        let mut framer = Framer::new();
        let packets = collect(&mut framer, 1, b"\x00\x05hello");
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].buffer, b"hello");
    }

    #[test]
    fn test_reassembly_across_reads() {
        // "\x00\x05hello\x00\x05wor" then "ld" yields "hello" then "world".
        let mut framer = Framer::new();
        let first = collect(&mut framer, 4, b"\x00\x05hello\x00\x05wor");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].buffer, b"hello");

        let second = collect(&mut framer, 4, b"ld");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].buffer, b"world");
    }

    #[test]
    fn test_more_signal() {
        let mut framer = Framer::new();
        let mut wire = Framer::pack(b"one").unwrap();
        wire.extend(Framer::pack(b"two").unwrap());
        wire.extend(Framer::pack(b"three").unwrap());

        match framer.filter(9, &wire) {
            Filtered::More => {}
            other => panic!("expected More, got {:?}", other),
        }
        assert_eq!(framer.pop().unwrap().buffer, b"one");
        assert_eq!(framer.pop().unwrap().buffer, b"two");
        assert_eq!(framer.pop().unwrap().buffer, b"three");
        assert!(framer.pop().is_none());
    }

    #[test]
    fn test_byte_at_a_time() {
        // The half-header state keeps one-byte deliveries progressing.
        let mut framer = Framer::new();
        let wire = Framer::pack(b"drip").unwrap();
        let mut packets = Vec::new();
        for byte in &wire {
            packets.extend(collect(&mut framer, 2, std::slice::from_ref(byte)));
        }
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].buffer, b"drip");
    }

    #[test]
    fn test_empty_frame() {
        let mut framer = Framer::new();
        let packets = collect(&mut framer, 1, b"\x00\x00");
        assert_eq!(packets.len(), 1);
        assert!(packets[0].buffer.is_empty());
    }

    #[test]
    fn test_fds_do_not_interleave() {
        let mut framer = Framer::new();
        assert_eq!(framer.filter(1, b"\x00\x04ab"), Filtered::None);
        assert_eq!(framer.filter(2, b"\x00\x02xy").map_buffer(), Some(b"xy".to_vec()));
        let done = collect(&mut framer, 1, b"cd");
        assert_eq!(done[0].buffer, b"abcd");
        assert_eq!(done[0].fd, 1);
    }

    impl Filtered {
        fn map_buffer(self) -> Option<Vec<u8>> {
            match self {
                Filtered::Data(packet) => Some(packet.buffer),
                _ => None,
            }
        }
    }

    #[test]
    fn test_close_discards_partial() {
        let mut framer = Framer::new();
        assert_eq!(framer.filter(5, b"\x00\x04ab"), Filtered::None);
        framer.close(5);
        // A new frame on the same fd starts clean.
        let packets = collect(&mut framer, 5, b"\x00\x02ok");
        assert_eq!(packets[0].buffer, b"ok");
    }

    #[test]
    fn test_random_chunking_roundtrip() {
        let payloads: Vec<Vec<u8>> = (0..64usize)
            .map(|i| (0..i * 37 % 512).map(|b| b as u8).collect())
            .collect();
        let mut wire = Vec::new();
        for p in &payloads {
            wire.extend(Framer::pack(p).unwrap());
        }

        let mut rng = rand::thread_rng();
        for _ in 0..16 {
            let mut framer = Framer::new();
            let mut out = Vec::new();
            let mut rest = &wire[..];
            while !rest.is_empty() {
                let take = rng.gen_range(1..=rest.len().min(97));
                out.extend(collect(&mut framer, 3, &rest[..take]));
                rest = &rest[take..];
            }
            assert_eq!(out.len(), payloads.len());
            for (packet, payload) in out.iter().zip(&payloads) {
                assert_eq!(&packet.buffer, payload);
            }
        }
    }
}
