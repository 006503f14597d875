use byteorder::{NetworkEndian, ReadBytesExt, WriteBytesExt};
use std::io;

/// Length of the sequence-number header at the front of every timed-run
/// datagram.
pub const SEQ_LEN: usize = 4;

/// Scratch size for inbound control messages.
pub const CONTROL_BUF: usize = 100;

/// The rendezvous vocabulary. One canonical set: `HELLO` both ways during
/// registration, `READY` server-to-client, `SETGO` client-to-server. The
/// historical `START` synonym is deliberately neither sent nor recognized.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Control {
    Hello,
    Ready,
    SetGo,
}

impl Control {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Control::Hello => b"HELLO",
            Control::Ready => b"READY",
            Control::SetGo => b"SETGO",
        }
    }

    /// Exact-byte match. A single trailing NUL is tolerated because the
    /// historical C peers transmitted `strlen+1` bytes.
    pub fn parse(buf: &[u8]) -> Option<Control> {
        let buf = match buf.split_last() {
            Some((&0, rest)) => rest,
            _ => buf,
        };
        match buf {
            b"HELLO" => Some(Control::Hello),
            b"READY" => Some(Control::Ready),
            b"SETGO" => Some(Control::SetGo),
            _ => None,
        }
    }
}

/// Write the 4-byte network-order sequence number into the head of `buf`;
/// the remainder of the datagram is padding.
pub fn encode_seq(seq: u32, buf: &mut [u8]) -> io::Result<()> {
    (&mut buf[..]).write_u32::<NetworkEndian>(seq)
}

/// Decode the sequence number from a received datagram. Reading through the
/// slice cursor bounds-checks every byte; a truncated datagram is a data
/// error, never an out-of-bounds access.
pub fn decode_seq(mut buf: &[u8]) -> io::Result<u32> {
    buf.read_u32::<NetworkEndian>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_number_round_trips() {
        let mut buf = [0u8; 16];
        encode_seq(0xdeadbeef, &mut buf).unwrap();
        assert_eq!(&buf[..SEQ_LEN], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(decode_seq(&buf).unwrap(), 0xdeadbeef);
    }

    #[test]
    fn truncated_datagram_is_an_error() {
        assert!(decode_seq(&[1, 2, 3]).is_err());
        assert!(decode_seq(&[]).is_err());
        let mut short = [0u8; 2];
        assert!(encode_seq(1, &mut short).is_err());
    }

    #[test]
    fn control_messages_match_exactly() {
        assert_eq!(Control::parse(b"HELLO"), Some(Control::Hello));
        assert_eq!(Control::parse(b"READY"), Some(Control::Ready));
        assert_eq!(Control::parse(b"SETGO"), Some(Control::SetGo));
        assert_eq!(Control::parse(b"START"), None);
        assert_eq!(Control::parse(b"HELLO!"), None);
        assert_eq!(Control::parse(b"hello"), None);
        assert_eq!(Control::parse(b""), None);
    }

    #[test]
    fn trailing_nul_from_c_peers_is_tolerated() {
        assert_eq!(Control::parse(b"HELLO\0"), Some(Control::Hello));
        assert_eq!(Control::parse(b"SETGO\0"), Some(Control::SetGo));
        assert_eq!(Control::parse(b"HELLO\0\0"), None);
    }
}
