use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{RelStreamError, Result};

/// Size of a pure acknowledgment on the wire.
pub const ACK_LEN: usize = 8;
/// Header size of a data-bearing packet; the payload follows it.
pub const DATA_HEADER_LEN: usize = 12;
/// Largest payload a single segment may carry.
pub const MAX_PAYLOAD: usize = 500;
/// Largest datagram the codec accepts.
pub const MAX_PACKET_LEN: usize = DATA_HEADER_LEN + MAX_PAYLOAD;

/// RelStream wire packet.
///
/// Binary layout (all fields big-endian):
///
/// ```text
/// +----------+--------+---------+---------+-----------------+
/// | checksum | length |  ackno  |  seqno  | payload (0-500) |
/// |   (2B)   |  (2B)  |  (4B)   |  (4B)   |                 |
/// +----------+--------+---------+---------+-----------------+
///  \_____________ ACK (8B) _____/
/// ```
///
/// The shape is selected by `length`: exactly 8 is an acknowledgment, 12 or
/// more is a data segment. A data segment with an empty payload marks the
/// end of the sender's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// ACK: cumulative acknowledgment, `ackno` is the next expected segment.
    Ack { ackno: u32 },
    /// DATA: one sequenced segment, or the EOF marker when `payload` is empty.
    Data {
        ackno: u32,
        seqno: u32,
        payload: Bytes,
    },
}

impl Packet {
    /// Build an acknowledgment.
    pub fn ack(ackno: u32) -> Self {
        Packet::Ack { ackno }
    }

    /// Build a data segment, rejecting payloads over [`MAX_PAYLOAD`].
    pub fn data(ackno: u32, seqno: u32, payload: Bytes) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD {
            return Err(RelStreamError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        Ok(Packet::Data {
            ackno,
            seqno,
            payload,
        })
    }

    /// Build the end-of-stream marker.
    pub fn eof(ackno: u32, seqno: u32) -> Self {
        Packet::Data {
            ackno,
            seqno,
            payload: Bytes::new(),
        }
    }

    /// Whether this is a data packet with an empty payload.
    pub fn is_eof(&self) -> bool {
        matches!(self, Packet::Data { payload, .. } if payload.is_empty())
    }

    /// The total number of bytes this packet occupies when encoded.
    pub fn encoded_len(&self) -> usize {
        match self {
            Packet::Ack { .. } => ACK_LEN,
            Packet::Data { payload, .. } => DATA_HEADER_LEN + payload.len(),
        }
    }

    /// Encode this packet, checksum included.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Encode into a `BytesMut`, appending after any bytes already present.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u16(0);
        buf.put_u16(self.encoded_len() as u16);
        match self {
            Packet::Ack { ackno } => {
                buf.put_u32(*ackno);
            }
            Packet::Data {
                ackno,
                seqno,
                payload,
            } => {
                debug_assert!(payload.len() <= MAX_PAYLOAD);
                buf.put_u32(*ackno);
                buf.put_u32(*seqno);
                buf.put_slice(payload);
            }
        }
        let sum = checksum::compute(&buf[start + 2..]);
        buf[start..start + 2].copy_from_slice(&sum.to_be_bytes());
    }

    /// Decode one datagram.
    ///
    /// Any inconsistency between the datagram and its header, or a checksum
    /// that does not match, is reported as an error for which
    /// [`RelStreamError::is_corruption`] holds.
    pub fn decode(data: &[u8]) -> Result<Self> {
        Self::ensure_len(data, ACK_LEN)?;

        let carried = (&data[0..2]).get_u16();
        let declared = (&data[2..4]).get_u16();
        let len = declared as usize;
        if len != data.len() {
            return Err(RelStreamError::LengthMismatch {
                declared: len,
                actual: data.len(),
            });
        }
        if len != ACK_LEN && !(DATA_HEADER_LEN..=MAX_PACKET_LEN).contains(&len) {
            return Err(RelStreamError::InvalidLength(declared));
        }

        let computed = checksum::compute(&data[2..len]);
        if computed != carried {
            return Err(RelStreamError::ChecksumMismatch { carried, computed });
        }

        let ackno = (&data[4..8]).get_u32();
        if len == ACK_LEN {
            return Ok(Packet::Ack { ackno });
        }

        let seqno = (&data[8..12]).get_u32();
        let payload = Bytes::copy_from_slice(&data[DATA_HEADER_LEN..len]);
        Ok(Packet::Data {
            ackno,
            seqno,
            payload,
        })
    }

    fn ensure_len(data: &[u8], needed: usize) -> Result<()> {
        if data.len() < needed {
            Err(RelStreamError::PacketTooShort {
                expected: needed,
                actual: data.len(),
            })
        } else {
            Ok(())
        }
    }
}

/// The 16-bit ones'-complement checksum carried in every packet.
pub mod checksum {
    /// Checksum of `data`, folded and complemented.
    ///
    /// The checksum field is the first word of a packet, so summing from
    /// offset 2 gives the same result as summing with the field zeroed.
    /// A result of zero is sent as `0xFFFF`; both encode ones'-complement zero.
    pub fn compute(data: &[u8]) -> u16 {
        let mut sum: u64 = 0;
        let mut words = data.chunks_exact(2);
        for word in &mut words {
            sum += u16::from_be_bytes([word[0], word[1]]) as u64;
        }
        if let [last] = words.remainder() {
            sum += (*last as u64) << 8;
        }
        while sum > 0xffff {
            sum = (sum >> 16) + (sum & 0xffff);
        }
        match !(sum as u16) {
            0 => 0xffff,
            c => c,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_wire_layout() {
        let encoded = Packet::ack(0x0102_0304).encode();
        assert_eq!(encoded.len(), ACK_LEN);
        assert_eq!(&encoded[2..], &[0x00, 0x08, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(
            u16::from_be_bytes([encoded[0], encoded[1]]),
            checksum::compute(&encoded[2..])
        );
    }

    #[test]
    fn eof_is_twelve_bytes() {
        let eof = Packet::eof(3, 9);
        assert!(eof.is_eof());
        let encoded = eof.encode();
        assert_eq!(encoded.len(), DATA_HEADER_LEN);
        assert_eq!(&encoded[2..4], &[0x00, 0x0c]);
        assert_eq!(&encoded[8..12], &[0x00, 0x00, 0x00, 0x09]);
        assert_eq!(Packet::decode(&encoded).unwrap(), eof);
    }

    #[test]
    fn checksum_odd_length_pads_low_byte() {
        // 0x0102 + 0x0300 = 0x0402 -> !0x0402 = 0xfbfd
        assert_eq!(checksum::compute(&[0x01, 0x02, 0x03]), 0xfbfd);
    }

    #[test]
    fn checksum_never_zero() {
        // Sum folds to 0xffff, whose complement is zero.
        assert_eq!(checksum::compute(&[0xff, 0xff]), 0xffff);
    }

    #[test]
    fn oversized_payload_rejected() {
        let result = Packet::data(0, 1, Bytes::from(vec![0u8; MAX_PAYLOAD + 1]));
        assert!(matches!(
            result,
            Err(RelStreamError::PayloadTooLarge { size: 501, max: 500 })
        ));
    }

    #[test]
    fn encode_into_appends() {
        let mut buf = BytesMut::from(&b"xx"[..]);
        Packet::ack(7).encode_into(&mut buf);
        assert_eq!(&buf[..2], b"xx");
        assert_eq!(Packet::decode(&buf[2..]).unwrap(), Packet::ack(7));
    }
}
