use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use std::fmt;
use std::io::Read;

use crate::error::ApplicationError;

/// The BitTorrent protocol identifier string
pub const PROTOCOL_STR: &str = "BitTorrent protocol";

/// Bytes in a handshake besides the protocol name itself:
/// name-length byte + 8 reserved + 20 info_hash + 20 peer_id.
pub const HANDSHAKE_OVERHEAD: usize = 1 + 8 + 20 + 20;

/// Length of the handshake we send (always 68 bytes)
pub const HANDSHAKE_LEN: usize = PROTOCOL_STR.len() + HANDSHAKE_OVERHEAD;

pub const CHOKE_ID: u8 = 0;
pub const UNCHOKE_ID: u8 = 1;
pub const INTERESTED_ID: u8 = 2;
pub const NOT_INTERESTED_ID: u8 = 3;
pub const HAVE_ID: u8 = 4;
pub const BITFIELD_ID: u8 = 5;
pub const REQUEST_ID: u8 = 6;
pub const PIECE_ID: u8 = 7;
pub const CANCEL_ID: u8 = 8;

/// Total handshake length announced by its first byte.
pub fn handshake_len(pstrlen: u8) -> usize {
    pstrlen as usize + HANDSHAKE_OVERHEAD
}

/// 20-byte peer identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

/// SHA-1 of the torrent's info dictionary
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self)
    }
}

/// Represents a BitTorrent handshake message.
///
/// We always send the 19-byte protocol name, but a peer may announce a
/// different name length; decoding honours whatever length it declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    /// SHA-1 hash of the info dictionary
    pub info_hash: InfoHash,
    /// 20-byte string used to identify the client
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Encodes the handshake into a 68-byte array.
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let name = PROTOCOL_STR.len();
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = name as u8;
        buf[1..1 + name].copy_from_slice(PROTOCOL_STR.as_bytes());
        buf[1 + name..9 + name].copy_from_slice(&self.reserved);
        buf[9 + name..29 + name].copy_from_slice(&self.info_hash.0);
        buf[29 + name..49 + name].copy_from_slice(&self.peer_id.0);
        buf
    }

    /// Decodes one handshake record from the front of `buf`, advancing it
    /// past the record.
    ///
    /// The first byte is the protocol-name length `L`; the record spans
    /// `L + 49` bytes.
    pub fn read_from(buf: &mut &[u8]) -> Result<Self, ApplicationError> {
        let pstrlen = buf.read_u8().map_err(ApplicationError::underrun)?;
        let total = handshake_len(pstrlen);
        if buf.len() + 1 < total {
            return Err(ApplicationError::protocol(format!(
                "handshake needs {} bytes, got {}",
                total,
                buf.len() + 1
            )));
        }

        let mut name = vec![0u8; pstrlen as usize];
        buf.read_exact(&mut name).map_err(ApplicationError::underrun)?;

        let mut reserved = [0u8; 8];
        buf.read_exact(&mut reserved)
            .map_err(ApplicationError::underrun)?;

        let mut info_hash = [0u8; 20];
        buf.read_exact(&mut info_hash)
            .map_err(ApplicationError::underrun)?;

        let mut peer_id = [0u8; 20];
        buf.read_exact(&mut peer_id)
            .map_err(ApplicationError::underrun)?;

        Ok(Self {
            reserved,
            info_hash: InfoHash(info_hash),
            peer_id: PeerId(peer_id),
        })
    }

    /// Decodes a buffer holding exactly one handshake record.
    pub fn decode(mut buf: &[u8]) -> Result<Self, ApplicationError> {
        let handshake = Self::read_from(&mut buf)?;
        if !buf.is_empty() {
            return Err(ApplicationError::protocol(format!(
                "{} trailing bytes after handshake",
                buf.len()
            )));
        }
        Ok(handshake)
    }
}

/// Represents a protocol message exchanged after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// zero-length frame, no id
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// `have` message: peer has a specific piece
    Have(u32),
    /// `bitfield` message: bitmap of pieces the peer has
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    Cancel { index: u32, begin: u32, length: u32 },
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    let mut bytes = [0u8; 4];
    BigEndian::write_u32(&mut bytes, value);
    buf.extend_from_slice(&bytes);
}

/// Length prefix followed by the type byte.
fn put_header(buf: &mut Vec<u8>, len: u32, id: u8) {
    put_u32(buf, len);
    buf.push(id);
}

impl Message {
    /// Serializes a `Message` into a byte vector for transmission.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Appends the framed message to `buf`. Used to batch several
    /// requests into a single write.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Message::KeepAlive => put_u32(buf, 0),
            Message::Choke => put_header(buf, 1, CHOKE_ID),
            Message::Unchoke => put_header(buf, 1, UNCHOKE_ID),
            Message::Interested => put_header(buf, 1, INTERESTED_ID),
            Message::NotInterested => put_header(buf, 1, NOT_INTERESTED_ID),
            Message::Have(index) => {
                put_header(buf, 5, HAVE_ID);
                put_u32(buf, *index);
            }
            Message::Bitfield(bitfield) => {
                put_header(buf, 1 + bitfield.len() as u32, BITFIELD_ID);
                buf.extend_from_slice(bitfield);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                put_header(buf, 13, REQUEST_ID);
                put_u32(buf, *index);
                put_u32(buf, *begin);
                put_u32(buf, *length);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                put_header(buf, 9 + block.len() as u32, PIECE_ID);
                put_u32(buf, *index);
                put_u32(buf, *begin);
                buf.extend_from_slice(block);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                put_header(buf, 13, CANCEL_ID);
                put_u32(buf, *index);
                put_u32(buf, *begin);
                put_u32(buf, *length);
            }
        }
    }

    /// Decodes one length-prefixed message from the front of `buf` and
    /// advances it past the message.
    ///
    /// Never reads beyond the declared length or the end of the buffer: a
    /// short buffer yields a `ProtocolError` instead.
    pub fn read_from<'a>(buf: &mut &'a [u8]) -> Result<Self, ApplicationError> {
        let len = buf
            .read_u32::<BigEndian>()
            .map_err(ApplicationError::underrun)? as usize;

        if len == 0 {
            return Ok(Message::KeepAlive);
        }

        if buf.len() < len {
            return Err(ApplicationError::protocol(format!(
                "incomplete message: declared {} bytes, {} available",
                len,
                buf.len()
            )));
        }

        let data: &'a [u8] = *buf;
        let (frame, rest) = data.split_at(len);
        *buf = rest;
        Self::decode_body(frame)
    }

    /// Decodes a message body: the id byte followed by its payload.
    pub fn decode_body(mut frame: &[u8]) -> Result<Self, ApplicationError> {
        let id = frame.read_u8().map_err(ApplicationError::underrun)?;
        let payload_len = frame.len();

        let expect = |want: usize, name: &str| {
            if payload_len != want {
                Err(ApplicationError::protocol(format!(
                    "invalid {} message length: {}",
                    name, payload_len
                )))
            } else {
                Ok(())
            }
        };

        let message = match id {
            CHOKE_ID => {
                expect(0, "choke")?;
                Message::Choke
            }
            UNCHOKE_ID => {
                expect(0, "unchoke")?;
                Message::Unchoke
            }
            INTERESTED_ID => {
                expect(0, "interested")?;
                Message::Interested
            }
            NOT_INTERESTED_ID => {
                expect(0, "not interested")?;
                Message::NotInterested
            }
            HAVE_ID => {
                expect(4, "have")?;
                Message::Have(read_u32(&mut frame)?)
            }
            BITFIELD_ID => Message::Bitfield(frame.to_vec()),
            REQUEST_ID => {
                expect(12, "request")?;
                Message::Request {
                    index: read_u32(&mut frame)?,
                    begin: read_u32(&mut frame)?,
                    length: read_u32(&mut frame)?,
                }
            }
            PIECE_ID => {
                if payload_len < 8 {
                    return Err(ApplicationError::protocol(format!(
                        "invalid piece message length: {}",
                        payload_len
                    )));
                }
                let index = read_u32(&mut frame)?;
                let begin = read_u32(&mut frame)?;
                Message::Piece {
                    index,
                    begin,
                    block: frame.to_vec(),
                }
            }
            CANCEL_ID => {
                expect(12, "cancel")?;
                Message::Cancel {
                    index: read_u32(&mut frame)?,
                    begin: read_u32(&mut frame)?,
                    length: read_u32(&mut frame)?,
                }
            }
            _ => {
                return Err(ApplicationError::protocol(format!(
                    "unknown message id: {}",
                    id
                )));
            }
        };

        Ok(message)
    }
}

fn read_u32(buf: &mut &[u8]) -> Result<u32, ApplicationError> {
    buf.read_u32::<BigEndian>()
        .map_err(ApplicationError::underrun)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_roundtrip_preserves_identities() {
        let info_hash = InfoHash([0xab; 20]);
        let peer_id = PeerId(*b"-PW0001-000000000042");

        let encoded = Handshake::new(info_hash, peer_id).encode();
        assert_eq!(encoded.len(), 68);
        assert_eq!(encoded[0], 19);
        assert_eq!(&encoded[1..20], PROTOCOL_STR.as_bytes());
        assert_eq!(&encoded[20..28], &[0u8; 8]);

        let decoded = Handshake::decode(&encoded).unwrap();
        assert_eq!(decoded.info_hash, info_hash);
        assert_eq!(decoded.peer_id, peer_id);
    }

    #[test]
    fn handshake_length_follows_first_byte() {
        assert_eq!(handshake_len(19), 68);
        assert_eq!(handshake_len(0), 49);
    }

    #[test]
    fn handshake_tolerates_other_name_lengths() {
        let mut record = vec![4u8];
        record.extend_from_slice(b"abcd");
        record.extend_from_slice(&[0u8; 8]);
        record.extend_from_slice(&[1u8; 20]);
        record.extend_from_slice(&[2u8; 20]);
        assert_eq!(record.len(), handshake_len(4));

        let decoded = Handshake::decode(&record).unwrap();
        assert_eq!(decoded.info_hash, InfoHash([1u8; 20]));
        assert_eq!(decoded.peer_id, PeerId([2u8; 20]));
    }

    #[test]
    fn truncated_handshake_is_rejected() {
        let encoded = Handshake::new(InfoHash([1; 20]), PeerId([2; 20])).encode();
        let err = Handshake::decode(&encoded[..60]).unwrap_err();
        assert!(matches!(err, ApplicationError::ProtocolError(_)));
    }

    #[test]
    fn request_layout() {
        let bytes = Message::Request {
            index: 3,
            begin: 16384,
            length: 16384,
        }
        .encode();
        assert_eq!(
            bytes,
            vec![0, 0, 0, 13, 6, 0, 0, 0, 3, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
    }

    #[test]
    fn encode_into_appends_after_existing_bytes() {
        let mut buf = vec![0xff];
        Message::Cancel {
            index:  1,
            begin:  2,
            length: 3,
        }
        .encode_into(&mut buf);
        Message::Choke.encode_into(&mut buf);

        assert_eq!(
            buf,
            vec![
                0xff, 0, 0, 0, 13, 8, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0, 1, 0
            ]
        );
    }

    #[test]
    fn reads_consecutive_messages() {
        let mut buf = Vec::new();
        Message::KeepAlive.encode_into(&mut buf);
        Message::Have(7).encode_into(&mut buf);
        Message::Unchoke.encode_into(&mut buf);

        let mut cursor = buf.as_slice();
        assert_eq!(Message::read_from(&mut cursor).unwrap(), Message::KeepAlive);
        assert_eq!(Message::read_from(&mut cursor).unwrap(), Message::Have(7));
        assert_eq!(Message::read_from(&mut cursor).unwrap(), Message::Unchoke);
        assert!(cursor.is_empty());
    }

    #[test]
    fn underrun_is_a_protocol_error() {
        // Declares 13 bytes, carries 5.
        let buf = [0u8, 0, 0, 13, 6, 0, 0, 0, 1];
        let err = Message::read_from(&mut &buf[..]).unwrap_err();
        assert!(matches!(err, ApplicationError::ProtocolError(_)));

        // Have with a short payload.
        let buf = [0u8, 0, 0, 3, 4, 0, 0];
        let err = Message::read_from(&mut &buf[..]).unwrap_err();
        assert!(matches!(err, ApplicationError::ProtocolError(_)));
    }

    #[test]
    fn unknown_id_is_rejected() {
        let buf = [0u8, 0, 0, 1, 42];
        let err = Message::read_from(&mut &buf[..]).unwrap_err();
        assert!(matches!(err, ApplicationError::ProtocolError(m) if m.contains("42")));
    }
}
