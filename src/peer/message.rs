//! Peer wire messages.
//!
//! Every post-handshake message is framed as a 4-byte big-endian length,
//! a 1-byte id, and a payload. A zero-length frame is a keepalive.

/// A decoded peer wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Zero-length frame; carries no id.
    KeepAlive,
    /// Remote stops serving our requests.
    Choke,
    /// Remote will serve our requests.
    Unchoke,
    /// We want to download from the remote.
    Interested,
    /// Remote obtained a piece. Ignored on the leecher path.
    Have { piece_index: u32 },
    /// Piece bitmap; must be the remote's first post-handshake message.
    Bitfield { bitfield: Vec<u8> },
    /// Request one block of a piece.
    Request { index: u32, begin: u32, length: u32 },
    /// One block of piece data.
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    /// Extension protocol message (BEP 10): sub-id plus bencoded payload.
    Extended { id: u8, payload: Vec<u8> },
    /// Any id this leecher does not handle.
    Unknown { id: u8, payload: Vec<u8> },
}

impl PeerMessage {
    /// Wire message id, if any.
    pub fn id(&self) -> Option<u8> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(0),
            Self::Unchoke => Some(1),
            Self::Interested => Some(2),
            Self::Have { .. } => Some(4),
            Self::Bitfield { .. } => Some(5),
            Self::Request { .. } => Some(6),
            Self::Piece { .. } => Some(7),
            Self::Extended { .. } => Some(20),
            Self::Unknown { id, .. } => Some(*id),
        }
    }

    /// Encode as a complete frame including the length prefix.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::KeepAlive => vec![0, 0, 0, 0],
            Self::Choke => vec![0, 0, 0, 1, 0],
            Self::Unchoke => vec![0, 0, 0, 1, 1],
            Self::Interested => vec![0, 0, 0, 1, 2],

            Self::Have { piece_index } => {
                let mut buf = vec![0, 0, 0, 5, 4];
                buf.extend_from_slice(&piece_index.to_be_bytes());
                buf
            }

            Self::Bitfield { bitfield } => {
                let len = 1 + bitfield.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(5);
                buf.extend_from_slice(bitfield);
                buf
            }

            Self::Request {
                index,
                begin,
                length,
            } => {
                let mut buf = vec![0, 0, 0, 13, 6];
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }

            Self::Piece {
                index,
                begin,
                block,
            } => {
                let len = 9 + block.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(7);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(block);
                buf
            }

            Self::Extended { id, payload } => {
                let len = 2 + payload.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(20);
                buf.push(*id);
                buf.extend_from_slice(payload);
                buf
            }

            Self::Unknown { id, payload } => {
                let len = 1 + payload.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(*id);
                buf.extend_from_slice(payload);
                buf
            }
        }
    }

    /// Decode a frame body (id plus payload, length prefix already
    /// stripped). An empty body is a keepalive.
    pub fn decode(body: &[u8]) -> Result<Self, String> {
        if body.is_empty() {
            return Ok(Self::KeepAlive);
        }

        let id = body[0];
        let payload = &body[1..];

        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),

            4 => {
                if payload.len() < 4 {
                    return Err("have message too short".to_string());
                }
                Ok(Self::Have {
                    piece_index: be_u32(&payload[0..4]),
                })
            }

            5 => Ok(Self::Bitfield {
                bitfield: payload.to_vec(),
            }),

            6 => {
                if payload.len() < 12 {
                    return Err("request message too short".to_string());
                }
                Ok(Self::Request {
                    index: be_u32(&payload[0..4]),
                    begin: be_u32(&payload[4..8]),
                    length: be_u32(&payload[8..12]),
                })
            }

            7 => {
                if payload.len() < 8 {
                    return Err(format!("piece message too short: {} bytes", payload.len()));
                }
                Ok(Self::Piece {
                    index: be_u32(&payload[0..4]),
                    begin: be_u32(&payload[4..8]),
                    block: payload[8..].to_vec(),
                })
            }

            20 => {
                if payload.is_empty() {
                    return Err("extended message too short".to_string());
                }
                Ok(Self::Extended {
                    id: payload[0],
                    payload: payload[1..].to_vec(),
                })
            }

            _ => Ok(Self::Unknown {
                id,
                payload: payload.to_vec(),
            }),
        }
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_frames() {
        assert_eq!(PeerMessage::KeepAlive.encode(), vec![0, 0, 0, 0]);
        assert_eq!(PeerMessage::Choke.encode(), vec![0, 0, 0, 1, 0]);
        assert_eq!(PeerMessage::Unchoke.encode(), vec![0, 0, 0, 1, 1]);
        assert_eq!(PeerMessage::Interested.encode(), vec![0, 0, 0, 1, 2]);
    }

    #[test]
    fn request_roundtrip() {
        let msg = PeerMessage::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        };
        let encoded = msg.encode();
        assert_eq!(encoded.len(), 17);
        assert_eq!(PeerMessage::decode(&encoded[4..]).unwrap(), msg);
    }

    #[test]
    fn piece_roundtrip() {
        let msg = PeerMessage::Piece {
            index: 3,
            begin: 32768,
            block: vec![0xabu8; 64],
        };
        let encoded = msg.encode();
        assert_eq!(PeerMessage::decode(&encoded[4..]).unwrap(), msg);
    }

    #[test]
    fn extended_roundtrip() {
        let msg = PeerMessage::Extended {
            id: 0,
            payload: b"d1:md11:ut_metadatai1eee".to_vec(),
        };
        let encoded = msg.encode();
        assert_eq!(PeerMessage::decode(&encoded[4..]).unwrap(), msg);
    }

    #[test]
    fn empty_body_is_keepalive() {
        assert_eq!(PeerMessage::decode(&[]).unwrap(), PeerMessage::KeepAlive);
    }

    #[test]
    fn short_piece_payload_rejected() {
        // id 7 with a 4-byte payload lacks the begin field.
        assert!(PeerMessage::decode(&[7, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn unknown_id_preserved() {
        let decoded = PeerMessage::decode(&[9, 0x1a, 0xe1]).unwrap();
        assert_eq!(
            decoded,
            PeerMessage::Unknown {
                id: 9,
                payload: vec![0x1a, 0xe1]
            }
        );
        assert_eq!(decoded.id(), Some(9));
    }
}
