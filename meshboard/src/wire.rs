//! Wire protocol: typed messages and stream framing.
//!
//! Every message travels as one UTF-8 JSON object with a mandatory string
//! field `type`. The byte stream carries concatenated objects; the encoder
//! appends a `\n` after each one for the benefit of line-oriented peers, but
//! the decoder does not rely on it: frames are recovered by counting
//! balanced `{`/`}` bytes. That is safe here because every string payload is
//! base64 or an alphanumeric id, never raw braces.
//!
//! ```json
//! {"type":"joined","clientId":"04421973xkQ2za"}
//! {"type":"request","clientId":"04421973xkQ2za","logicalTime":3}
//! ```

use std::net::SocketAddr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("message encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed frame: {0}")]
    Decode(#[source] serde_json::Error),
}

/// A single point on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

/// Pen color. On the wire this is the integer 255 (white) or 0 (black).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Black,
    White,
}

impl Serialize for Color {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(match self {
            Color::White => 255,
            Color::Black => 0,
        })
    }
}

impl<'de> Deserialize<'de> for Color {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            255 => Ok(Color::White),
            0 => Ok(Color::Black),
            other => Err(serde::de::Error::custom(format!(
                "invalid color value: {other}"
            ))),
        }
    }
}

/// Token state carried inside an [`Message::Image`] snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    #[serde(rename = "clientId")]
    pub client_id: Option<String>,
    #[serde(rename = "hasLock")]
    pub has_lock: bool,
}

/// One row of the Ricart–Agrawala table: the participant's last request
/// time (R) and last blockade time (G).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RicartRow {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "lastRequestLogicalTime")]
    pub requested: u64,
    #[serde(rename = "lastBlockadeLogicalTime")]
    pub granted: u64,
}

/// The closed set of messages participants exchange.
///
/// The two `Internal*` variants never touch the wire; they exist so peer
/// failures and token deadlines travel the same controller queue as
/// everything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// A batch of pen points in one color.
    #[serde(rename = "paint")]
    Paint {
        #[serde(rename = "pointList")]
        point_list: Vec<Point>,
        color: Color,
    },

    /// Full board snapshot, sent in reply to a direct join. Carries the
    /// sender's canvas (opaque PNG bytes), its participant list, and the
    /// current token state.
    #[serde(rename = "image")]
    Image {
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(rename = "image", with = "png_base64")]
        png: Vec<u8>,
        #[serde(rename = "clientList")]
        client_list: Vec<String>,
        token: TokenInfo,
    },

    /// A participant announcing itself. `received_from_id` and `address`
    /// are local annotations stamped by the receiving link; they are never
    /// serialised.
    #[serde(rename = "joined")]
    Join {
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(skip)]
        received_from_id: Option<String>,
        #[serde(skip)]
        address: Option<SocketAddr>,
    },

    /// Participants detected as gone, named by whoever noticed.
    #[serde(rename = "quit")]
    Quit {
        #[serde(rename = "clientList")]
        client_ids: Vec<String>,
        #[serde(rename = "detectedBy")]
        detected_by: String,
    },

    /// Wipe the board.
    #[serde(rename = "clean")]
    Clean {
        #[serde(rename = "clientId")]
        client_id: String,
    },

    /// Ask the token holder for the token.
    #[serde(rename = "request")]
    Request {
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(rename = "logicalTime")]
        logical_time: u64,
    },

    /// The holder released the lock without passing the token on.
    #[serde(rename = "resign")]
    Resign {
        #[serde(rename = "clientId")]
        client_id: String,
    },

    /// Hand the token to `dest_client_id`, with a snapshot of the (R, G)
    /// table so the recipient can pick the next owner later.
    #[serde(rename = "passToken")]
    PassToken {
        #[serde(rename = "destClientId")]
        dest_client_id: String,
        #[serde(rename = "ricartTable")]
        ricart_table: Vec<RicartRow>,
    },

    /// Auto-resign deadline elapsed; refresh the local view.
    #[serde(skip)]
    InternalReload,

    /// A peer link died; remove the participant (and everyone learned
    /// through it) from the table. `None` when the link never registered.
    #[serde(skip)]
    InternalQuit { client_id: Option<String> },
}

/// A message paired with the id of the peer on the local link it arrived
/// from. For relayed messages this differs from the author; for internal
/// events it is our own id. `None` only when the link never registered.
#[derive(Debug, Clone)]
pub struct SignedMessage {
    pub client_id: Option<String>,
    pub message: Message,
}

/// Encode a message as a single JSON line.
pub fn encode(msg: &Message) -> Result<Vec<u8>, WireError> {
    let mut bytes = serde_json::to_vec(msg).map_err(WireError::Encode)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode one framed message. Unknown `type` values and malformed JSON both
/// surface as [`WireError::Decode`]; the caller drops the frame and keeps
/// the connection.
pub fn decode(frame: &[u8]) -> Result<Message, WireError> {
    serde_json::from_slice(frame).map_err(WireError::Decode)
}

/// PNG bytes ride inside JSON as standard base64.
mod png_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Recovers message boundaries from a TCP byte stream.
///
/// Bytes outside a frame are skipped until a `{` opens one; inside a frame
/// every `{` and `}` adjusts the depth, and the frame is emitted when the
/// depth returns to zero. One read may complete zero, one, or many frames;
/// a partial tail is retained for the next read.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
    depth: u32,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed freshly read bytes, returning every frame they completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &b in bytes {
            if self.depth == 0 {
                if b == b'{' {
                    self.buf.clear();
                    self.buf.push(b);
                    self.depth = 1;
                }
                continue;
            }
            self.buf.push(b);
            match b {
                b'{' => self.depth += 1,
                b'}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        frames.push(std::mem::take(&mut self.buf));
                    }
                }
                _ => {}
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &Message) -> Message {
        let bytes = encode(msg).expect("encode");
        assert_eq!(bytes.last(), Some(&b'\n'));
        decode(&bytes[..bytes.len() - 1]).expect("decode")
    }

    #[test]
    fn paint_roundtrip() {
        let msg = Message::Paint {
            point_list: vec![Point { x: 1, y: 2 }, Point { x: 3, y: 4 }],
            color: Color::White,
        };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn image_roundtrip_and_base64_payload() {
        let msg = Message::Image {
            client_id: "abc".into(),
            png: vec![0x89, b'P', b'N', b'G', 0, 255],
            client_list: vec!["abc".into(), "def".into()],
            token: TokenInfo {
                client_id: Some("abc".into()),
                has_lock: true,
            },
        };
        let encoded = encode(&msg).unwrap();
        let text = std::str::from_utf8(&encoded).unwrap();
        // The PNG bytes must appear as a base64 string, not a byte array.
        assert!(text.contains("\"image\":\""), "{text}");
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn join_roundtrip_strips_local_annotations() {
        let msg = Message::Join {
            client_id: "abc".into(),
            received_from_id: Some("relay".into()),
            address: Some("127.0.0.1:5555".parse().unwrap()),
        };
        let decoded = roundtrip(&msg);
        assert_eq!(
            decoded,
            Message::Join {
                client_id: "abc".into(),
                received_from_id: None,
                address: None,
            }
        );
        let text = String::from_utf8(encode(&msg).unwrap()).unwrap();
        assert!(!text.contains("relay"));
    }

    #[test]
    fn quit_clean_request_resign_roundtrip() {
        for msg in [
            Message::Quit {
                client_ids: vec!["a".into(), "b".into()],
                detected_by: "c".into(),
            },
            Message::Clean {
                client_id: "a".into(),
            },
            Message::Request {
                client_id: "a".into(),
                logical_time: 17,
            },
            Message::Resign {
                client_id: "a".into(),
            },
        ] {
            assert_eq!(roundtrip(&msg), msg);
        }
    }

    #[test]
    fn pass_token_roundtrip_with_table() {
        let msg = Message::PassToken {
            dest_client_id: "b".into(),
            ricart_table: vec![
                RicartRow {
                    client_id: "a".into(),
                    requested: 0,
                    granted: 0,
                },
                RicartRow {
                    client_id: "b".into(),
                    requested: 1,
                    granted: 0,
                },
            ],
        };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn color_encodes_as_integer() {
        let white = serde_json::to_string(&Color::White).unwrap();
        let black = serde_json::to_string(&Color::Black).unwrap();
        assert_eq!(white, "255");
        assert_eq!(black, "0");
        assert!(serde_json::from_str::<Color>("7").is_err());
    }

    #[test]
    fn unknown_type_is_a_decode_error() {
        let err = decode(br#"{"type":"shrug","clientId":"x"}"#);
        assert!(matches!(err, Err(WireError::Decode(_))));
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        assert!(decode(b"{\"type\":\"joined\"").is_err());
        assert!(decode(b"not json at all").is_err());
    }

    #[test]
    fn framing_splits_concatenated_stream() {
        let m1 = Message::Clean {
            client_id: "a".into(),
        };
        let m2 = Message::Request {
            client_id: "b".into(),
            logical_time: 2,
        };
        let mut stream = encode(&m1).unwrap();
        stream.extend(encode(&m2).unwrap());

        let mut reader = FrameReader::new();
        let frames = reader.push(&stream);
        assert_eq!(frames.len(), 2);
        assert_eq!(decode(&frames[0]).unwrap(), m1);
        assert_eq!(decode(&frames[1]).unwrap(), m2);
    }

    #[test]
    fn framing_survives_byte_by_byte_delivery() {
        let m1 = Message::PassToken {
            dest_client_id: "b".into(),
            ricart_table: vec![RicartRow {
                client_id: "b".into(),
                requested: 3,
                granted: 1,
            }],
        };
        let m2 = Message::Paint {
            point_list: vec![Point { x: -5, y: 9 }],
            color: Color::Black,
        };
        let mut stream = encode(&m1).unwrap();
        stream.extend(encode(&m2).unwrap());

        let mut reader = FrameReader::new();
        let mut frames = Vec::new();
        for &b in &stream {
            frames.extend(reader.push(&[b]));
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(decode(&frames[0]).unwrap(), m1);
        assert_eq!(decode(&frames[1]).unwrap(), m2);
    }

    #[test]
    fn framing_ignores_noise_between_frames() {
        let msg = Message::Resign {
            client_id: "a".into(),
        };
        let encoded = encode(&msg).unwrap();
        let mut stream = b"\r\n  ".to_vec();
        stream.extend(&encoded);
        stream.extend(b"\n\n");
        stream.extend(&encoded);

        let mut reader = FrameReader::new();
        let frames = reader.push(&stream);
        assert_eq!(frames.len(), 2);
        for frame in frames {
            assert_eq!(decode(&frame).unwrap(), msg);
        }
    }

    #[test]
    fn framing_handles_nested_braces() {
        // The token object nests one level deeper than the top frame.
        let msg = Message::Image {
            client_id: "a".into(),
            png: vec![1, 2, 3],
            client_list: vec!["a".into()],
            token: TokenInfo {
                client_id: None,
                has_lock: false,
            },
        };
        let encoded = encode(&msg).unwrap();
        let mut reader = FrameReader::new();
        let frames = reader.push(&encoded);
        assert_eq!(frames.len(), 1);
        assert_eq!(decode(&frames[0]).unwrap(), msg);
    }
}
