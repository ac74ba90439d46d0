//! Wire codec for both directions of the channel.
//!
//! Forward channel bodies are a single JSON document:
//!
//! ```text
//! {"ofs": 3, "maps": [{"x": "3"}, {"abc": "def"}]}
//! ```
//!
//! Back channel bodies are a sequence of length-prefixed chunks. Each chunk is
//! the decimal byte length of a JSON array, a newline, then the array itself:
//!
//! ```text
//! 56
//! [{"type":"array","seq":1,"payload":[0]},{"type":"noop"}]
//! ```

use std::ops::Range;

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{ErrorKind, Map, SessionId};

/// Largest JSON body accepted in a single back-channel chunk.
pub const MAX_CHUNK_LEN: usize = 1 << 20;
const MAX_LEN_DIGITS: usize = 7;

/// Maps posted on the forward channel, `ofs` being the index of the first map
/// within the session's forward stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardBatch {
    pub ofs: u64,
    pub maps: Vec<Map>,
}

/// Sequenced batch of values pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundArray {
    #[serde(rename = "seq")]
    pub sequence_id: u64,
    pub payload: Vec<Value>,
}

/// One element of a back-channel chunk. Only `Array` frames consume sequence
/// ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackFrame {
    Open { session_id: SessionId, version: u16 },
    Array(InboundArray),
    Noop,
    Stop,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed chunk length prefix: {0:?}")]
    BadLength(String),
    #[error("chunk of {0} bytes exceeds the {} byte limit", MAX_CHUNK_LEN)]
    ChunkTooLarge(usize),
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("array sequence ids start at 1")]
    ZeroSequence,
    #[error("body ends inside a chunk ({0} bytes left over)")]
    Truncated(usize),
}

impl CodecError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::BadFormat
    }
}

/// A chunk that could not be decoded.
#[derive(Debug)]
pub struct ChunkError {
    /// Raw bytes of the offending chunk (or of the undecodable remainder when
    /// the length prefix itself is broken).
    pub raw: Bytes,
    pub error: CodecError,
    /// `true` when the length prefix was unusable and chunk boundaries can no
    /// longer be located in the stream.
    pub framing_lost: bool,
}

pub fn encode_maps(ofs: u64, maps: &[Map]) -> Result<Bytes, CodecError> {
    #[derive(Serialize)]
    struct Borrowed<'a> {
        ofs: u64,
        maps: &'a [Map],
    }
    let body = serde_json::to_vec(&Borrowed { ofs, maps })?;
    Ok(Bytes::from(body))
}

pub fn decode_maps(body: &[u8]) -> Result<ForwardBatch, CodecError> {
    Ok(serde_json::from_slice(body)?)
}

/// Encodes frames as one length-prefixed chunk.
pub fn encode_frames(frames: &[BackFrame]) -> Result<Bytes, CodecError> {
    let json = serde_json::to_vec(frames)?;
    if json.len() > MAX_CHUNK_LEN {
        return Err(CodecError::ChunkTooLarge(json.len()));
    }
    let header = format!("{}\n", json.len());
    let mut out = BytesMut::with_capacity(header.len() + json.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&json);
    Ok(out.freeze())
}

/// Encodes frames as consecutive chunks, each within [`MAX_CHUNK_LEN`],
/// keeping frame order. Fails only when one frame alone does not fit.
pub fn encode_frame_chunks(frames: &[BackFrame]) -> Result<Vec<Bytes>, CodecError> {
    chunk_ranges(frames, MAX_CHUNK_LEN)?
        .into_iter()
        .map(|range| encode_frames(&frames[range]))
        .collect()
}

/// Length of the chunk body holding `array` as its only frame.
pub fn array_chunk_len(array: &InboundArray) -> Result<usize, CodecError> {
    #[derive(Serialize)]
    struct Tagged<'a> {
        #[serde(rename = "type")]
        kind: &'static str,
        #[serde(flatten)]
        array: &'a InboundArray,
    }
    let json = serde_json::to_vec(&[Tagged {
        kind: "array",
        array,
    }])?;
    Ok(json.len())
}

fn chunk_ranges(frames: &[BackFrame], limit: usize) -> Result<Vec<Range<usize>>, CodecError> {
    let mut ranges = Vec::new();
    let mut start = 0;
    // "[" and "]"
    let mut json_len = 2;
    for (index, frame) in frames.iter().enumerate() {
        let len = serde_json::to_vec(frame)?.len();
        if len + 2 > limit {
            return Err(CodecError::ChunkTooLarge(len + 2));
        }
        let separator = usize::from(index > start);
        if json_len + separator + len > limit {
            ranges.push(start..index);
            start = index;
            json_len = 2 + len;
        } else {
            json_len += separator + len;
        }
    }
    if start < frames.len() {
        ranges.push(start..frames.len());
    }
    Ok(ranges)
}

/// Decodes a complete back-channel body into its frames.
pub fn decode_frames(body: &[u8]) -> Result<Vec<BackFrame>, CodecError> {
    let mut decoder = ChunkDecoder::new();
    decoder.push(body);
    let mut frames = Vec::new();
    while let Some(chunk) = decoder.next_chunk().map_err(|err| err.error)? {
        frames.extend(chunk);
    }
    if decoder.buffered() > 0 {
        return Err(CodecError::Truncated(decoder.buffered()));
    }
    Ok(frames)
}

/// Decodes a complete back-channel body into its sequenced arrays, skipping
/// control frames.
pub fn decode_arrays(body: &[u8]) -> Result<Vec<InboundArray>, CodecError> {
    Ok(decode_frames(body)?
        .into_iter()
        .filter_map(|frame| match frame {
            BackFrame::Array(array) => Some(array),
            _ => None,
        })
        .collect())
}

/// Incremental chunk decoder fed with arbitrary slices of a streamed body.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    buf: BytesMut,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete chunk, `Ok(None)` when more bytes are needed.
    ///
    /// A chunk is either decoded whole or rejected whole. When the length
    /// prefix is broken the buffer is drained and `framing_lost` is set.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<BackFrame>>, ChunkError> {
        let scan = self.buf.len().min(MAX_LEN_DIGITS + 1);
        let newline = self.buf[..scan].iter().position(|b| *b == b'\n');

        let Some(newline) = newline else {
            let prefix = &self.buf[..scan];
            if scan > MAX_LEN_DIGITS || !prefix.iter().all(u8::is_ascii_digit) {
                let err = CodecError::BadLength(String::from_utf8_lossy(prefix).into_owned());
                return Err(self.lose_framing(err));
            }
            return Ok(None);
        };

        let digits = &self.buf[..newline];
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            let err = CodecError::BadLength(String::from_utf8_lossy(digits).into_owned());
            return Err(self.lose_framing(err));
        }
        // At most seven ascii digits, always parses.
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(usize::MAX);
        if len > MAX_CHUNK_LEN {
            return Err(self.lose_framing(CodecError::ChunkTooLarge(len)));
        }
        if self.buf.len() < newline + 1 + len {
            return Ok(None);
        }

        self.buf.advance(newline + 1);
        let body = self.buf.split_to(len).freeze();
        match parse_frames(&body) {
            Ok(frames) => Ok(Some(frames)),
            Err(error) => Err(ChunkError {
                raw: body,
                error,
                framing_lost: false,
            }),
        }
    }

    fn lose_framing(&mut self, error: CodecError) -> ChunkError {
        let raw = self.buf.split().freeze();
        ChunkError {
            raw,
            error,
            framing_lost: true,
        }
    }
}

fn parse_frames(body: &[u8]) -> Result<Vec<BackFrame>, CodecError> {
    let frames: Vec<BackFrame> = serde_json::from_slice(body)?;
    if frames
        .iter()
        .any(|frame| matches!(frame, BackFrame::Array(array) if array.sequence_id == 0))
    {
        return Err(CodecError::ZeroSequence);
    }
    Ok(frames)
}


#[cfg(test)]
mod props {
    use super::*;
    use proptest::prelude::*;

    fn value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            (-1_000_000i32..1_000_000).prop_map(|n| Value::from(f64::from(n) / 4.0)),
            "\\PC{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 48, 5, |inner| {
            prop::collection::btree_map("[a-zA-Z0-9_]{1,8}", inner, 0..5)
                .prop_map(|entries| Value::Object(entries.into_iter().collect()))
        })
    }

    fn map() -> impl Strategy<Value = Map> {
        prop::collection::btree_map("[a-zA-Z0-9_]{1,8}", value(), 0..5).prop_map(|entries| {
            Map::try_from(entries.into_iter().collect::<serde_json::Map<_, _>>())
                .expect("generated values never hold arrays")
        })
    }

    fn frame() -> impl Strategy<Value = BackFrame> {
        prop_oneof![
            Just(BackFrame::Noop),
            Just(BackFrame::Stop),
            any::<u128>().prop_map(|raw| BackFrame::Open {
                session_id: SessionId::from(uuid::Uuid::from_u128(raw)),
                version: crate::PROTOCOL_VERSION,
            }),
            (1u64..u64::MAX, prop::collection::vec(map(), 0..3)).prop_map(|(seq, maps)| {
                BackFrame::Array(InboundArray {
                    sequence_id: seq,
                    payload: maps.into_iter().map(|map| Value::Object(map.into_inner())).collect(),
                })
            }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]

        #[test]
        fn forward_batches_round_trip(ofs in any::<u64>(), maps in prop::collection::vec(map(), 0..6)) {
            let body = encode_maps(ofs, &maps).expect("encode");
            let batch = decode_maps(&body).expect("decode");
            prop_assert_eq!(batch.ofs, ofs);
            prop_assert_eq!(batch.maps, maps);
        }

        #[test]
        fn chunks_survive_arbitrary_splits(
            chunks in prop::collection::vec(prop::collection::vec(frame(), 1..4), 1..5),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let mut stream = Vec::new();
            for frames in &chunks {
                stream.extend_from_slice(&encode_frames(frames).expect("encode"));
            }
            let mut cuts: Vec<usize> = cuts.iter().map(|cut| cut.index(stream.len() + 1)).collect();
            cuts.push(stream.len());
            cuts.sort_unstable();
            cuts.dedup();

            let mut decoder = ChunkDecoder::new();
            let mut decoded = Vec::new();
            let mut from = 0;
            for cut in cuts {
                decoder.push(&stream[from..cut]);
                from = cut;
                while let Some(chunk) = decoder.next_chunk().expect("well-formed chunk") {
                    decoded.push(chunk);
                }
            }
            prop_assert_eq!(decoder.buffered(), 0);
            prop_assert_eq!(decoded, chunks);
        }
    }
}
