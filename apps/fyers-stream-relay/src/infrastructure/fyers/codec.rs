//! Tick Frame Codec
//!
//! Decodes the binary frames sent by the Fyers data socket.
//!
//! # Wire Format
//!
//! Each binary WebSocket message holds exactly one tick, serialized with
//! the protobuf tagged-field encoding:
//!
//! | Field | Wire type | Meaning                      |
//! |-------|-----------|------------------------------|
//! | 1     | varint    | timestamp, epoch millis (i64)|
//! | 2     | fixed64   | last traded price (f64)      |
//! | 3     | varint    | volume (i64)                 |
//! | 4     | bytes     | symbol (optional, UTF-8)     |
//!
//! Fields 1-3 are required. Field 4 only appears in the richer schema
//! variant and lets the relay route a tick by instrument. Decoding is
//! strict: unknown field numbers, mismatched wire types, duplicates and
//! truncation are all errors.

use prost::Message;
use prost::bytes::Buf;
use prost::encoding::{WireType, decode_key, decode_varint};

use crate::domain::streaming::{DecodedTick, Tick};

const FIELD_TIMESTAMP: u32 = 1;
const FIELD_LTP: u32 = 2;
const FIELD_VOLUME: u32 = 3;
const FIELD_SYMBOL: u32 = 4;

// =============================================================================
// Errors
// =============================================================================

/// A malformed upstream frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed tick frame ({len} bytes): {reason}")]
pub struct DecodeError {
    /// Length of the raw frame.
    pub len: usize,
    /// What was wrong with it.
    pub reason: DecodeFailure,
}

/// Why a frame failed to decode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeFailure {
    /// Zero-length frame.
    #[error("empty frame")]
    Empty,

    /// The buffer ended inside a field.
    #[error("truncated in field {0}")]
    Truncated(u32),

    /// A key or varint could not be read.
    #[error("malformed encoding: {0}")]
    Malformed(String),

    /// A known field arrived with the wrong wire type.
    #[error("field {field} has wire type {actual:?}, expected {expected:?}")]
    WireTypeMismatch {
        /// Field number.
        field: u32,
        /// Wire type the schema requires.
        expected: WireType,
        /// Wire type found in the frame.
        actual: WireType,
    },

    /// A field number outside the schema.
    #[error("unexpected field number {0}")]
    UnexpectedField(u32),

    /// The same field appeared twice.
    #[error("duplicate field {0}")]
    DuplicateField(u32),

    /// A required field never appeared.
    #[error("missing required field {0}")]
    MissingField(u32),

    /// The symbol field was not UTF-8.
    #[error("symbol is not valid UTF-8")]
    InvalidSymbol,

    /// The price was NaN or infinite.
    #[error("last traded price is not finite")]
    NonFiniteLtp,
}

// =============================================================================
// Frame Message
// =============================================================================

/// Message definition for the tick frame, used to encode frames.
///
/// Decoding goes through [`TickCodec::decode`] instead, because the
/// derived decoder silently skips unknown fields.
#[derive(Clone, PartialEq, Message)]
pub struct TickFrame {
    /// Epoch milliseconds.
    #[prost(int64, optional, tag = "1")]
    pub timestamp: Option<i64>,
    /// Last traded price.
    #[prost(double, optional, tag = "2")]
    pub ltp: Option<f64>,
    /// Volume.
    #[prost(int64, optional, tag = "3")]
    pub volume: Option<i64>,
    /// Instrument symbol (richer schema variant).
    #[prost(string, optional, tag = "4")]
    pub symbol: Option<String>,
}

// =============================================================================
// Codec
// =============================================================================

/// Strict decoder for Fyers tick frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickCodec;

impl TickCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one binary frame.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError` carrying the frame length if the frame is
    /// empty, truncated, has an unknown or duplicated field, uses the
    /// wrong wire type for a field, or lacks any of fields 1-3.
    pub fn decode(&self, frame: &[u8]) -> Result<DecodedTick, DecodeError> {
        decode_fields(frame).map_err(|reason| DecodeError {
            len: frame.len(),
            reason,
        })
    }

    /// Encode a tick, optionally tagged with its instrument.
    #[must_use]
    pub fn encode(&self, tick: &Tick, instrument: Option<&str>) -> Vec<u8> {
        TickFrame {
            timestamp: Some(tick.timestamp),
            ltp: Some(tick.last_traded_price),
            volume: Some(tick.volume),
            symbol: instrument.map(str::to_string),
        }
        .encode_to_vec()
    }
}

#[allow(clippy::cast_possible_wrap)]
fn decode_fields(frame: &[u8]) -> Result<DecodedTick, DecodeFailure> {
    if frame.is_empty() {
        return Err(DecodeFailure::Empty);
    }

    let mut buf = frame;
    let mut timestamp = None;
    let mut ltp = None;
    let mut volume = None;
    let mut symbol = None;

    while buf.has_remaining() {
        let (field, wire_type) =
            decode_key(&mut buf).map_err(|e| DecodeFailure::Malformed(e.to_string()))?;

        match field {
            FIELD_TIMESTAMP => {
                expect_wire_type(field, wire_type, WireType::Varint)?;
                let value = read_varint(&mut buf, field)?;
                set_once(&mut timestamp, value as i64, field)?;
            }
            FIELD_LTP => {
                expect_wire_type(field, wire_type, WireType::SixtyFourBit)?;
                if buf.remaining() < 8 {
                    return Err(DecodeFailure::Truncated(field));
                }
                let value = buf.get_f64_le();
                if !value.is_finite() {
                    return Err(DecodeFailure::NonFiniteLtp);
                }
                set_once(&mut ltp, value, field)?;
            }
            FIELD_VOLUME => {
                expect_wire_type(field, wire_type, WireType::Varint)?;
                let value = read_varint(&mut buf, field)?;
                set_once(&mut volume, value as i64, field)?;
            }
            FIELD_SYMBOL => {
                expect_wire_type(field, wire_type, WireType::LengthDelimited)?;
                let len = usize::try_from(read_varint(&mut buf, field)?)
                    .map_err(|_| DecodeFailure::Truncated(field))?;
                if buf.remaining() < len {
                    return Err(DecodeFailure::Truncated(field));
                }
                let (raw, rest) = buf.split_at(len);
                buf = rest;
                let text = std::str::from_utf8(raw).map_err(|_| DecodeFailure::InvalidSymbol)?;
                set_once(&mut symbol, text.to_string(), field)?;
            }
            other => return Err(DecodeFailure::UnexpectedField(other)),
        }
    }

    let tick = Tick {
        timestamp: timestamp.ok_or(DecodeFailure::MissingField(FIELD_TIMESTAMP))?,
        last_traded_price: ltp.ok_or(DecodeFailure::MissingField(FIELD_LTP))?,
        volume: volume.ok_or(DecodeFailure::MissingField(FIELD_VOLUME))?,
    };

    Ok(DecodedTick {
        tick,
        instrument: symbol,
    })
}

fn expect_wire_type(field: u32, actual: WireType, expected: WireType) -> Result<(), DecodeFailure> {
    if actual == expected {
        Ok(())
    } else {
        Err(DecodeFailure::WireTypeMismatch {
            field,
            expected,
            actual,
        })
    }
}

fn read_varint(buf: &mut &[u8], field: u32) -> Result<u64, DecodeFailure> {
    if !buf.has_remaining() {
        return Err(DecodeFailure::Truncated(field));
    }
    // A varint whose last byte still has the continuation bit set ran off the end.
    if buf.len() < 10 && buf.iter().all(|byte| byte & 0x80 != 0) {
        return Err(DecodeFailure::Truncated(field));
    }
    decode_varint(buf).map_err(|e| DecodeFailure::Malformed(e.to_string()))
}

fn set_once<T>(slot: &mut Option<T>, value: T, field: u32) -> Result<(), DecodeFailure> {
    if slot.is_some() {
        return Err(DecodeFailure::DuplicateField(field));
    }
    *slot = Some(value);
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
