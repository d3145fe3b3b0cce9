//! Op messages and their CBOR wire codec.
//!
//! Every record on the `ops` and `flush` logs carries one [`OpMessage`].
//! The op type stays a raw byte so records written by newer clients with
//! unknown types still decode; the applier skips what it does not know.

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use super::identity::ClientId;

/// Store `updated_value` at the record key.
pub const OP_PUT: u8 = b'p';
/// Delete the record key unconditionally.
pub const OP_REMOVE_ANY: u8 = b'x';
/// Marker on `ops`: a flush up to `(flush_offset_ops, flush_offset_data)`
/// is durably written to the compacted data log.
pub const OP_FLUSH_NOTIFICATION: u8 = b'n';
/// Control record on `flush` asking a flush worker to compact.
pub const OP_FLUSH_REQUEST: u8 = b'f';

/// Upper bound on one encoded op message.
pub const MAX_OP_MESSAGE_BYTES: usize = 1024 * 1024;

/// Number of fields in the v1 wire layout. Newer writers may append more;
/// decoders skip them.
const WIRE_FIELDS: u64 = 8;

/// One op on the `ops` or `flush` log.
///
/// `flush_offset_ops`/`flush_offset_data` are meaningful for the flush
/// control types only. A [`OP_FLUSH_REQUEST`] reuses the data slot for the
/// last known clean boundary (`-1` when none exists yet).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpMessage {
    pub op_type: u8,
    pub client_id: ClientId,
    pub op_id: u64,
    pub flush_offset_ops: i64,
    pub flush_offset_data: i64,
    pub expected_value: Option<Bytes>,
    pub updated_value: Option<Bytes>,
    pub merge_function: Option<Bytes>,
}

impl OpMessage {
    pub fn put(client_id: ClientId, op_id: u64, updated_value: Bytes) -> Self {
        Self {
            op_type: OP_PUT,
            client_id,
            op_id,
            flush_offset_ops: -1,
            flush_offset_data: -1,
            expected_value: None,
            updated_value: Some(updated_value),
            merge_function: None,
        }
    }

    pub fn remove_any(client_id: ClientId, op_id: u64) -> Self {
        Self {
            op_type: OP_REMOVE_ANY,
            client_id,
            op_id,
            flush_offset_ops: -1,
            flush_offset_data: -1,
            expected_value: None,
            updated_value: None,
            merge_function: None,
        }
    }

    pub fn flush_notification(
        client_id: ClientId,
        flush_offset_ops: i64,
        flush_offset_data: i64,
    ) -> Self {
        Self {
            op_type: OP_FLUSH_NOTIFICATION,
            client_id,
            op_id: 0,
            flush_offset_ops,
            flush_offset_data,
            expected_value: None,
            updated_value: None,
            merge_function: None,
        }
    }

    pub fn flush_request(
        client_id: ClientId,
        flush_offset_ops: i64,
        last_clean_offset_ops: i64,
    ) -> Self {
        Self {
            op_type: OP_FLUSH_REQUEST,
            client_id,
            op_id: 0,
            flush_offset_ops,
            flush_offset_data: last_clean_offset_ops,
            expected_value: None,
            updated_value: None,
            merge_function: None,
        }
    }

    /// The clean boundary a flush request carries in its data slot.
    pub fn last_clean_offset_ops(&self) -> i64 {
        self.flush_offset_data
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);

        enc.array(WIRE_FIELDS)?;
        enc.u8(self.op_type)?;
        enc.u64(self.client_id.as_u64())?;
        enc.u64(self.op_id)?;
        enc.i64(self.flush_offset_ops)?;
        enc.i64(self.flush_offset_data)?;
        encode_opt_bytes(&mut enc, self.expected_value.as_ref())?;
        encode_opt_bytes(&mut enc, self.updated_value.as_ref())?;
        encode_opt_bytes(&mut enc, self.merge_function.as_ref())?;

        Ok(Bytes::from(buf))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() > MAX_OP_MESSAGE_BYTES {
            return Err(CodecError::TooLarge {
                len: bytes.len(),
                max: MAX_OP_MESSAGE_BYTES,
            });
        }

        let mut dec = Decoder::new(bytes);
        let len = dec.array()?.ok_or(CodecError::IndefiniteLength)?;
        if len < WIRE_FIELDS {
            return Err(CodecError::ShortArray { fields: len });
        }

        let op_type = dec.u8()?;
        let client_id = ClientId::new(dec.u64()?);
        let op_id = dec.u64()?;
        let flush_offset_ops = dec.i64()?;
        let flush_offset_data = dec.i64()?;
        let expected_value = decode_opt_bytes(&mut dec)?;
        let updated_value = decode_opt_bytes(&mut dec)?;
        let merge_function = decode_opt_bytes(&mut dec)?;

        // Fields appended by newer writers.
        for _ in WIRE_FIELDS..len {
            dec.skip()?;
        }
        if dec.datatype().is_ok() {
            return Err(CodecError::TrailingBytes);
        }

        Ok(Self {
            op_type,
            client_id,
            op_id,
            flush_offset_ops,
            flush_offset_data,
            expected_value,
            updated_value,
            merge_function,
        })
    }
}

fn encode_opt_bytes(
    enc: &mut Encoder<&mut Vec<u8>>,
    value: Option<&Bytes>,
) -> Result<(), CodecError> {
    match value {
        Some(bytes) => enc.bytes(bytes)?,
        None => enc.null()?,
    };
    Ok(())
}

fn decode_opt_bytes(dec: &mut Decoder) -> Result<Option<Bytes>, CodecError> {
    match dec.datatype()? {
        Type::Null => {
            dec.null()?;
            Ok(None)
        }
        _ => Ok(Some(Bytes::copy_from_slice(dec.bytes()?))),
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("op message too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },
    #[error("indefinite-length op message not allowed")]
    IndefiniteLength,
    #[error("op message truncated: {fields} fields")]
    ShortArray { fields: u64 },
    #[error("trailing bytes after op message")]
    TrailingBytes,
    #[error("cbor encode: {0}")]
    Encode(#[from] minicbor::encode::Error<std::convert::Infallible>),
    #[error("cbor decode: {0}")]
    Decode(#[from] minicbor::decode::Error),
}
