//! The operation codec (component C2): framing, checksumming, and versioned
//! payload encode/decode for the three kinds of index-modifying operations
//! a tlog can carry.

use std::io::{self, Read};

use snafu::Snafu;

/// A legacy tag, predating the `NoOp` variant, that decodes as [`Operation::Index`].
const TAG_LEGACY_CREATE: u8 = 1;
const TAG_INDEX: u8 = 2;
const TAG_DELETE: u8 = 3;
const TAG_NO_OP: u8 = 4;

/// The only payload schema currently understood. Kept as a named constant,
/// rather than inlined, so a future `format_version = 2` has an obvious spot
/// to branch from in [`decode_payload`].
const CURRENT_FORMAT_VERSION: u64 = 1;

/// Minimum valid frame size (tag + checksum, with an empty payload is never
/// actually produced, but the floor matches spec §4.2).
pub const MIN_OPERATION_FRAME_LEN: usize = 8;

/// One index-modifying operation recorded in the tlog.
///
/// This is deliberately a plain sum type rather than a trait-object
/// hierarchy: the wire format already discriminates on a tag byte, so
/// encode/decode dispatch on the tag directly.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Index(IndexOperation),
    Delete(DeleteOperation),
    NoOp(NoOpOperation),
}

impl Operation {
    #[must_use]
    pub fn seq_no(&self) -> i64 {
        match self {
            Operation::Index(op) => op.seq_no,
            Operation::Delete(op) => op.seq_no,
            Operation::NoOp(op) => op.seq_no,
        }
    }

    #[must_use]
    pub fn primary_term(&self) -> i64 {
        match self {
            Operation::Index(op) => op.primary_term,
            Operation::Delete(op) => op.primary_term,
            Operation::NoOp(op) => op.primary_term,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexOperation {
    pub seq_no: i64,
    pub primary_term: i64,
    pub version: i64,
    pub id: String,
    pub doc_type: String,
    pub source: Vec<u8>,
    pub routing: Option<String>,
    pub parent: Option<String>,
    pub auto_generated_id_timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteOperation {
    pub seq_no: i64,
    pub primary_term: i64,
    pub version: i64,
    pub uid_field: String,
    pub uid_value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NoOpOperation {
    pub seq_no: i64,
    pub primary_term: i64,
    pub reason: String,
}

/// Error that occurred encoding or decoding an [`Operation`].
#[derive(Debug, Snafu)]
pub enum OperationCodecError {
    /// A general I/O error while reading from or writing to the underlying
    /// stream.
    #[snafu(display("operation codec I/O error: {source}"))]
    Io { source: io::Error },

    /// The frame's checksum did not match its contents, its size prefix was
    /// below the minimum valid size, or its tag/version was not recognized.
    #[snafu(display("operation corruption: {reason}"))]
    Corruption { reason: String },

    /// The stream ended partway through a frame. Distinct from
    /// [`OperationCodecError::Corruption`] so callers can stop cleanly at a
    /// truncated tail instead of treating it as a hard failure.
    #[snafu(display("operation truncated after {bytes_read} of {expected} expected bytes"))]
    Truncation { bytes_read: usize, expected: usize },
}

impl From<io::Error> for OperationCodecError {
    fn from(source: io::Error) -> Self {
        OperationCodecError::Io { source }
    }
}

/// Encodes `op`'s frame body: `type_tag || payload || crc32(type_tag || payload)`.
///
/// This does **not** include the 4-byte size prefix; the caller ([`Writer`](crate::writer::Writer))
/// wraps the returned bytes in that envelope, since the size prefix is
/// meaningful to the writer's buffering, not to the codec.
#[must_use]
pub fn encode_operation(op: &Operation) -> Vec<u8> {
    let mut body = Vec::with_capacity(128);
    let tag = match op {
        Operation::Index(_) => TAG_INDEX,
        Operation::Delete(_) => TAG_DELETE,
        Operation::NoOp(_) => TAG_NO_OP,
    };
    body.push(tag);
    write_varint(&mut body, CURRENT_FORMAT_VERSION);
    match op {
        Operation::Index(index) => encode_index(&mut body, index),
        Operation::Delete(delete) => encode_delete(&mut body, delete),
        Operation::NoOp(no_op) => encode_no_op(&mut body, no_op),
    }

    let checksum = crc32fast::hash(&body);
    body.extend_from_slice(&checksum.to_le_bytes());
    body
}

/// Decodes a single operation frame (everything after the 4-byte size
/// prefix, i.e. exactly `N` bytes) from `frame`.
///
/// # Errors
///
/// Returns [`OperationCodecError::Corruption`] if `frame` is shorter than
/// [`MIN_OPERATION_FRAME_LEN`], carries an unrecognized tag or
/// `format_version`, or fails its checksum.
pub fn decode_operation(frame: &[u8]) -> Result<Operation, OperationCodecError> {
    if frame.len() < MIN_OPERATION_FRAME_LEN {
        return Err(OperationCodecError::Corruption {
            reason: format!(
                "frame of {} bytes is below the minimum of {MIN_OPERATION_FRAME_LEN}",
                frame.len()
            ),
        });
    }

    let (digested, checksum_bytes) = frame.split_at(frame.len() - 4);
    let stored_checksum = u32::from_le_bytes(checksum_bytes.try_into().expect("4 bytes"));
    let calculated_checksum = crc32fast::hash(digested);
    if stored_checksum != calculated_checksum {
        return Err(OperationCodecError::Corruption {
            reason: format!(
                "checksum mismatch: calculated {calculated_checksum:#x}, stored {stored_checksum:#x}"
            ),
        });
    }

    let mut cursor = digested;
    let tag = take_byte(&mut cursor)?;
    let format_version = read_varint(&mut cursor)?;
    if format_version != CURRENT_FORMAT_VERSION {
        return Err(OperationCodecError::Corruption {
            reason: format!("unsupported format_version {format_version}"),
        });
    }

    match tag {
        TAG_LEGACY_CREATE | TAG_INDEX => decode_index(&mut cursor).map(Operation::Index),
        TAG_DELETE => decode_delete(&mut cursor).map(Operation::Delete),
        TAG_NO_OP => decode_no_op(&mut cursor).map(Operation::NoOp),
        other => Err(OperationCodecError::Corruption {
            reason: format!("unrecognized type tag {other}"),
        }),
    }
}

/// Reads the 4-byte size prefix, then the frame body, from `reader`.
///
/// On a clean end-of-stream before any bytes of the size prefix are read,
/// returns `Ok(None)` (the stream, and the generation, end here cleanly).
/// On a truncated size prefix or a size prefix describing more bytes than
/// remain, returns [`OperationCodecError::Truncation`].
pub fn read_framed(reader: &mut impl Read) -> Result<Option<Operation>, OperationCodecError> {
    let mut size_buf = [0u8; 4];
    let mut read_so_far = 0usize;
    loop {
        match reader.read(&mut size_buf[read_so_far..]) {
            Ok(0) => break,
            Ok(n) => read_so_far += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
        if read_so_far == 4 {
            break;
        }
    }
    if read_so_far == 0 {
        return Ok(None);
    }
    if read_so_far < 4 {
        return Err(OperationCodecError::Truncation {
            bytes_read: read_so_far,
            expected: 4,
        });
    }

    let frame_len = u32::from_le_bytes(size_buf) as usize;
    if frame_len < MIN_OPERATION_FRAME_LEN {
        return Err(OperationCodecError::Corruption {
            reason: format!(
                "frame size {frame_len} is below the minimum of {MIN_OPERATION_FRAME_LEN}"
            ),
        });
    }

    let mut frame = vec![0u8; frame_len];
    let mut read = 0usize;
    while read < frame_len {
        match reader.read(&mut frame[read..]) {
            Ok(0) => {
                return Err(OperationCodecError::Truncation {
                    bytes_read: read,
                    expected: frame_len,
                })
            }
            Ok(n) => read += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }

    decode_operation(&frame).map(Some)
}

fn take_byte(cursor: &mut &[u8]) -> Result<u8, OperationCodecError> {
    let (first, rest) = cursor
        .split_first()
        .ok_or_else(|| OperationCodecError::Corruption {
            reason: "frame ended before type tag".to_string(),
        })?;
    *cursor = rest;
    Ok(*first)
}

fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_varint(cursor: &mut &[u8]) -> Result<u64, OperationCodecError> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = take_byte(cursor)?;
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 64 {
            return Err(OperationCodecError::Corruption {
                reason: "varint too long".to_string(),
            });
        }
    }
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn read_bytes(cursor: &mut &[u8]) -> Result<Vec<u8>, OperationCodecError> {
    let len = read_varint(cursor)? as usize;
    if cursor.len() < len {
        return Err(OperationCodecError::Corruption {
            reason: "byte string runs past end of payload".to_string(),
        });
    }
    let (value, rest) = cursor.split_at(len);
    *cursor = rest;
    Ok(value.to_vec())
}

fn write_string(buf: &mut Vec<u8>, value: &str) {
    write_bytes(buf, value.as_bytes());
}

fn read_string(cursor: &mut &[u8]) -> Result<String, OperationCodecError> {
    let bytes = read_bytes(cursor)?;
    String::from_utf8(bytes).map_err(|_| OperationCodecError::Corruption {
        reason: "string field was not valid UTF-8".to_string(),
    })
}

fn write_optional_string(buf: &mut Vec<u8>, value: &Option<String>) {
    match value {
        Some(s) => {
            buf.push(1);
            write_string(buf, s);
        }
        None => buf.push(0),
    }
}

fn read_optional_string(cursor: &mut &[u8]) -> Result<Option<String>, OperationCodecError> {
    match take_byte(cursor)? {
        0 => Ok(None),
        1 => read_string(cursor).map(Some),
        other => Err(OperationCodecError::Corruption {
            reason: format!("invalid presence flag {other} for optional string"),
        }),
    }
}

fn encode_index(buf: &mut Vec<u8>, op: &IndexOperation) {
    buf.extend_from_slice(&op.seq_no.to_le_bytes());
    buf.extend_from_slice(&op.primary_term.to_le_bytes());
    buf.extend_from_slice(&op.version.to_le_bytes());
    write_string(buf, &op.id);
    write_string(buf, &op.doc_type);
    write_bytes(buf, &op.source);
    write_optional_string(buf, &op.routing);
    write_optional_string(buf, &op.parent);
    buf.extend_from_slice(&op.auto_generated_id_timestamp.to_le_bytes());
}

fn decode_index(cursor: &mut &[u8]) -> Result<IndexOperation, OperationCodecError> {
    Ok(IndexOperation {
        seq_no: read_i64(cursor)?,
        primary_term: read_i64(cursor)?,
        version: read_i64(cursor)?,
        id: read_string(cursor)?,
        doc_type: read_string(cursor)?,
        source: read_bytes(cursor)?,
        routing: read_optional_string(cursor)?,
        parent: read_optional_string(cursor)?,
        auto_generated_id_timestamp: read_i64(cursor)?,
    })
}

fn encode_delete(buf: &mut Vec<u8>, op: &DeleteOperation) {
    buf.extend_from_slice(&op.seq_no.to_le_bytes());
    buf.extend_from_slice(&op.primary_term.to_le_bytes());
    buf.extend_from_slice(&op.version.to_le_bytes());
    write_string(buf, &op.uid_field);
    write_string(buf, &op.uid_value);
}

fn decode_delete(cursor: &mut &[u8]) -> Result<DeleteOperation, OperationCodecError> {
    Ok(DeleteOperation {
        seq_no: read_i64(cursor)?,
        primary_term: read_i64(cursor)?,
        version: read_i64(cursor)?,
        uid_field: read_string(cursor)?,
        uid_value: read_string(cursor)?,
    })
}

fn encode_no_op(buf: &mut Vec<u8>, op: &NoOpOperation) {
    buf.extend_from_slice(&op.seq_no.to_le_bytes());
    buf.extend_from_slice(&op.primary_term.to_le_bytes());
    write_string(buf, &op.reason);
}

fn decode_no_op(cursor: &mut &[u8]) -> Result<NoOpOperation, OperationCodecError> {
    Ok(NoOpOperation {
        seq_no: read_i64(cursor)?,
        primary_term: read_i64(cursor)?,
        reason: read_string(cursor)?,
    })
}

fn read_i64(cursor: &mut &[u8]) -> Result<i64, OperationCodecError> {
    if cursor.len() < 8 {
        return Err(OperationCodecError::Corruption {
            reason: "payload ended before an 8-byte integer field".to_string(),
        });
    }
    let (value, rest) = cursor.split_at(8);
    *cursor = rest;
    Ok(i64::from_le_bytes(value.try_into().expect("8 bytes")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_index() -> Operation {
        Operation::Index(IndexOperation {
            seq_no: 1,
            primary_term: 1,
            version: 1,
            id: "a".to_string(),
            doc_type: "t".to_string(),
            source: vec![0x01],
            routing: None,
            parent: None,
            auto_generated_id_timestamp: -1,
        })
    }

    fn sample_delete() -> Operation {
        Operation::Delete(DeleteOperation {
            seq_no: 2,
            primary_term: 1,
            version: 2,
            uid_field: "_uid".to_string(),
            uid_value: "t#b".to_string(),
        })
    }

    fn sample_no_op() -> Operation {
        Operation::NoOp(NoOpOperation {
            seq_no: 3,
            primary_term: 1,
            reason: "skip".to_string(),
        })
    }

    #[test]
    fn round_trips_all_variants() {
        for op in [sample_index(), sample_delete(), sample_no_op()] {
            let body = encode_operation(&op);
            let decoded = decode_operation(&body).unwrap();
            assert_eq!(op, decoded);
        }
    }

    #[test]
    fn frame_len_matches_body_len() {
        let body = encode_operation(&sample_index());
        assert!(body.len() >= MIN_OPERATION_FRAME_LEN);
    }

    #[test]
    fn read_framed_round_trips_through_a_stream() {
        let mut stream = Vec::new();
        for op in [sample_index(), sample_delete(), sample_no_op()] {
            let body = encode_operation(&op);
            stream.extend_from_slice(&(body.len() as u32).to_le_bytes());
            stream.extend_from_slice(&body);
        }

        let mut cursor = io::Cursor::new(stream);
        let mut decoded = Vec::new();
        while let Some(op) = read_framed(&mut cursor).unwrap() {
            decoded.push(op);
        }
        assert_eq!(decoded, vec![sample_index(), sample_delete(), sample_no_op()]);
    }

    #[test]
    fn truncated_tail_is_truncation_not_corruption() {
        let body = encode_operation(&sample_index());
        let mut stream = Vec::new();
        stream.extend_from_slice(&(body.len() as u32).to_le_bytes());
        stream.extend_from_slice(&body);
        stream.truncate(stream.len() - 3);

        let mut cursor = io::Cursor::new(stream);
        let err = read_framed(&mut cursor).unwrap_err();
        assert!(matches!(err, OperationCodecError::Truncation { .. }));
    }

    #[test]
    fn clean_eof_between_records_is_not_an_error() {
        let mut cursor = io::Cursor::new(Vec::<u8>::new());
        assert!(read_framed(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn single_byte_mutation_in_payload_is_detected() {
        let mut body = encode_operation(&sample_index());
        let mutate_at = body.len() / 2;
        body[mutate_at] ^= 0xFF;
        let err = decode_operation(&body).unwrap_err();
        assert!(matches!(err, OperationCodecError::Corruption { .. }));
    }

    #[test]
    fn single_byte_mutation_in_checksum_is_detected() {
        let mut body = encode_operation(&sample_index());
        let last = body.len() - 1;
        body[last] ^= 0xFF;
        let err = decode_operation(&body).unwrap_err();
        assert!(matches!(err, OperationCodecError::Corruption { .. }));
    }

    #[test]
    fn legacy_create_tag_decodes_as_index() {
        let mut body = encode_operation(&sample_index());
        body[0] = TAG_LEGACY_CREATE;
        // Recompute the checksum since we just altered the digested region.
        let len = body.len();
        let checksum = crc32fast::hash(&body[..len - 4]);
        body[len - 4..].copy_from_slice(&checksum.to_le_bytes());

        let decoded = decode_operation(&body).unwrap();
        assert!(matches!(decoded, Operation::Index(_)));
    }

    proptest! {
        #[test]
        fn varint_round_trips(value in any::<u64>()) {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let mut cursor: &[u8] = &buf;
            let decoded = read_varint(&mut cursor).unwrap();
            prop_assert_eq!(decoded, value);
            prop_assert!(cursor.is_empty());
        }

        #[test]
        fn index_operation_round_trips(
            seq_no in any::<i64>(),
            version in any::<i64>(),
            id in "[a-zA-Z0-9]{0,16}",
            source in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let op = Operation::Index(IndexOperation {
                seq_no,
                primary_term: 1,
                version,
                id,
                doc_type: "t".to_string(),
                source,
                routing: None,
                parent: None,
                auto_generated_id_timestamp: -1,
            });
            let body = encode_operation(&op);
            let decoded = decode_operation(&body).unwrap();
            prop_assert_eq!(op, decoded);
        }
    }
}
