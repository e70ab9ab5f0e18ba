//! The fixed header written at the start of every `.tlog` file (spec §6):
//! a codec version, the tlog's [`TlogUuid`], and a CRC32 over both, so that a
//! reader can detect a directory that belongs to a different engine commit
//! before it trusts any operation records in the file.

use std::io::{self, Read, Write};

use snafu::{ResultExt, Snafu};

use crate::TlogUuid;

const MAGIC: u32 = 0x544C_4F47; // "TLOG"
const CODEC_VERSION: u16 = 1;

/// On-disk length of the header, in bytes: `magic(4) + codec_version(2) + uuid(16) + crc32(4)`.
pub const HEADER_LEN: u64 = 4 + 2 + 16 + 4;

/// Error verifying or reading a `.tlog` file header.
///
/// Every variant here is the single **Corruption** kind: bad magic, a short
/// read, a failed CRC, and a UUID mismatch are all fatal and all escalated
/// the same way by a caller — a directory whose header doesn't check out is
/// never partially trusted.
#[derive(Debug, Snafu)]
pub enum HeaderError {
    #[snafu(display("header I/O error: {source}"))]
    Io { source: io::Error },

    /// Bad magic, a short read, a failed CRC, or a UUID naming a different
    /// tlog instance than the caller expects.
    #[snafu(display("header corruption: {reason}"))]
    Corruption { reason: String },
}

impl From<io::Error> for HeaderError {
    fn from(source: io::Error) -> Self {
        HeaderError::Io { source }
    }
}

/// Encodes the header for a brand-new generation file.
#[must_use]
pub fn encode(uuid: TlogUuid) -> [u8; HEADER_LEN as usize] {
    let mut buf = [0u8; HEADER_LEN as usize];
    buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    buf[4..6].copy_from_slice(&CODEC_VERSION.to_le_bytes());
    buf[6..22].copy_from_slice(&uuid.as_bytes());
    let crc = crc32fast::hash(&buf[0..22]);
    buf[22..26].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Writes a freshly-[`encode`]d header to `writer`.
pub fn write(writer: &mut impl Write, uuid: TlogUuid) -> Result<(), HeaderError> {
    writer.write_all(&encode(uuid)).context(IoSnafu)
}

/// Reads and verifies a header from `reader`, checking it against
/// `expected_uuid`.
///
/// # Errors
///
/// Returns [`HeaderError::Corruption`] on a short read, bad magic, a failed
/// CRC, or a header that is well-formed but names a different tlog instance
/// than `expected_uuid`.
pub fn read_and_verify(reader: &mut impl Read, expected_uuid: TlogUuid) -> Result<(), HeaderError> {
    let mut buf = [0u8; HEADER_LEN as usize];
    reader.read_exact(&mut buf).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            HeaderError::Corruption {
                reason: "file is shorter than the header".to_string(),
            }
        } else {
            HeaderError::Io { source: err }
        }
    })?;

    let magic = u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes"));
    if magic != MAGIC {
        return Err(HeaderError::Corruption {
            reason: format!("bad magic {magic:#x}"),
        });
    }

    let calculated = crc32fast::hash(&buf[0..22]);
    let stored = u32::from_le_bytes(buf[22..26].try_into().expect("4 bytes"));
    if calculated != stored {
        return Err(HeaderError::Corruption {
            reason: "header checksum mismatch".to_string(),
        });
    }

    let codec_version = u16::from_le_bytes(buf[4..6].try_into().expect("2 bytes"));
    if codec_version != CODEC_VERSION {
        return Err(HeaderError::Corruption {
            reason: format!("unsupported header codec version {codec_version}"),
        });
    }

    let found_uuid = TlogUuid::from_bytes(buf[6..22].try_into().expect("16 bytes"));
    if found_uuid != expected_uuid {
        return Err(HeaderError::Corruption {
            reason: format!("tlog UUID mismatch: file carries {found_uuid}, expected {expected_uuid}"),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_matching_uuid() {
        let uuid = TlogUuid::new_random();
        let mut buf = Vec::new();
        write(&mut buf, uuid).unwrap();
        let mut cursor = io::Cursor::new(buf);
        read_and_verify(&mut cursor, uuid).unwrap();
    }

    #[test]
    fn mismatched_uuid_is_corruption() {
        let uuid = TlogUuid::new_random();
        let other = TlogUuid::new_random();
        let mut buf = Vec::new();
        write(&mut buf, uuid).unwrap();
        let mut cursor = io::Cursor::new(buf);
        let err = read_and_verify(&mut cursor, other).unwrap_err();
        assert!(matches!(err, HeaderError::Corruption { .. }));
    }

    #[test]
    fn corrupted_header_is_detected() {
        let uuid = TlogUuid::new_random();
        let mut buf = encode(uuid).to_vec();
        buf[10] ^= 0xFF;
        let mut cursor = io::Cursor::new(buf);
        let err = read_and_verify(&mut cursor, uuid).unwrap_err();
        assert!(matches!(err, HeaderError::Corruption { .. }));
    }

    #[test]
    fn short_file_is_corruption() {
        let mut cursor = io::Cursor::new(vec![0u8; 5]);
        let err = read_and_verify(&mut cursor, TlogUuid::new_random()).unwrap_err();
        assert!(matches!(err, HeaderError::Corruption { .. }));
    }
}
