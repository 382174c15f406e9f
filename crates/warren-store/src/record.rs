//! Record framing: `length (u32 LE) || checksum (8 bytes) || payload`.
//!
//! The checksum is the first 8 bytes of the payload's blake3 hash. Framing
//! errors split two ways on read:
//! - a record cut off by EOF is a torn tail from a crash mid-append; the
//!   reader reports how many clean bytes preceded it so the caller can
//!   truncate and carry on
//! - a checksum mismatch on a complete record is corruption and fatal

use std::io::Write;
use std::path::Path;

use crate::StoreError;

const HEADER_LEN: usize = 4 + 8;

/// Sanity cap on a single record; anything larger is treated as corruption.
const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

fn checksum(payload: &[u8]) -> [u8; 8] {
    let hash = blake3::hash(payload);
    let mut out = [0u8; 8];
    out.copy_from_slice(&hash.as_bytes()[..8]);
    out
}

/// Appends one framed record.
pub fn write_record(w: &mut impl Write, payload: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "record too large"))?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&checksum(payload))?;
    w.write_all(payload)?;
    Ok(())
}

/// Result of scanning a byte buffer for records.
pub(crate) struct Scan {
    pub records: Vec<Vec<u8>>,
    /// Bytes of clean records; anything beyond is a torn tail.
    pub clean_len: u64,
    pub torn_tail: bool,
}

/// Scans `bytes`, stopping at a torn tail. Checksum mismatches on complete
/// records are fatal corruption.
pub(crate) fn scan_records(bytes: &[u8], path: &Path) -> Result<Scan, StoreError> {
    let mut records = Vec::new();
    let mut pos = 0usize;

    loop {
        let remaining = bytes.len() - pos;
        if remaining == 0 {
            return Ok(Scan {
                records,
                clean_len: pos as u64,
                torn_tail: false,
            });
        }
        if remaining < HEADER_LEN {
            return Ok(Scan {
                records,
                clean_len: pos as u64,
                torn_tail: true,
            });
        }

        let len = u32::from_le_bytes(bytes[pos..pos + 4].try_into().expect("4 bytes"));
        if len > MAX_RECORD_LEN {
            return Err(StoreError::Corrupt {
                path: path.display().to_string(),
                offset: pos as u64,
            });
        }
        let total = HEADER_LEN + len as usize;
        if remaining < total {
            return Ok(Scan {
                records,
                clean_len: pos as u64,
                torn_tail: true,
            });
        }

        let expected: [u8; 8] = bytes[pos + 4..pos + 12].try_into().expect("8 bytes");
        let payload = &bytes[pos + HEADER_LEN..pos + total];
        if checksum(payload) != expected {
            return Err(StoreError::Corrupt {
                path: path.display().to_string(),
                offset: pos as u64,
            });
        }

        records.push(payload.to_vec());
        pos += total;
    }
}

/// Reads every record in `bytes`, rejecting torn tails too. Used for
/// self-contained files (state files, snapshots) where a partial write
/// must never be accepted.
pub fn read_all_records(bytes: &[u8], path: &Path) -> Result<Vec<Vec<u8>>, StoreError> {
    let scan = scan_records(bytes, path)?;
    if scan.torn_tail {
        return Err(StoreError::Corrupt {
            path: path.display().to_string(),
            offset: scan.clean_len,
        });
    }
    Ok(scan.records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame(payloads: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::new();
        for p in payloads {
            write_record(&mut buf, p).unwrap();
        }
        buf
    }

    #[test]
    fn round_trip() {
        let buf = frame(&[b"one", b"two", b""]);
        let records = read_all_records(&buf, Path::new("test")).unwrap();
        assert_eq!(records, vec![b"one".to_vec(), b"two".to_vec(), Vec::new()]);
    }

    #[test]
    fn torn_tail_is_detected_not_fatal() {
        let mut buf = frame(&[b"one", b"two"]);
        let clean = frame(&[b"one"]).len() as u64;
        buf.truncate(buf.len() - 1);

        let scan = scan_records(&buf, Path::new("test")).unwrap();
        assert!(scan.torn_tail);
        assert_eq!(scan.clean_len, clean);
        assert_eq!(scan.records, vec![b"one".to_vec()]);
    }

    #[test]
    fn bitrot_is_fatal() {
        let mut buf = frame(&[b"one", b"two"]);
        // Flip a bit inside the first payload.
        let idx = HEADER_LEN;
        buf[idx] ^= 0x40;
        assert!(matches!(
            scan_records(&buf, Path::new("test")),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn absurd_length_is_fatal() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        buf.extend_from_slice(&[0; 8]);
        assert!(matches!(
            scan_records(&buf, Path::new("test")),
            Err(StoreError::Corrupt { .. })
        ));
    }

    proptest! {
        #[test]
        fn any_payloads_round_trip(payloads in prop::collection::vec(
            prop::collection::vec(any::<u8>(), 0..256), 0..16,
        )) {
            let refs: Vec<&[u8]> = payloads.iter().map(Vec::as_slice).collect();
            let buf = frame(&refs);
            let records = read_all_records(&buf, Path::new("prop")).unwrap();
            prop_assert_eq!(records, payloads);
        }

        #[test]
        fn truncation_never_yields_phantom_records(
            payloads in prop::collection::vec(
                prop::collection::vec(any::<u8>(), 1..64), 1..8,
            ),
            cut in 0usize..64,
        ) {
            let refs: Vec<&[u8]> = payloads.iter().map(Vec::as_slice).collect();
            let mut buf = frame(&refs);
            let cut = cut.min(buf.len().saturating_sub(1));
            buf.truncate(buf.len() - cut - 1);

            // Either a clean prefix of the originals, or fatal corruption —
            // never extra or reordered records.
            if let Ok(scan) = scan_records(&buf, Path::new("prop")) {
                prop_assert!(scan.records.len() <= payloads.len());
                for (got, want) in scan.records.iter().zip(&payloads) {
                    prop_assert_eq!(got, want);
                }
            }
        }
    }
}
