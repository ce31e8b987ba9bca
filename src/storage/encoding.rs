//! Encoder/decoder for persisted structures
//!
//! A single pair of entry points handles every on-disk artifact: row-log
//! segments, column files, info files and cached partial results. The
//! payload is bincode; paths ending in `.gz` are gzip-compressed on
//! write, and gzip is detected on read regardless of extension.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{CaskError, Result};

pub const GZIP_EXT: &str = ".gz";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

fn is_gzip_path(path: &Path) -> bool {
    path.to_string_lossy().ends_with(GZIP_EXT)
}

fn ser_err<E: std::fmt::Display>(e: E) -> CaskError {
    CaskError::SerializationError(e.to_string())
}

/// Serialize `value` to `path`, gzipping when the path carries `.gz`.
pub fn encode<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    if is_gzip_path(path) {
        let mut gz = GzEncoder::new(writer, Compression::default());
        bincode::serialize_into(&mut gz, value).map_err(ser_err)?;
        gz.finish()?;
        Ok(())
    } else {
        bincode::serialize_into(writer, value).map_err(ser_err)
    }
}

/// Serialize through a temp file and rename into place, so readers never
/// observe a partial write.
pub fn encode_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    encode(&tmp, value)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Deserialize a value from `path`, detecting gzip by magic bytes.
pub fn decode<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let gzipped = match file.read(&mut magic) {
        Ok(2) => magic == GZIP_MAGIC,
        _ => false,
    };
    file.seek(SeekFrom::Start(0))?;

    let reader = BufReader::new(file);
    if gzipped {
        bincode::deserialize_from(GzDecoder::new(reader)).map_err(ser_err)
    } else {
        bincode::deserialize_from(reader).map_err(ser_err)
    }
}

/// Serialize to an arbitrary writer in the on-disk format (used by flag
/// encoding to stdout).
pub fn encode_to_writer<T: Serialize, W: Write>(writer: W, value: &T) -> Result<()> {
    bincode::serialize_into(writer, value).map_err(ser_err)
}

/// Deserialize from an arbitrary reader (used by flag decoding from
/// stdin).
pub fn decode_from_reader<T: DeserializeOwned, R: Read>(reader: R) -> Result<T> {
    bincode::deserialize_from(reader).map_err(ser_err)
}

/// Resolve a column file that may exist either plain or gzipped.
pub fn find_variant(path: &Path) -> Option<PathBuf> {
    if path.exists() {
        return Some(path.to_path_buf());
    }
    let mut gz = path.as_os_str().to_owned();
    gz.push(GZIP_EXT);
    let gz = PathBuf::from(gz);
    if gz.exists() {
        Some(gz)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        name: String,
        values: Vec<i64>,
    }

    fn sample() -> Payload {
        Payload {
            name: "events".to_string(),
            values: vec![1, -5, 1 << 60],
        }
    }

    #[test]
    fn test_roundtrip_plain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("info.db");

        encode(&path, &sample()).unwrap();
        let back: Payload = decode(&path).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn test_roundtrip_gzip_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("info.db.gz");

        encode(&path, &sample()).unwrap();

        // Gzip is detected by magic, not extension.
        let renamed = dir.path().join("renamed.db");
        fs::rename(&path, &renamed).unwrap();
        let back: Payload = decode(&renamed).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn test_atomic_encode_leaves_no_tmp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("info.db");

        encode_atomic(&path, &sample()).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_find_variant() {
        let dir = tempdir().unwrap();
        let gz = dir.path().join("int_age.db.gz");
        encode(&gz, &sample()).unwrap();

        let found = find_variant(&dir.path().join("int_age.db")).unwrap();
        assert_eq!(found, gz);
        assert!(find_variant(&dir.path().join("int_missing.db")).is_none());
    }

    #[test]
    fn test_decode_garbage_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.db");
        fs::write(&path, b"not a database").unwrap();
        let r: Result<Payload> = decode(&path);
        assert!(r.is_err());
    }
}
