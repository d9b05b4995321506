//! Point-in-time keyspace snapshots
//!
//! A snapshot is a single checksummed frame holding the lz4-compressed,
//! bincode-encoded live keyspace. Snapshots are best-effort: anything
//! written after the last snapshot is lost on restart.

use super::memory::StoredValue;
use super::Store;
use crate::{Result, TemporaError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use tracing::{info, warn};

/// Frame layout version
const FORMAT_VERSION: u8 = 1;

/// One key of an exported keyspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: String,
    pub value: StoredValue,
    /// Absolute expiry in unix seconds
    pub expire_at: Option<i64>,
}

/// Decoded snapshot contents
#[derive(Debug, Clone)]
pub struct SnapshotFrame {
    /// Unix seconds at which the snapshot was taken
    pub created_at: i64,
    pub entries: Vec<SnapshotEntry>,
}

impl SnapshotFrame {
    /// Serialize with length prefix and CRC checksum
    ///
    /// Format:
    /// - 4 bytes: frame length (excluding this field)
    /// - 1 byte: format version
    /// - 8 bytes: creation time
    /// - 4 bytes: entry count
    /// - 4 bytes: payload length
    /// - N bytes: lz4-compressed bincode payload
    /// - 4 bytes: CRC32 checksum
    pub fn encode(&self) -> Result<Bytes> {
        let encoded = bincode::serialize(&self.entries)
            .map_err(|e| TemporaError::Internal(format!("snapshot encode: {}", e)))?;
        let payload = lz4_flex::compress_prepend_size(&encoded);

        let mut buf = BytesMut::with_capacity(payload.len() + 25);
        buf.put_u32_le(0);
        buf.put_u8(FORMAT_VERSION);
        buf.put_i64_le(self.created_at);
        buf.put_u32_le(self.entries.len() as u32);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(&payload);

        let checksum = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(checksum);

        let len = (buf.len() - 4) as u32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());

        Ok(buf.freeze())
    }

    /// Decode a frame, validating length and checksum
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(TemporaError::Corruption("snapshot too short".into()));
        }
        let len = (&data[..4]).get_u32_le() as usize;
        if len < 21 || data.len() < 4 + len {
            return Err(TemporaError::Corruption("incomplete snapshot".into()));
        }

        let frame = &data[4..4 + len];
        let (body, mut trailer) = frame.split_at(frame.len() - 4);
        let expected = trailer.get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(TemporaError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let version = cursor.get_u8();
        if version != FORMAT_VERSION {
            return Err(TemporaError::Corruption(format!(
                "unsupported snapshot version {}",
                version
            )));
        }
        let created_at = cursor.get_i64_le();
        let count = cursor.get_u32_le() as usize;
        let payload_len = cursor.get_u32_le() as usize;
        if cursor.remaining() != payload_len {
            return Err(TemporaError::Corruption("snapshot payload length mismatch".into()));
        }

        let decompressed = lz4_flex::decompress_size_prepended(cursor)
            .map_err(|e| TemporaError::Corruption(format!("snapshot decompress: {}", e)))?;
        let entries: Vec<SnapshotEntry> = bincode::deserialize(&decompressed)
            .map_err(|e| TemporaError::Corruption(format!("snapshot decode: {}", e)))?;
        if entries.len() != count {
            return Err(TemporaError::Corruption(format!(
                "snapshot holds {} entries, header says {}",
                entries.len(),
                count
            )));
        }

        Ok(Self {
            created_at,
            entries,
        })
    }
}

/// Write the live keyspace to `path` via a temporary file and rename
pub fn write_snapshot(path: &Path, store: &dyn Store, now: i64) -> Result<usize> {
    let frame = SnapshotFrame {
        created_at: now,
        entries: store.export(),
    };
    let count = frame.entries.len();
    let bytes = frame.encode()?;

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }

    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    Ok(count)
}

/// Read a snapshot; `None` when no snapshot exists yet
pub fn load_snapshot(path: &Path) -> Result<Option<SnapshotFrame>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    SnapshotFrame::decode(&data).map(Some)
}

/// Load `path` into `store`; a corrupt snapshot is logged and skipped
pub fn restore_snapshot(path: &Path, store: &dyn Store) -> Result<usize> {
    match load_snapshot(path) {
        Ok(Some(frame)) => {
            let count = frame.entries.len();
            store.import(frame.entries);
            info!(path = %path.display(), keys = count, created_at = frame.created_at, "Restored snapshot");
            Ok(count)
        }
        Ok(None) => Ok(0),
        Err(e) if e.is_corruption() => {
            warn!(path = %path.display(), error = %e, "Ignoring corrupt snapshot, starting empty");
            Ok(0)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Clock, Command, ManualClock, MemoryStore};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn populated(clock: Arc<ManualClock>) -> MemoryStore {
        let store = MemoryStore::new(clock);
        store
            .execute(vec![
                Command::ZIncrBy {
                    key: "t-1-{metric-foo}-1485004709-2".into(),
                    member: "1485004876".into(),
                    delta: 3.14159,
                },
                Command::ExpireAt {
                    key: "t-1-{metric-foo}-1485004709-2".into(),
                    at: 1485005551,
                },
                Command::Append {
                    key: "raw".into(),
                    value: vec![1, 2, 3],
                },
            ])
            .unwrap();
        store
    }

    #[test]
    fn test_snapshot_restore() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("tempora.snap");
        let clock = Arc::new(ManualClock::new(1485004710));

        let written = write_snapshot(&path, &populated(clock.clone()), clock.now()).unwrap();
        assert_eq!(written, 2);

        let restored = MemoryStore::new(clock.clone());
        assert_eq!(restore_snapshot(&path, &restored).unwrap(), 2);
        assert_eq!(restored.get("raw").unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(
            restored.zrange_with_scores("t-1-{metric-foo}-1485004709-2").unwrap(),
            vec![("1485004876".to_string(), 3.14159)]
        );

        // expiry survives the round trip
        clock.set(1485005551);
        assert!(restored
            .zrange_with_scores("t-1-{metric-foo}-1485004709-2")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_missing_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("none.snap");
        assert!(load_snapshot(&path).unwrap().is_none());

        let store = MemoryStore::new(Arc::new(ManualClock::new(0)));
        assert_eq!(restore_snapshot(&path, &store).unwrap(), 0);
    }

    #[test]
    fn test_corrupt_snapshot_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tempora.snap");
        let clock = Arc::new(ManualClock::new(0));
        write_snapshot(&path, &populated(clock.clone()), 0).unwrap();

        let mut data = fs::read(&path).unwrap();
        data[12] ^= 0xff;
        fs::write(&path, &data).unwrap();

        assert!(matches!(
            load_snapshot(&path),
            Err(TemporaError::ChecksumMismatch { .. })
        ));

        let store = MemoryStore::new(clock);
        assert_eq!(restore_snapshot(&path, &store).unwrap(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_truncated_snapshot() {
        let frame = SnapshotFrame {
            created_at: 1,
            entries: Vec::new(),
        };
        let bytes = frame.encode().unwrap();
        assert!(SnapshotFrame::decode(&bytes).unwrap().entries.is_empty());
        assert!(matches!(
            SnapshotFrame::decode(&bytes[..bytes.len() - 1]),
            Err(TemporaError::Corruption(_))
        ));
    }
}
