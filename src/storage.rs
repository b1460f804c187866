use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::stats::{ClassStats, StatsDocument};
use crate::{new_file_id, now_s};

/// Metadata of an uploaded video.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StoredVideo {
    pub file_id: String,
    pub filename: String,
    pub bytes: u64,
    pub sha256: String,
    pub created_at: u64,
}

/// Upload blob storage keyed by generated file id.
pub trait BlobStore {
    fn put_video(&mut self, filename: &str, data: &[u8]) -> Result<StoredVideo>;

    fn video_meta(&mut self, file_id: &str) -> Result<Option<StoredVideo>>;

    fn get_video(&mut self, file_id: &str) -> Result<Option<(StoredVideo, Vec<u8>)>>;
}

/// Stats documents keyed by file id.
///
/// `upsert_stats` replaces the stored counters and alert list wholesale;
/// it never merges with what was there before.
pub trait StatsStore {
    fn upsert_stats(&mut self, doc: &StatsDocument) -> Result<()>;

    fn get_stats(&mut self, file_id: &str) -> Result<Option<StatsDocument>>;
}

/// Everything the HTTP surface needs from persistence.
pub trait VideoStore: BlobStore + StatsStore + Send {}

impl<T: BlobStore + StatsStore + Send> VideoStore for T {}

fn describe_upload(filename: &str, data: &[u8]) -> Result<StoredVideo> {
    Ok(StoredVideo {
        file_id: new_file_id(),
        filename: filename.to_string(),
        bytes: data.len() as u64,
        sha256: hex::encode(Sha256::digest(data)),
        created_at: now_s()?,
    })
}

pub struct SqliteVideoStore {
    conn: Connection,
}

impl SqliteVideoStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database {}", db_path))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS videos (
              file_id TEXT PRIMARY KEY,
              filename TEXT NOT NULL,
              bytes INTEGER NOT NULL,
              sha256 TEXT NOT NULL,
              created_at INTEGER NOT NULL,
              data BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS video_stats (
              file_id TEXT PRIMARY KEY,
              stats_json TEXT NOT NULL,
              error_times_json TEXT NOT NULL,
              frames_processed INTEGER NOT NULL,
              updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

fn to_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("{} exceeds i64 range", what))
}

impl BlobStore for SqliteVideoStore {
    fn put_video(&mut self, filename: &str, data: &[u8]) -> Result<StoredVideo> {
        let meta = describe_upload(filename, data)?;
        self.conn.execute(
            r#"
            INSERT INTO videos(file_id, filename, bytes, sha256, created_at, data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                meta.file_id,
                meta.filename,
                to_i64(meta.bytes, "upload size")?,
                meta.sha256,
                to_i64(meta.created_at, "created_at")?,
                data
            ],
        )?;
        Ok(meta)
    }

    fn video_meta(&mut self, file_id: &str) -> Result<Option<StoredVideo>> {
        let meta = self
            .conn
            .query_row(
                "SELECT filename, bytes, sha256, created_at FROM videos WHERE file_id = ?1",
                params![file_id],
                |row| {
                    Ok(StoredVideo {
                        file_id: file_id.to_string(),
                        filename: row.get(0)?,
                        bytes: row.get::<_, i64>(1)? as u64,
                        sha256: row.get(2)?,
                        created_at: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(meta)
    }

    fn get_video(&mut self, file_id: &str) -> Result<Option<(StoredVideo, Vec<u8>)>> {
        let Some(meta) = self.video_meta(file_id)? else {
            return Ok(None);
        };
        let data: Vec<u8> = self.conn.query_row(
            "SELECT data FROM videos WHERE file_id = ?1",
            params![file_id],
            |row| row.get(0),
        )?;
        Ok(Some((meta, data)))
    }
}

impl StatsStore for SqliteVideoStore {
    fn upsert_stats(&mut self, doc: &StatsDocument) -> Result<()> {
        let stats_json = serde_json::to_string(&doc.stats)?;
        let error_times_json = serde_json::to_string(&doc.error_times)?;
        self.conn.execute(
            r#"
            INSERT INTO video_stats(file_id, stats_json, error_times_json, frames_processed, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(file_id) DO UPDATE SET
              stats_json = excluded.stats_json,
              error_times_json = excluded.error_times_json,
              frames_processed = excluded.frames_processed,
              updated_at = excluded.updated_at
            "#,
            params![
                doc.file_id,
                stats_json,
                error_times_json,
                to_i64(doc.frames_processed, "frames_processed")?,
                to_i64(doc.updated_at, "updated_at")?
            ],
        )?;
        Ok(())
    }

    fn get_stats(&mut self, file_id: &str) -> Result<Option<StatsDocument>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT stats_json, error_times_json, frames_processed, updated_at
                FROM video_stats WHERE file_id = ?1
                "#,
                params![file_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((stats_json, error_times_json, frames_processed, updated_at)) = row else {
            return Ok(None);
        };
        let stats: ClassStats = serde_json::from_str(&stats_json)
            .with_context(|| format!("corrupt stats for {}", file_id))?;
        let error_times = serde_json::from_str(&error_times_json)
            .with_context(|| format!("corrupt error times for {}", file_id))?;
        Ok(Some(StatsDocument {
            file_id: file_id.to_string(),
            stats,
            error_times,
            frames_processed: frames_processed as u64,
            updated_at: updated_at as u64,
        }))
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryVideoStore {
    videos: HashMap<String, (StoredVideo, Vec<u8>)>,
    stats: HashMap<String, StatsDocument>,
}

impl InMemoryVideoStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for InMemoryVideoStore {
    fn put_video(&mut self, filename: &str, data: &[u8]) -> Result<StoredVideo> {
        let meta = describe_upload(filename, data)?;
        self.videos
            .insert(meta.file_id.clone(), (meta.clone(), data.to_vec()));
        Ok(meta)
    }

    fn video_meta(&mut self, file_id: &str) -> Result<Option<StoredVideo>> {
        Ok(self.videos.get(file_id).map(|(meta, _)| meta.clone()))
    }

    fn get_video(&mut self, file_id: &str) -> Result<Option<(StoredVideo, Vec<u8>)>> {
        Ok(self.videos.get(file_id).cloned())
    }
}

impl StatsStore for InMemoryVideoStore {
    fn upsert_stats(&mut self, doc: &StatsDocument) -> Result<()> {
        self.stats.insert(doc.file_id.clone(), doc.clone());
        Ok(())
    }

    fn get_stats(&mut self, file_id: &str) -> Result<Option<StatsDocument>> {
        Ok(self.stats.get(file_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::AlertEvent;

    fn doc(file_id: &str, count: u64, alerts: usize) -> StatsDocument {
        let mut doc = StatsDocument {
            file_id: file_id.to_string(),
            frames_processed: count,
            updated_at: 100 + count,
            ..StatsDocument::default()
        };
        doc.stats
            .detections_by_class
            .insert("conector".to_string(), count);
        doc.stats
            .errors
            .insert("conector suelto".to_string(), alerts as u64);
        doc.error_times = (0..alerts)
            .map(|i| AlertEvent::new("conector suelto", 0.8, i as f64))
            .collect();
        doc
    }

    fn exercise(store: &mut dyn VideoStore) {
        let meta = store.put_video("clip.mjpeg", b"\xFF\xD8data\xFF\xD9").unwrap();
        assert!(crate::is_valid_file_id(&meta.file_id));
        assert_eq!(meta.bytes, 8);
        assert_eq!(meta.sha256.len(), 64);

        let (fetched, data) = store.get_video(&meta.file_id).unwrap().unwrap();
        assert_eq!(fetched, meta);
        assert_eq!(data, b"\xFF\xD8data\xFF\xD9");
        assert!(store.get_video("0123456789abcdef01234567").unwrap().is_none());

        assert!(store.get_stats(&meta.file_id).unwrap().is_none());
        store.upsert_stats(&doc(&meta.file_id, 50, 3)).unwrap();
        store.upsert_stats(&doc(&meta.file_id, 80, 1)).unwrap();

        let stored = store.get_stats(&meta.file_id).unwrap().unwrap();
        assert_eq!(stored, doc(&meta.file_id, 80, 1));
    }

    #[test]
    fn sqlite_store_round_trips_and_overwrites() {
        let mut store = SqliteVideoStore::open(":memory:").unwrap();
        exercise(&mut store);
    }

    #[test]
    fn in_memory_store_round_trips_and_overwrites() {
        let mut store = InMemoryVideoStore::new();
        exercise(&mut store);
    }

    #[test]
    fn sqlite_store_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analytics.db");
        let path = path.to_str().unwrap();
        let file_id = {
            let mut store = SqliteVideoStore::open(path).unwrap();
            let meta = store.put_video("a.mjpeg", b"abc").unwrap();
            store.upsert_stats(&doc(&meta.file_id, 5, 2)).unwrap();
            meta.file_id
        };
        let mut store = SqliteVideoStore::open(path).unwrap();
        assert_eq!(store.video_meta(&file_id).unwrap().unwrap().filename, "a.mjpeg");
        assert_eq!(store.get_stats(&file_id).unwrap().unwrap().error_times.len(), 2);
    }
}
