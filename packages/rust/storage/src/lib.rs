//! Turso Embedded / libSQL storage layer (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding:
//! - the content-addressed result cache (generated scripts, synthesized audio)
//! - pipeline run records and their per-stage checkpoints
//!
//! Cache entries are write-once: the first write for a key wins and every
//! later writer reads back the stored value. Entries are never evicted.

mod migrations;

use std::path::Path;

use chrono::Utc;
use libsql::{Connection, Database, params};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use showrunner_shared::{GeneratedScript, Result, RunState, ShowrunnerError};

/// What a cache entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Script,
    Audio,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Audio => "audio",
        }
    }
}

/// A raw cache row.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub cache_key: String,
    pub kind: String,
    pub metadata_json: Option<String>,
    pub payload: Vec<u8>,
    pub created_at: String,
}

/// Audio as stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedAudio {
    pub duration_ms: u64,
    pub format: String,
    pub audio: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct AudioMeta {
    duration_ms: u64,
    format: String,
}

/// A persisted pipeline run.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_key: String,
    pub episode_id: String,
    pub state: RunState,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

fn db_err(e: libsql::Error) -> ShowrunnerError {
    ShowrunnerError::Storage(e.to_string())
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ShowrunnerError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database in read-only mode (used by `status`).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    ShowrunnerError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(ShowrunnerError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cache entries
    // -----------------------------------------------------------------------

    /// Fetch a cache entry by key.
    pub async fn get_cache_entry(&self, cache_key: &str) -> Result<Option<CacheEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT cache_key, kind, metadata_json, payload, created_at
                 FROM cache_entries WHERE cache_key = ?1",
                params![cache_key],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(CacheEntry {
                cache_key: row.get::<String>(0).map_err(db_err)?,
                kind: row.get::<String>(1).map_err(db_err)?,
                metadata_json: row.get::<Option<String>>(2).map_err(db_err)?,
                payload: row.get::<Vec<u8>>(3).map_err(db_err)?,
                created_at: row.get::<String>(4).map_err(db_err)?,
            })),
            None => Ok(None),
        }
    }

    /// Insert a cache entry unless one already exists for the key, then
    /// return whatever is stored. Concurrent writers all observe the winner.
    pub async fn put_cache_entry(
        &self,
        cache_key: &str,
        kind: CacheKind,
        metadata_json: Option<&str>,
        payload: &[u8],
    ) -> Result<CacheEntry> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        let inserted = self
            .conn
            .execute(
                "INSERT INTO cache_entries (id, cache_key, kind, metadata_json, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(cache_key) DO NOTHING",
                params![
                    id.as_str(),
                    cache_key,
                    kind.as_str(),
                    metadata_json,
                    payload.to_vec(),
                    now.as_str()
                ],
            )
            .await
            .map_err(db_err)?;

        if inserted == 0 {
            tracing::debug!(cache_key, kind = kind.as_str(), "cache entry already present");
        }

        self.get_cache_entry(cache_key).await?.ok_or_else(|| {
            ShowrunnerError::Storage(format!("cache entry {cache_key} vanished after write"))
        })
    }

    /// Count cache entries of one kind.
    pub async fn count_cache_entries(&self, kind: CacheKind) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM cache_entries WHERE kind = ?1",
                params![kind.as_str()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => row.get::<u64>(0).map_err(db_err),
            None => Ok(0),
        }
    }

    /// Cached script for `cache_key`, if any.
    pub async fn get_script(&self, cache_key: &str) -> Result<Option<GeneratedScript>> {
        match self.get_cache_entry(cache_key).await? {
            Some(entry) => decode_json(&entry.payload, "cached script").map(Some),
            None => Ok(None),
        }
    }

    /// Store a script; returns the stored (possibly pre-existing) value.
    pub async fn put_script(
        &self,
        cache_key: &str,
        script: &GeneratedScript,
    ) -> Result<GeneratedScript> {
        let payload = serde_json::to_vec(script)
            .map_err(|e| ShowrunnerError::Storage(format!("encode script: {e}")))?;
        let entry = self
            .put_cache_entry(cache_key, CacheKind::Script, None, &payload)
            .await?;
        decode_json(&entry.payload, "cached script")
    }

    /// Cached audio for `cache_key`, if any.
    pub async fn get_audio(&self, cache_key: &str) -> Result<Option<CachedAudio>> {
        match self.get_cache_entry(cache_key).await? {
            Some(entry) => decode_audio(entry).map(Some),
            None => Ok(None),
        }
    }

    /// Store audio; returns the stored (possibly pre-existing) value.
    pub async fn put_audio(&self, cache_key: &str, audio: &CachedAudio) -> Result<CachedAudio> {
        let meta = serde_json::to_string(&AudioMeta {
            duration_ms: audio.duration_ms,
            format: audio.format.clone(),
        })
        .map_err(|e| ShowrunnerError::Storage(format!("encode audio metadata: {e}")))?;

        let entry = self
            .put_cache_entry(cache_key, CacheKind::Audio, Some(&meta), &audio.audio)
            .await?;
        decode_audio(entry)
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Fetch a run record.
    pub async fn get_run(&self, run_key: &str) -> Result<Option<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT run_key, episode_id, state, failed_stage, last_error, created_at, updated_at
                 FROM runs WHERE run_key = ?1",
                params![run_key],
            )
            .await
            .map_err(db_err)?;

        let Some(row) = rows.next().await.map_err(db_err)? else {
            return Ok(None);
        };

        let state_col = row.get::<String>(2).map_err(db_err)?;
        let failed_col = row.get::<Option<String>>(3).map_err(db_err)?;
        let state = RunState::from_columns(&state_col, failed_col.as_deref()).ok_or_else(|| {
            ShowrunnerError::Storage(format!("unknown run state '{state_col}'"))
        })?;

        Ok(Some(RunRecord {
            run_key: row.get::<String>(0).map_err(db_err)?,
            episode_id: row.get::<String>(1).map_err(db_err)?,
            state,
            last_error: row.get::<Option<String>>(4).map_err(db_err)?,
            created_at: row.get::<String>(5).map_err(db_err)?,
            updated_at: row.get::<String>(6).map_err(db_err)?,
        }))
    }

    /// Most recent runs for an episode, newest first.
    pub async fn list_runs(&self, episode_id: &str) -> Result<Vec<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT run_key FROM runs WHERE episode_id = ?1 ORDER BY updated_at DESC",
                params![episode_id],
            )
            .await
            .map_err(db_err)?;

        let mut keys = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            keys.push(row.get::<String>(0).map_err(db_err)?);
        }

        let mut runs = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(run) = self.get_run(&key).await? {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    /// Create or update a run's state. `last_error` is cleared unless given.
    pub async fn set_run_state(
        &self,
        run_key: &str,
        episode_id: &str,
        state: RunState,
        last_error: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let (state_col, failed_col) = state.to_columns();
        self.conn
            .execute(
                "INSERT INTO runs (run_key, episode_id, state, failed_stage, last_error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(run_key) DO UPDATE SET
                   state = excluded.state,
                   failed_stage = excluded.failed_stage,
                   last_error = excluded.last_error,
                   updated_at = excluded.updated_at",
                params![
                    run_key,
                    episode_id,
                    state_col,
                    failed_col,
                    last_error,
                    now.as_str(),
                    now.as_str()
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Load a named checkpoint for a run.
    pub async fn load_checkpoint<T: DeserializeOwned>(
        &self,
        run_key: &str,
        name: &str,
    ) -> Result<Option<T>> {
        let mut rows = self
            .conn
            .query(
                "SELECT payload_json FROM checkpoints WHERE run_key = ?1 AND name = ?2",
                params![run_key, name],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => {
                let json = row.get::<String>(0).map_err(db_err)?;
                decode_json(json.as_bytes(), name).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Commit a named checkpoint for a run, replacing any previous value.
    pub async fn save_checkpoint<T: Serialize>(
        &self,
        run_key: &str,
        name: &str,
        value: &T,
    ) -> Result<()> {
        self.check_writable()?;
        let json = serde_json::to_string(value)
            .map_err(|e| ShowrunnerError::Storage(format!("encode checkpoint {name}: {e}")))?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO checkpoints (run_key, name, payload_json, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(run_key, name) DO UPDATE SET
                   payload_json = excluded.payload_json,
                   created_at = excluded.created_at",
                params![run_key, name, json.as_str(), now.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Names of committed checkpoints for a run.
    pub async fn list_checkpoints(&self, run_key: &str) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT name FROM checkpoints WHERE run_key = ?1 ORDER BY created_at, name",
                params![run_key],
            )
            .await
            .map_err(db_err)?;

        let mut names = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            names.push(row.get::<String>(0).map_err(db_err)?);
        }
        Ok(names)
    }
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| ShowrunnerError::Storage(format!("decode {what}: {e}")))
}

fn decode_audio(entry: CacheEntry) -> Result<CachedAudio> {
    let meta_json = entry.metadata_json.ok_or_else(|| {
        ShowrunnerError::Storage(format!("audio entry {} has no metadata", entry.cache_key))
    })?;
    let meta: AudioMeta = decode_json(meta_json.as_bytes(), "audio metadata")?;
    Ok(CachedAudio {
        duration_ms: meta.duration_ms,
        format: meta.format,
        audio: entry.payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use showrunner_shared::{ScriptSegment, Stage};

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("sr_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn script(title: &str) -> GeneratedScript {
        GeneratedScript {
            title: title.into(),
            description: "desc".into(),
            segments: vec![ScriptSegment {
                index: 0,
                title: "Opening".into(),
                narration: "Welcome.".into(),
                query_index: 0,
                citations: vec!["t1".into()],
            }],
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("sr_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn script_cache_first_write_wins() {
        let storage = test_storage().await;

        assert!(storage.get_script("k1").await.unwrap().is_none());

        let stored = storage.put_script("k1", &script("first")).await.unwrap();
        assert_eq!(stored.title, "first");

        let again = storage.put_script("k1", &script("second")).await.unwrap();
        assert_eq!(again.title, "first");

        let fetched = storage.get_script("k1").await.unwrap().unwrap();
        assert_eq!(fetched, script("first"));
        assert_eq!(storage.count_cache_entries(CacheKind::Script).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn audio_cache_roundtrips_bytes() {
        let storage = test_storage().await;
        let audio = CachedAudio {
            duration_ms: 4_250,
            format: "mp3".into(),
            audio: vec![0xFF, 0xFB, 0x00, 0x01],
        };
        storage.put_audio("a1", &audio).await.unwrap();

        let fetched = storage.get_audio("a1").await.unwrap().unwrap();
        assert_eq!(fetched, audio);
        assert_eq!(storage.count_cache_entries(CacheKind::Audio).await.unwrap(), 1);
        assert_eq!(storage.count_cache_entries(CacheKind::Script).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_state_transitions() {
        let storage = test_storage().await;
        storage
            .set_run_state("r1", "ep1", RunState::Running(Stage::Retrieving), None)
            .await
            .unwrap();
        storage
            .set_run_state("r1", "ep1", RunState::Failed(Stage::Synthesizing), Some("429"))
            .await
            .unwrap();

        let run = storage.get_run("r1").await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Failed(Stage::Synthesizing));
        assert_eq!(run.last_error.as_deref(), Some("429"));

        storage
            .set_run_state("r1", "ep1", RunState::Done, None)
            .await
            .unwrap();
        let run = storage.get_run("r1").await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Done);
        assert!(run.last_error.is_none());

        let runs = storage.list_runs("ep1").await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(storage.get_run("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn checkpoints_save_and_replace() {
        let storage = test_storage().await;
        storage
            .set_run_state("r1", "ep1", RunState::Running(Stage::Synthesizing), None)
            .await
            .unwrap();

        storage.save_checkpoint("r1", "audio_progress", &vec![0usize]).await.unwrap();
        storage.save_checkpoint("r1", "audio_progress", &vec![0usize, 2]).await.unwrap();

        let loaded: Vec<usize> = storage
            .load_checkpoint("r1", "audio_progress")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, vec![0, 2]);

        let missing: Option<Vec<usize>> = storage.load_checkpoint("r1", "script").await.unwrap();
        assert!(missing.is_none());
        assert_eq!(storage.list_checkpoints("r1").await.unwrap(), vec!["audio_progress"]);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("sr_test_{}.db", Uuid::now_v7()));
        drop(Storage::open(&tmp).await.expect("create"));
        let ro = Storage::open_readonly(&tmp).await.expect("open ro");
        let err = ro.put_script("k", &script("x")).await.unwrap_err();
        assert!(err.to_string().contains("read-only"));
    }
}
