//! SQLite-backed persistence: generated events, the inspiration cache, the
//! node/profile directory, the provider usage ledger and generation traces.
//!
//! The core only depends on the narrow traits ([`ArtifactStore`],
//! [`InspirationStore`], [`WorldDirectory`]); [`SqliteStore`] implements all
//! of them plus [`UsageSink`] so one file backs a whole deployment.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::fingerprint::ConditionKey;
use crate::gateway::usage::{ProviderCallRecord, UsageSink};
use crate::gateway::nanos_to_usd;
use crate::model::{
    ArtifactStatus, GeneratedArtifact, InspirationDocument, NodeInfo, PlayerProfile,
};

// =============================================================================
// Error
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("task join error: {0}")]
    Join(String),
    #[error("store is shut down")]
    Closed,
    #[error("not found: {0}")]
    NotFound(String),
}

// =============================================================================
// Traits
// =============================================================================

/// One model call made while generating, kept for audit.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationTrace {
    pub condition_key: String,
    pub attempt: u32,
    pub stage: &'static str,
    pub template_slug: &'static str,
    pub template_hash: String,
    pub model: String,
    pub raw_output: String,
    pub error: Option<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    pub latency_ms: u64,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Highest-quality active artifact for `key`.
    async fn find_best(&self, key: &ConditionKey) -> Result<Option<GeneratedArtifact>, StoreError>;

    /// Bump the usage counter. Callers treat failures as non-fatal.
    async fn record_hit(&self, artifact_id: &str) -> Result<(), StoreError>;

    /// Persist a new artifact as `active`. Duplicate keys are allowed.
    async fn insert(&self, artifact: &GeneratedArtifact) -> Result<(), StoreError>;

    async fn record_trace(&self, _trace: GenerationTrace) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
pub trait InspirationStore: Send + Sync {
    async fn find_inspiration(
        &self,
        key: &ConditionKey,
    ) -> Result<Option<InspirationDocument>, StoreError>;

    /// Insert unless a document already exists for the key. Returns whether
    /// this call stored it.
    async fn insert_inspiration(&self, doc: &InspirationDocument) -> Result<bool, StoreError>;
}

/// Read-only node metadata and player profiles.
#[async_trait]
pub trait WorldDirectory: Send + Sync {
    async fn node(&self, world_id: &str, node_id: &str) -> Result<Option<NodeInfo>, StoreError>;
    async fn profile(&self, player_id: &str) -> Result<Option<PlayerProfile>, StoreError>;
}

// =============================================================================
// SQLite store
// =============================================================================

const ARTIFACT_COLUMNS: &str = "gen_event_id, world_id, node_id, condition_key, layer, text, locale, \
     choices_json, effects_json, generated_by, quality_score, status, usage_count, created_at";

#[derive(Clone)]
pub struct SqliteStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
    /// Only one blocking thread waits on the connection mutex at a time.
    sem: Arc<Semaphore>,
}

impl SqliteStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA busy_timeout=5000;",
        )?;
        Self::from_connection(path, conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(PathBuf::from(":memory:"), conn)
    }

    fn from_connection(path: PathBuf, conn: Connection) -> Result<Self, StoreError> {
        Self::create_tables(&conn)?;
        Self::migrate_schema(&conn)?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
            sem: Arc::new(Semaphore::new(1)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Exclusive advisory lock on `<db>.lock`, held for maintenance.
    pub fn lock_exclusive(&self) -> Result<StoreLock, StoreError> {
        StoreLock::new(&self.path)
    }

    /// The SQLite connection stays usable after a panic in another holder.
    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let _permit = self.sem.acquire().await.map_err(|_| StoreError::Closed)?;
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    fn create_tables(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS generated_events (\
               gen_event_id TEXT PRIMARY KEY,\
               world_id TEXT NOT NULL,\
               node_id TEXT NOT NULL,\
               condition_key TEXT NOT NULL,\
               layer TEXT NOT NULL,\
               text TEXT NOT NULL,\
               choices_json TEXT NOT NULL DEFAULT '[]',\
               effects_json TEXT,\
               generated_by TEXT NOT NULL,\
               quality_score REAL NOT NULL,\
               status TEXT NOT NULL DEFAULT 'active',\
               usage_count INTEGER NOT NULL DEFAULT 0,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS inspiration_docs (\
               doc_id TEXT PRIMARY KEY,\
               world_id TEXT NOT NULL,\
               node_id TEXT NOT NULL,\
               condition_key TEXT NOT NULL UNIQUE,\
               sources_json TEXT NOT NULL,\
               created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS nodes (\
               world_id TEXT NOT NULL,\
               node_id TEXT NOT NULL,\
               name TEXT NOT NULL,\
               description TEXT NOT NULL DEFAULT '',\
               PRIMARY KEY (world_id, node_id)\
             );\
             CREATE TABLE IF NOT EXISTS player_profiles (\
               player_id TEXT PRIMARY KEY,\
               play_style TEXT,\
               total_runs INTEGER NOT NULL DEFAULT 0,\
               updated_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS provider_calls (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               provider TEXT NOT NULL,\
               endpoint TEXT NOT NULL,\
               model TEXT NOT NULL,\
               caller TEXT NOT NULL,\
               player_id TEXT,\
               condition_key TEXT,\
               input_tokens INTEGER NOT NULL DEFAULT 0,\
               output_tokens INTEGER NOT NULL DEFAULT 0,\
               cost_nanodollars INTEGER NOT NULL DEFAULT 0,\
               upstream_cost_nanodollars INTEGER,\
               latency_ms INTEGER NOT NULL DEFAULT 0,\
               status TEXT NOT NULL,\
               error_code TEXT,\
               request_id TEXT,\
               created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS generation_traces (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               condition_key TEXT NOT NULL,\
               attempt INTEGER NOT NULL,\
               stage TEXT NOT NULL,\
               template_slug TEXT NOT NULL,\
               template_hash TEXT NOT NULL,\
               model TEXT NOT NULL,\
               raw_output TEXT NOT NULL,\
               error TEXT,\
               input_tokens INTEGER NOT NULL DEFAULT 0,\
               output_tokens INTEGER NOT NULL DEFAULT 0,\
               cost_nanodollars INTEGER NOT NULL DEFAULT 0,\
               latency_ms INTEGER NOT NULL DEFAULT 0,\
               created_at INTEGER NOT NULL\
             );\
             CREATE INDEX IF NOT EXISTS idx_events_lookup \
               ON generated_events(condition_key, status, quality_score DESC);\
             CREATE INDEX IF NOT EXISTS idx_calls_created ON provider_calls(created_at);\
             CREATE INDEX IF NOT EXISTS idx_traces_key ON generation_traces(condition_key, attempt);",
        )?;
        Ok(())
    }

    /// Adds columns introduced after the first schema. Safe on every open.
    fn migrate_schema(conn: &Connection) -> Result<(), StoreError> {
        let migrations =
            ["ALTER TABLE generated_events ADD COLUMN locale TEXT NOT NULL DEFAULT 'ja'"];
        for sql in &migrations {
            if let Err(e) = conn.execute(sql, []) {
                if !e.to_string().contains("duplicate column name") {
                    return Err(StoreError::Sqlite(e));
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    pub async fn set_status(
        &self,
        artifact_id: &str,
        status: ArtifactStatus,
    ) -> Result<(), StoreError> {
        let artifact_id = artifact_id.to_string();
        self.blocking(move |conn| {
            let rows = conn.execute(
                "UPDATE generated_events SET status = ?1, updated_at = ?2 WHERE gen_event_id = ?3",
                params![status.as_str(), now_epoch(), artifact_id],
            )?;
            if rows == 0 {
                return Err(StoreError::NotFound(format!("generated event {artifact_id}")));
            }
            Ok(())
        })
        .await
    }

    pub async fn get_artifact(&self, artifact_id: &str) -> Result<GeneratedArtifact, StoreError> {
        let artifact_id = artifact_id.to_string();
        self.blocking(move |conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {ARTIFACT_COLUMNS} FROM generated_events WHERE gen_event_id = ?1"),
                    params![artifact_id],
                    RawArtifact::from_row,
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("generated event {artifact_id}")))?;
            raw.into_artifact()
        })
        .await
    }

    /// All artifacts for a key, best first, regardless of status.
    pub async fn artifacts_for(
        &self,
        key: &ConditionKey,
    ) -> Result<Vec<GeneratedArtifact>, StoreError> {
        let key = key.as_str().to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ARTIFACT_COLUMNS} FROM generated_events \
                 WHERE condition_key = ?1 ORDER BY quality_score DESC, created_at DESC"
            ))?;
            let raws = stmt
                .query_map(params![key], RawArtifact::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            raws.into_iter().map(RawArtifact::into_artifact).collect()
        })
        .await
    }

    pub async fn traces_for(&self, key: &ConditionKey) -> Result<Vec<TraceRow>, StoreError> {
        let key = key.as_str().to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT attempt, stage, template_slug, model, error, cost_nanodollars \
                 FROM generation_traces WHERE condition_key = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![key], |row| {
                    Ok(TraceRow {
                        attempt: row.get::<_, i64>(0)? as u32,
                        stage: row.get(1)?,
                        template_slug: row.get(2)?,
                        model: row.get(3)?,
                        error: row.get(4)?,
                        cost_nanodollars: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn artifact_stats(&self) -> Result<ArtifactStats, StoreError> {
        let day_start = utc_day_start();
        self.blocking(move |conn| {
            let (total, active, total_usage, mean_quality): (i64, i64, i64, Option<f64>) = conn
                .query_row(
                    "SELECT COUNT(*), \
                            COALESCE(SUM(CASE WHEN status = 'active' THEN 1 ELSE 0 END), 0), \
                            COALESCE(SUM(usage_count), 0), \
                            AVG(quality_score) \
                     FROM generated_events",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )?;
            let distinct_keys: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT condition_key) FROM generated_events",
                [],
                |row| row.get(0),
            )?;
            let inspiration_docs: i64 =
                conn.query_row("SELECT COUNT(*) FROM inspiration_docs", [], |row| row.get(0))?;
            let spend_today: i64 = conn.query_row(
                "SELECT COALESCE(SUM(cost_nanodollars), 0) FROM provider_calls WHERE created_at >= ?1",
                params![day_start],
                |row| row.get(0),
            )?;
            Ok(ArtifactStats {
                total,
                active,
                retired: total - active,
                distinct_keys,
                total_usage,
                mean_quality,
                inspiration_docs,
                spend_today_usd: nanos_to_usd(spend_today),
            })
        })
        .await
    }

    /// Write every artifact as one JSON object per line. Returns the count.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, StoreError> {
        let path = path.as_ref().to_path_buf();
        self.blocking(move |conn| {
            use std::io::Write;

            let mut stmt = conn.prepare(&format!(
                "SELECT {ARTIFACT_COLUMNS} FROM generated_events ORDER BY created_at DESC"
            ))?;
            let mut rows = stmt.query([])?;
            let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
            let mut written = 0usize;
            while let Some(row) = rows.next()? {
                let artifact = RawArtifact::from_row(row)?.into_artifact()?;
                let line = serde_json::to_string(&artifact)?;
                writeln!(file, "{line}")?;
                written += 1;
            }
            file.flush()?;
            Ok(written)
        })
        .await
    }

    /// Delete traces and usage rows older than `max_age_days`. Artifacts and
    /// inspiration are never pruned. Hold [`Self::lock_exclusive`] while calling.
    pub async fn prune(&self, max_age_days: u64) -> Result<PruneStats, StoreError> {
        self.blocking(move |conn| {
            let max_age = i64::try_from(max_age_days).unwrap_or(i64::MAX);
            let cutoff = now_epoch().saturating_sub(max_age.saturating_mul(86_400));
            let traces_deleted = conn.execute(
                "DELETE FROM generation_traces WHERE created_at < ?1",
                params![cutoff],
            )?;
            let calls_deleted = conn.execute(
                "DELETE FROM provider_calls WHERE created_at < ?1",
                params![cutoff],
            )?;
            Ok(PruneStats {
                traces_deleted,
                calls_deleted,
            })
        })
        .await
    }

    pub async fn upsert_node(&self, node: &NodeInfo) -> Result<(), StoreError> {
        let node = node.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO nodes (world_id, node_id, name, description) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(world_id, node_id) DO UPDATE SET \
                   name = excluded.name, description = excluded.description",
                params![node.world_id, node.node_id, node.name, node.description],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn upsert_profile(&self, profile: &PlayerProfile) -> Result<(), StoreError> {
        let profile = profile.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO player_profiles (player_id, play_style, total_runs, updated_at) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(player_id) DO UPDATE SET \
                   play_style = excluded.play_style, total_runs = excluded.total_runs, \
                   updated_at = excluded.updated_at",
                params![profile.player_id, profile.play_style, profile.total_runs, now_epoch()],
            )?;
            Ok(())
        })
        .await
    }
}

// =============================================================================
// Trait impls
// =============================================================================

#[async_trait]
impl ArtifactStore for SqliteStore {
    async fn find_best(&self, key: &ConditionKey) -> Result<Option<GeneratedArtifact>, StoreError> {
        let key = key.as_str().to_string();
        self.blocking(move |conn| {
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {ARTIFACT_COLUMNS} FROM generated_events \
                         WHERE condition_key = ?1 AND status = 'active' \
                         ORDER BY quality_score DESC LIMIT 1"
                    ),
                    params![key],
                    RawArtifact::from_row,
                )
                .optional()?;
            raw.map(RawArtifact::into_artifact).transpose()
        })
        .await
    }

    async fn record_hit(&self, artifact_id: &str) -> Result<(), StoreError> {
        let artifact_id = artifact_id.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE generated_events SET usage_count = usage_count + 1 WHERE gen_event_id = ?1",
                params![artifact_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert(&self, artifact: &GeneratedArtifact) -> Result<(), StoreError> {
        let artifact = artifact.clone();
        let choices_json = serde_json::to_string(&artifact.choices)?;
        let effects_json = artifact
            .effects
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO generated_events (\
                   gen_event_id, world_id, node_id, condition_key, layer, text, locale,\
                   choices_json, effects_json, generated_by, quality_score, status,\
                   usage_count, created_at, updated_at\
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
                params![
                    artifact.id,
                    artifact.world_id,
                    artifact.node_id,
                    artifact.condition_key.as_str(),
                    artifact.layer,
                    artifact.text,
                    artifact.locale,
                    choices_json,
                    effects_json,
                    artifact.generated_by,
                    artifact.quality_score,
                    ArtifactStatus::Active.as_str(),
                    artifact.usage_count,
                    artifact.created_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_trace(&self, trace: GenerationTrace) -> Result<(), StoreError> {
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO generation_traces (\
                   condition_key, attempt, stage, template_slug, template_hash, model,\
                   raw_output, error, input_tokens, output_tokens, cost_nanodollars,\
                   latency_ms, created_at\
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    trace.condition_key,
                    trace.attempt,
                    trace.stage,
                    trace.template_slug,
                    trace.template_hash,
                    trace.model,
                    trace.raw_output,
                    trace.error,
                    trace.input_tokens,
                    trace.output_tokens,
                    trace.cost_nanodollars,
                    trace.latency_ms as i64,
                    now_epoch(),
                ],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl InspirationStore for SqliteStore {
    async fn find_inspiration(
        &self,
        key: &ConditionKey,
    ) -> Result<Option<InspirationDocument>, StoreError> {
        let key = key.as_str().to_string();
        self.blocking(move |conn| {
            let doc = conn
                .query_row(
                    "SELECT doc_id, condition_key, world_id, node_id, sources_json, created_at \
                     FROM inspiration_docs WHERE condition_key = ?1 LIMIT 1",
                    params![key],
                    |row| {
                        Ok(InspirationDocument {
                            doc_id: row.get(0)?,
                            condition_key: ConditionKey::from_raw(row.get::<_, String>(1)?),
                            world_id: row.get(2)?,
                            node_id: row.get(3)?,
                            raw: row.get(4)?,
                            created_at: row.get(5)?,
                        })
                    },
                )
                .optional()?;
            Ok(doc)
        })
        .await
    }

    async fn insert_inspiration(&self, doc: &InspirationDocument) -> Result<bool, StoreError> {
        let doc = doc.clone();
        self.blocking(move |conn| {
            let rows = conn.execute(
                "INSERT OR IGNORE INTO inspiration_docs \
                   (doc_id, world_id, node_id, condition_key, sources_json, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    doc.doc_id,
                    doc.world_id,
                    doc.node_id,
                    doc.condition_key.as_str(),
                    doc.raw,
                    doc.created_at,
                ],
            )?;
            Ok(rows > 0)
        })
        .await
    }
}

#[async_trait]
impl WorldDirectory for SqliteStore {
    async fn node(&self, world_id: &str, node_id: &str) -> Result<Option<NodeInfo>, StoreError> {
        let world_id = world_id.to_string();
        let node_id = node_id.to_string();
        self.blocking(move |conn| {
            let node = conn
                .query_row(
                    "SELECT world_id, node_id, name, description FROM nodes \
                     WHERE world_id = ?1 AND node_id = ?2",
                    params![world_id, node_id],
                    |row| {
                        Ok(NodeInfo {
                            world_id: row.get(0)?,
                            node_id: row.get(1)?,
                            name: row.get(2)?,
                            description: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(node)
        })
        .await
    }

    async fn profile(&self, player_id: &str) -> Result<Option<PlayerProfile>, StoreError> {
        let player_id = player_id.to_string();
        self.blocking(move |conn| {
            let profile = conn
                .query_row(
                    "SELECT player_id, play_style, total_runs FROM player_profiles \
                     WHERE player_id = ?1",
                    params![player_id],
                    |row| {
                        Ok(PlayerProfile {
                            player_id: row.get(0)?,
                            play_style: row.get(1)?,
                            total_runs: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(profile)
        })
        .await
    }
}

#[async_trait]
impl UsageSink for SqliteStore {
    async fn record(&self, record: ProviderCallRecord) {
        let result = self
            .blocking(move |conn| {
                conn.execute(
                    "INSERT INTO provider_calls (\
                       provider, endpoint, model, caller, player_id, condition_key,\
                       input_tokens, output_tokens, cost_nanodollars, upstream_cost_nanodollars,\
                       latency_ms, status, error_code, request_id, created_at\
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                    params![
                        record.provider,
                        record.endpoint,
                        record.model,
                        record.caller,
                        record.player_id,
                        record.condition_key,
                        record.input_tokens,
                        record.output_tokens,
                        record.cost_nanodollars,
                        record.upstream_cost_nanodollars,
                        record.latency_ms,
                        record.status.as_str(),
                        record.error_code,
                        record.request_id,
                        record.timestamp.timestamp(),
                    ],
                )?;
                Ok(())
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to record provider call");
        }
    }

    async fn daily_spend_usd(&self) -> Option<f64> {
        let day_start = utc_day_start();
        let result = self
            .blocking(move |conn| {
                let nanos: i64 = conn.query_row(
                    "SELECT COALESCE(SUM(cost_nanodollars), 0) FROM provider_calls \
                     WHERE created_at >= ?1",
                    params![day_start],
                    |row| row.get(0),
                )?;
                Ok(nanos)
            })
            .await;
        match result {
            Ok(nanos) => Some(nanos_to_usd(nanos)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read daily spend");
                None
            }
        }
    }
}

// =============================================================================
// Rows
// =============================================================================

/// Column values before JSON decoding.
struct RawArtifact {
    id: String,
    world_id: String,
    node_id: String,
    condition_key: String,
    layer: String,
    text: String,
    locale: String,
    choices_json: String,
    effects_json: Option<String>,
    generated_by: String,
    quality_score: f64,
    status: String,
    usage_count: i64,
    created_at: i64,
}

impl RawArtifact {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            world_id: row.get(1)?,
            node_id: row.get(2)?,
            condition_key: row.get(3)?,
            layer: row.get(4)?,
            text: row.get(5)?,
            locale: row.get(6)?,
            choices_json: row.get(7)?,
            effects_json: row.get(8)?,
            generated_by: row.get(9)?,
            quality_score: row.get(10)?,
            status: row.get(11)?,
            usage_count: row.get(12)?,
            created_at: row.get(13)?,
        })
    }

    fn into_artifact(self) -> Result<GeneratedArtifact, StoreError> {
        let effects = match self.effects_json.as_deref() {
            None | Some("null") | Some("") => None,
            Some(raw) => Some(serde_json::from_str(raw)?),
        };
        Ok(GeneratedArtifact {
            id: self.id,
            world_id: self.world_id,
            node_id: self.node_id,
            condition_key: ConditionKey::from_raw(self.condition_key),
            layer: self.layer,
            text: self.text,
            locale: self.locale,
            choices: serde_json::from_str(&self.choices_json)?,
            effects,
            generated_by: self.generated_by,
            quality_score: self.quality_score,
            status: ArtifactStatus::from_str(&self.status),
            usage_count: self.usage_count,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceRow {
    pub attempt: u32,
    pub stage: String,
    pub template_slug: String,
    pub model: String,
    pub error: Option<String>,
    pub cost_nanodollars: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactStats {
    pub total: i64,
    pub active: i64,
    pub retired: i64,
    pub distinct_keys: i64,
    pub total_usage: i64,
    pub mean_quality: Option<f64>,
    pub inspiration_docs: i64,
    pub spend_today_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PruneStats {
    pub traces_deleted: usize,
    pub calls_deleted: usize,
}

#[derive(Debug)]
pub struct StoreLock {
    _file: std::fs::File,
}

impl StoreLock {
    fn new(db_path: &Path) -> Result<Self, StoreError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

pub(crate) fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn utc_day_start() -> i64 {
    let now = now_epoch();
    now - now.rem_euclid(86_400)
}
