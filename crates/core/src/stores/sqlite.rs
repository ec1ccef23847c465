use crate::traits::CollectionStore;
use crate::{Collection, DistanceMetric, ScoredChunk, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS store_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS collections (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chunks (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL REFERENCES collections(name) ON DELETE CASCADE,
    chunk_id TEXT NOT NULL,
    text TEXT NOT NULL,
    embedding BLOB NOT NULL,
    UNIQUE (collection, chunk_id)
);

CREATE INDEX IF NOT EXISTS idx_chunks_collection ON chunks(collection, seq);
"#;

/// Fixed at store creation; a reopened store must be configured identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub dimensions: usize,
    pub metric: DistanceMetric,
    pub embedding_model: String,
}

/// Collections persisted in one SQLite database file.
pub struct SqliteCollectionStore {
    conn: Arc<Mutex<Connection>>,
    settings: StoreSettings,
    path: PathBuf,
}

impl SqliteCollectionStore {
    pub fn open(path: impl AsRef<Path>, settings: StoreSettings) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        reconcile_settings(&conn, &settings)?;

        info!(
            path = %path.display(),
            dimensions = settings.dimensions,
            metric = %settings.metric,
            model = %settings.embedding_model,
            "opened collection store"
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            settings,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Removes every collection and returns the names that were removed.
    pub async fn delete_all(&self) -> Result<Vec<String>, StoreError> {
        let removed = self
            .with_conn(|conn| {
                let tx = conn.transaction()?;
                let names = list_names(&tx)?;
                tx.execute("DELETE FROM chunks", [])?;
                tx.execute("DELETE FROM collections", [])?;
                tx.commit()?;
                Ok(names)
            })
            .await?;
        info!(count = removed.len(), "deleted all collections");
        Ok(removed)
    }

    /// Flushes and closes the database. Fails if another handle still shares
    /// the connection.
    pub fn close(self) -> Result<(), StoreError> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| StoreError::Task("store is still in use".to_string()))?
            .into_inner()
            .map_err(|_| StoreError::Task("store lock poisoned".to_string()))?;
        conn.close().map_err(|(_, error)| StoreError::Sqlite(error))
    }

    async fn with_conn<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Task("store lock poisoned".to_string()))?;
            work(&mut guard)
        })
        .await
        .map_err(|error| StoreError::Task(error.to_string()))?
    }

    fn check_dimensions(&self, embedding: &[f32]) -> Result<(), StoreError> {
        if embedding.len() != self.settings.dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: self.settings.dimensions,
                actual: embedding.len(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CollectionStore for SqliteCollectionStore {
    fn dimensions(&self) -> usize {
        self.settings.dimensions
    }

    fn metric(&self) -> DistanceMetric {
        self.settings.metric
    }

    fn embedding_model(&self) -> &str {
        &self.settings.embedding_model
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| list_names(conn)).await
    }

    async fn create(&self, name: &str) -> Result<Collection, StoreError> {
        validate_collection_name(name)?;
        let name = name.to_string();
        let collection = self
            .with_conn(move |conn| {
                let created_at = Utc::now();
                let inserted = conn.execute(
                    "INSERT INTO collections (name, created_at) VALUES (?1, ?2)",
                    params![name, created_at.to_rfc3339()],
                );
                match inserted {
                    Ok(_) => Ok(Collection {
                        name,
                        created_at,
                        chunk_count: 0,
                    }),
                    Err(error) if is_constraint_violation(&error) => {
                        Err(StoreError::CollectionExists(name))
                    }
                    Err(error) => Err(error.into()),
                }
            })
            .await?;
        info!(collection = %collection.name, "created collection");
        Ok(collection)
    }

    async fn get(&self, name: &str) -> Result<Collection, StoreError> {
        let name = name.to_string();
        self.with_conn(move |conn| load_collection(conn, &name)).await
    }

    async fn add(
        &self,
        name: &str,
        chunk_id: &str,
        text: &str,
        embedding: &[f32],
    ) -> Result<(), StoreError> {
        self.check_dimensions(embedding)?;
        let name = name.to_string();
        let chunk_id = chunk_id.to_string();
        let text = text.to_string();
        let blob = encode_embedding(embedding);

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            if !collection_exists(&tx, &name)? {
                return Err(StoreError::CollectionNotFound(name));
            }
            let inserted = tx.execute(
                "INSERT INTO chunks (collection, chunk_id, text, embedding) VALUES (?1, ?2, ?3, ?4)",
                params![name, chunk_id, text, blob],
            );
            match inserted {
                Ok(_) => {}
                Err(error) if is_constraint_violation(&error) => {
                    return Err(StoreError::DuplicateChunkId {
                        collection: name,
                        chunk_id,
                    });
                }
                Err(error) => return Err(error.into()),
            }
            tx.commit()?;
            debug!(collection = %name, chunk_id = %chunk_id, "stored chunk");
            Ok(())
        })
        .await
    }

    async fn query_scored(
        &self,
        name: &str,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        self.check_dimensions(query_embedding)?;
        let name = name.to_string();
        let query = query_embedding.to_vec();
        let metric = self.settings.metric;

        self.with_conn(move |conn| {
            if !collection_exists(conn, &name)? {
                return Err(StoreError::CollectionNotFound(name));
            }
            if k == 0 {
                return Ok(Vec::new());
            }

            let mut statement = conn.prepare(
                "SELECT chunk_id, text, embedding FROM chunks WHERE collection = ?1 ORDER BY seq",
            )?;
            let rows = statement.query_map(params![name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?;

            let mut scored = Vec::new();
            for row in rows {
                let (chunk_id, text, blob) = row?;
                let embedding = decode_embedding(&blob);
                scored.push(ScoredChunk {
                    chunk_id,
                    text,
                    score: metric.similarity(&query, &embedding),
                });
            }

            scored.sort_by(|left, right| right.score.total_cmp(&left.score));
            scored.truncate(k);
            debug!(collection = %name, k, hits = scored.len(), "queried collection");
            Ok(scored)
        })
        .await
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let name = name.to_string();
        let (name, removed) = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM chunks WHERE collection = ?1", params![name])?;
                let removed = tx.execute("DELETE FROM collections WHERE name = ?1", params![name])?;
                tx.commit()?;
                Ok((name, removed > 0))
            })
            .await?;
        if removed {
            info!(collection = %name, "deleted collection");
        }
        Ok(removed)
    }

    async fn chunk_ids(&self, name: &str) -> Result<Vec<String>, StoreError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            if !collection_exists(conn, &name)? {
                return Err(StoreError::CollectionNotFound(name));
            }
            let mut statement =
                conn.prepare("SELECT chunk_id FROM chunks WHERE collection = ?1 ORDER BY seq")?;
            let ids = statement
                .query_map(params![name], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }
}

/// Names are 1 to 128 characters of ASCII letters, digits, `.`, `_` or `-`.
pub fn validate_collection_name(name: &str) -> Result<(), StoreError> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let valid = PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]{1,128}$").ok())
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(name));

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidCollectionName(name.to_string()))
    }
}

fn reconcile_settings(conn: &Connection, settings: &StoreSettings) -> Result<(), StoreError> {
    let expected = [
        ("dimensions", settings.dimensions.to_string()),
        ("metric", settings.metric.as_str().to_string()),
        ("embedding_model", settings.embedding_model.clone()),
    ];

    for (key, configured) in expected {
        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        match stored {
            Some(stored) if stored != configured => {
                return Err(StoreError::ConfigMismatch {
                    key: key.to_string(),
                    stored,
                    configured,
                });
            }
            Some(_) => {}
            None => {
                conn.execute(
                    "INSERT INTO store_meta (key, value) VALUES (?1, ?2)",
                    params![key, configured],
                )?;
            }
        }
    }

    Ok(())
}

fn list_names(conn: &Connection) -> Result<Vec<String>, StoreError> {
    let mut statement = conn.prepare("SELECT name FROM collections ORDER BY name")?;
    let names = statement
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

fn collection_exists(conn: &Connection, name: &str) -> Result<bool, StoreError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM collections WHERE name = ?1",
            params![name],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn load_collection(conn: &Connection, name: &str) -> Result<Collection, StoreError> {
    let row = conn
        .query_row(
            "SELECT c.created_at, (SELECT COUNT(*) FROM chunks WHERE collection = c.name)
             FROM collections c WHERE c.name = ?1",
            params![name],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;

    let (created_at, count) = row.ok_or_else(|| StoreError::CollectionNotFound(name.to_string()))?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| StoreError::Task(format!("corrupt created_at for {name}: {error}")))?;

    Ok(Collection {
        name: name.to_string(),
        created_at,
        chunk_count: u64::try_from(count).unwrap_or_default(),
    })
}

fn is_constraint_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::ConstraintViolation
    )
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding
        .iter()
        .flat_map(|value| value.to_le_bytes())
        .collect()
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect()
}
