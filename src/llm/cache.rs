//! On-disk response cache.
//!
//! Stores query responses in a SQLite database keyed by a canonical request
//! fingerprint, so repeated identical queries return the stored response
//! instead of re-dispatching. The cache is an owned dependency of the
//! orchestrator that opened it; instances with different cache files are
//! fully isolated from each other.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

use super::types::{ChatMessage, CompletionResponse, Provider};

/// File suffix every cache name is normalized to.
const CACHE_SUFFIX: &str = ".db";

/// Append the database suffix to a cache name that lacks one.
pub fn normalize_cache_name(name: &str) -> String {
    if name.ends_with(CACHE_SUFFIX) {
        name.to_string()
    } else {
        format!("{name}{CACHE_SUFFIX}")
    }
}

/// SHA-256 of the input as a 64-character lowercase hex string.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Canonical fingerprint of a query: provider, model, and the ordered
/// role-tagged message contents.
pub fn request_fingerprint(provider: Provider, model: &str, messages: &[ChatMessage]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(model.as_bytes());
    hasher.update(b"\0");
    for msg in messages {
        hasher.update(format!("{}:", msg.role as u8).as_bytes());
        hasher.update(msg.content.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// SQLite-backed query→response cache.
pub struct ResponseCache {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl ResponseCache {
    /// Open or create a cache under the given name. Names without a `.db`
    /// suffix are normalized; `~` is expanded.
    pub fn open(name: &str) -> Result<Self> {
        let normalized = normalize_cache_name(name);
        let expanded = shellexpand::tilde(&normalized).into_owned();
        let conn = Connection::open(&expanded).map_err(|e| Error::Cache(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::Cache(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(expanded),
        })
    }

    /// Create an in-memory cache (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Cache(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::Cache(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Path of the backing database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Cache(format!("failed to lock connection: {e}")))?;
        f(&conn).map_err(|e| Error::Cache(e.to_string()))
    }

    /// Look up a stored response by fingerprint.
    pub fn get(&self, fingerprint: &str) -> Result<Option<CompletionResponse>> {
        let stored: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT response FROM responses WHERE fingerprint = ?1",
                params![fingerprint],
                |row| row.get(0),
            )
            .optional()
        })?;

        match stored {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Store a response under its fingerprint, replacing any prior entry.
    pub fn put(
        &self,
        fingerprint: &str,
        provider: Provider,
        model: &str,
        response: &CompletionResponse,
    ) -> Result<()> {
        let json = serde_json::to_string(response)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO responses (fingerprint, provider, model, response)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(fingerprint) DO UPDATE SET response = excluded.response",
                params![fingerprint, provider.to_string(), model, json],
            )?;
            Ok(())
        })
    }

    /// Number of stored responses.
    pub fn entry_count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM responses", [], |row| {
                row.get::<_, i64>(0)
            })
        })
        .map(|n| n as u64)
    }
}

fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    // WAL for concurrent readers sharing the same cache file
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS responses (
            fingerprint TEXT PRIMARY KEY,
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            response TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_responses_provider_model
         ON responses(provider, model)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{StopReason, TokenUsage};
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn sample_response(content: &str) -> CompletionResponse {
        CompletionResponse {
            id: "resp-1".to_string(),
            model: "test-model".to_string(),
            content: content.to_string(),
            stop_reason: Some(StopReason::EndTurn),
            usage: TokenUsage {
                input_tokens: 3,
                output_tokens: 7,
            },
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_normalize_cache_name() {
        assert_eq!(normalize_cache_name("mycache"), "mycache.db");
        assert_eq!(normalize_cache_name("mycache.db"), "mycache.db");
        assert_eq!(normalize_cache_name("runs/march"), "runs/march.db");
    }

    #[test]
    fn test_sha256_hex_properties() {
        let hash = sha256_hex("x");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

        assert_eq!(hash, sha256_hex("x"));
        assert_ne!(hash, sha256_hex("y"));
    }

    #[test]
    fn test_fingerprint_sensitivity() {
        let messages = vec![ChatMessage::system("S"), ChatMessage::user("U")];

        let base = request_fingerprint(Provider::OpenAI, "gpt-4o", &messages);
        assert_eq!(
            base,
            request_fingerprint(Provider::OpenAI, "gpt-4o", &messages)
        );

        assert_ne!(
            base,
            request_fingerprint(Provider::Anthropic, "gpt-4o", &messages)
        );
        assert_ne!(
            base,
            request_fingerprint(Provider::OpenAI, "gpt-4o-mini", &messages)
        );
        assert_ne!(
            base,
            request_fingerprint(Provider::OpenAI, "gpt-4o", &[ChatMessage::user("U")])
        );
    }

    #[test]
    fn test_put_get_roundtrip() {
        let cache = ResponseCache::in_memory().unwrap();
        let fp = sha256_hex("some request");

        assert!(cache.get(&fp).unwrap().is_none());

        cache
            .put(&fp, Provider::OpenAI, "gpt-4o", &sample_response("hello"))
            .unwrap();

        let hit = cache.get(&fp).unwrap().unwrap();
        assert_eq!(hit.content, "hello");
        assert_eq!(cache.entry_count().unwrap(), 1);
    }

    #[test]
    fn test_put_replaces_prior_entry() {
        let cache = ResponseCache::in_memory().unwrap();
        let fp = sha256_hex("req");

        cache
            .put(&fp, Provider::OpenAI, "gpt-4o", &sample_response("first"))
            .unwrap();
        cache
            .put(&fp, Provider::OpenAI, "gpt-4o", &sample_response("second"))
            .unwrap();

        assert_eq!(cache.get(&fp).unwrap().unwrap().content, "second");
        assert_eq!(cache.entry_count().unwrap(), 1);
    }

    #[test]
    fn test_cache_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("responses").to_string_lossy().into_owned();
        let fp = sha256_hex("req");

        {
            let cache = ResponseCache::open(&name).unwrap();
            assert!(cache.path().to_string_lossy().ends_with(".db"));
            cache
                .put(&fp, Provider::Google, "gemini-2.0-flash", &sample_response("kept"))
                .unwrap();
        }

        let reopened = ResponseCache::open(&name).unwrap();
        assert_eq!(reopened.get(&fp).unwrap().unwrap().content, "kept");
    }
}
