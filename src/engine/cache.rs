// ── Zenfeed Engine: Enrichment Cache ───────────────────────────────────────
// Embedded SQLite database holding:
//   llm_cache          — write-once LLM outputs keyed by
//                        (item fingerprint, field name, prompt version)
//   source_watermarks  — per-source resume point for the ingester
//
// Cache entries are immutable; duplicate populates are tolerated with
// INSERT OR IGNORE (outputs for an identical key are equivalent, so
// whichever writer lands first wins). Eviction is LRU by last access,
// driven by the maintenance job.

use crate::atoms::error::EngineResult;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

pub struct CacheDb {
    conn: Mutex<Connection>,
}

impl CacheDb {
    /// Open (creating if absent) the cache database inside `dir`.
    pub fn open(dir: &Path) -> EngineResult<CacheDb> {
        std::fs::create_dir_all(dir)?;
        Self::from_connection(Connection::open(dir.join("cache.db"))?)
    }

    /// In-memory cache for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> EngineResult<CacheDb> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> EngineResult<CacheDb> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS llm_cache (
                 fingerprint    INTEGER NOT NULL,
                 field          TEXT NOT NULL,
                 prompt_version TEXT NOT NULL,
                 output         BLOB NOT NULL,
                 created_ms     INTEGER NOT NULL,
                 accessed_ms    INTEGER NOT NULL,
                 PRIMARY KEY (fingerprint, field, prompt_version)
             );
             CREATE INDEX IF NOT EXISTS idx_llm_cache_accessed
                 ON llm_cache (accessed_ms);
             CREATE TABLE IF NOT EXISTS source_watermarks (
                 source_id    TEXT PRIMARY KEY,
                 published_ms INTEGER NOT NULL
             );",
        )?;
        Ok(CacheDb { conn: Mutex::new(conn) })
    }

    // ── LLM cache ──────────────────────────────────────────────────────

    /// Look up a cached output, bumping its access time on hit.
    pub fn get(
        &self,
        fingerprint: u64,
        field: &str,
        prompt_version: &str,
        now_ms: u64,
    ) -> EngineResult<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let output: Option<Vec<u8>> = conn
            .query_row(
                "SELECT output FROM llm_cache
                 WHERE fingerprint = ?1 AND field = ?2 AND prompt_version = ?3",
                params![fingerprint as i64, field, prompt_version],
                |row| row.get(0),
            )
            .optional()?;
        if output.is_some() {
            conn.execute(
                "UPDATE llm_cache SET accessed_ms = ?4
                 WHERE fingerprint = ?1 AND field = ?2 AND prompt_version = ?3",
                params![fingerprint as i64, field, prompt_version, now_ms as i64],
            )?;
        }
        Ok(output)
    }

    /// Populate a cache entry. Idempotent: a concurrent writer that got
    /// there first keeps its row.
    pub fn put(
        &self,
        fingerprint: u64,
        field: &str,
        prompt_version: &str,
        output: &[u8],
        now_ms: u64,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO llm_cache
                 (fingerprint, field, prompt_version, output, created_ms, accessed_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![fingerprint as i64, field, prompt_version, output, now_ms as i64],
        )?;
        Ok(())
    }

    /// Evict least-recently-used entries beyond `max_entries`.
    /// Returns how many were removed.
    pub fn evict_lru(&self, max_entries: u64) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let total: i64 =
            conn.query_row("SELECT COUNT(*) FROM llm_cache", [], |row| row.get(0))?;
        let excess = total - max_entries as i64;
        if excess <= 0 {
            return Ok(0);
        }
        let removed = conn.execute(
            "DELETE FROM llm_cache WHERE rowid IN (
                 SELECT rowid FROM llm_cache ORDER BY accessed_ms ASC LIMIT ?1
             )",
            params![excess],
        )?;
        log::info!("[cache] evicted {} LRU entries", removed);
        Ok(removed)
    }

    // ── Source watermarks ──────────────────────────────────────────────

    /// Latest published_at (epoch ms) already ingested for a source.
    pub fn watermark(&self, source_id: &str) -> EngineResult<Option<u64>> {
        let conn = self.conn.lock();
        let ms: Option<i64> = conn
            .query_row(
                "SELECT published_ms FROM source_watermarks WHERE source_id = ?1",
                params![source_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ms.map(|v| v as u64))
    }

    /// Advance the watermark; never moves backwards.
    pub fn set_watermark(&self, source_id: &str, published_ms: u64) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO source_watermarks (source_id, published_ms) VALUES (?1, ?2)
             ON CONFLICT (source_id) DO UPDATE
                 SET published_ms = MAX(published_ms, excluded.published_ms)",
            params![source_id, published_ms as i64],
        )?;
        Ok(())
    }
}
