// ── Zenfeed Store ──────────────────────────────────────────────────────────
// The ordered set of blocks: routing of writes to the head, rotation by
// time window, retention GC, and fan-out of queries across overlapping
// blocks with cross-block fingerprint shadowing (newest wins).
//
// Concurrency: one writer (append/gc/close take the write lock), any
// number of readers. Readers hold the read lock for the duration of one
// query, which gives them a consistent snapshot of every block.

pub mod block;
pub mod journal;
pub mod vectors;

use self::block::Block;
use crate::atoms::constants::{BLOCKS_DIR, BROKEN_BLOCK_PREFIX};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::Clock;
use crate::atoms::types::{Query, QueryHit, Record};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub struct Store {
    dim: usize,
    window_ms: u64,
    retention_ms: u64,
    blocks_dir: PathBuf,
    clock: Arc<dyn Clock>,
    /// Blocks in ascending t_start order; the last one is the head unless
    /// it is sealed.
    blocks: RwLock<Vec<Block>>,
}

impl Store {
    /// Open the store under `data_dir`, reopening every surviving block.
    /// A block whose journal no longer replays is quarantined (directory
    /// renamed `broken-<t_start>`) and skipped.
    pub fn open(
        data_dir: &Path,
        dim: usize,
        window: Duration,
        retention: Duration,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Store> {
        let blocks_dir = data_dir.join(BLOCKS_DIR);
        std::fs::create_dir_all(&blocks_dir)?;

        let mut named: Vec<(u64, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&blocks_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Ok(t_start) = name.parse::<u64>() {
                named.push((t_start, entry.path()));
            } else if !name.starts_with(BROKEN_BLOCK_PREFIX) {
                log::warn!("[store] ignoring unexpected directory {}", name);
            }
        }
        named.sort_unstable_by_key(|(t, _)| *t);

        let mut blocks = Vec::with_capacity(named.len());
        for (t_start, path) in named {
            match Block::open(&path, dim) {
                Ok(b) => blocks.push(b),
                Err(EngineError::Corruption(msg)) => {
                    let quarantine =
                        blocks_dir.join(format!("{}{}", BROKEN_BLOCK_PREFIX, t_start));
                    log::error!(
                        "[store] quarantining corrupt block {}: {}",
                        path.display(),
                        msg
                    );
                    std::fs::rename(&path, &quarantine)?;
                }
                Err(e) => return Err(e),
            }
        }

        log::info!("[store] opened with {} block(s)", blocks.len());
        Ok(Store {
            dim,
            window_ms: window.as_millis() as u64,
            retention_ms: retention.as_millis() as u64,
            blocks_dir,
            clock,
            blocks: RwLock::new(blocks),
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    // ── Writes ─────────────────────────────────────────────────────────

    /// Append one record, rotating the head block first when its window
    /// has passed. The fingerprint is checked against every live block,
    /// newest first, so a duplicate never lands in a newer block.
    pub fn append(&self, record: &Record) -> EngineResult<()> {
        let now_ms = self.clock.now_ms();
        let mut blocks = self.blocks.write();

        for b in blocks.iter().rev() {
            if b.contains(record.fingerprint) {
                return Err(EngineError::Duplicate);
            }
        }

        let needs_new = match blocks.last() {
            None => true,
            Some(head) => head.is_sealed() || now_ms >= head.t_end_ms(),
        };
        if needs_new {
            if let Some(head) = blocks.last_mut() {
                head.seal()?;
            }
            blocks.push(Block::create(&self.blocks_dir, self.dim, now_ms, self.window_ms)?);
        }

        blocks.last_mut().unwrap().append(record)?;
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────────

    pub fn get_by_fingerprint(&self, fingerprint: u64) -> EngineResult<Record> {
        let blocks = self.blocks.read();
        blocks
            .iter()
            .rev()
            .find_map(|b| b.get_by_fingerprint(fingerprint))
            .ok_or(EngineError::NotFound)
    }

    pub fn contains(&self, fingerprint: u64) -> bool {
        let blocks = self.blocks.read();
        blocks.iter().rev().any(|b| b.contains(fingerprint))
    }

    /// Fan a query out to every block overlapping the time range, merge
    /// the per-block results into a global top-k.
    ///
    /// With a query vector: ranked by similarity descending, ties by time
    /// descending, threshold applied. Without: newest first. Either way a
    /// fingerprint appearing in several blocks yields only its newest
    /// record.
    pub fn query(&self, q: &Query) -> EngineResult<Vec<QueryHit>> {
        if let Some(v) = &q.vector {
            if v.len() != self.dim {
                return Err(EngineError::Internal(format!(
                    "query vector dimension mismatch: got {}, store is {}",
                    v.len(),
                    self.dim
                )));
            }
        }

        let blocks = self.blocks.read();
        // Keyed by fingerprint for cross-block shadowing.
        let mut best: HashMap<u64, QueryHit> = HashMap::new();

        for b in blocks.iter() {
            if !b.time_range().overlaps(&q.time_range) {
                continue;
            }
            let mut ids = b.scan(&q.filter);
            ids.retain(|&id| q.time_range.contains(b.time_of(id)));
            if ids.is_empty() {
                continue;
            }

            let scored: Vec<(u64, Option<f32>)> = match &q.vector {
                Some(v) => b
                    .knn(v, q.k, Some(&ids))
                    .into_iter()
                    .map(|(id, sim)| (id, Some(sim)))
                    .collect(),
                // No vector: the per-block top-k is simply the k newest.
                None => ids.into_iter().take(q.k).map(|id| (id, None)).collect(),
            };

            for (id, similarity) in scored {
                let record = b.record(id);
                match best.entry(record.fingerprint) {
                    std::collections::hash_map::Entry::Occupied(mut e) => {
                        if record.time_ms > e.get().record.time_ms {
                            e.insert(QueryHit { record, similarity });
                        }
                    }
                    std::collections::hash_map::Entry::Vacant(e) => {
                        e.insert(QueryHit { record, similarity });
                    }
                }
            }
        }
        drop(blocks);

        let mut hits: Vec<QueryHit> = best.into_values().collect();
        if q.vector.is_some() {
            if let Some(threshold) = q.threshold {
                hits.retain(|h| h.similarity.unwrap_or(0.0) >= threshold);
            }
            hits.sort_unstable_by(|a, b| {
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap_or(Ordering::Equal)
                    .then(b.record.time_ms.cmp(&a.record.time_ms))
            });
        } else {
            hits.sort_unstable_by(|a, b| b.record.time_ms.cmp(&a.record.time_ms));
        }
        hits.truncate(q.k);
        Ok(hits)
    }

    // ── Maintenance ────────────────────────────────────────────────────

    /// Drop every block whose retention has fully elapsed and unlink its
    /// files. Returns the number of blocks dropped.
    pub fn gc(&self) -> EngineResult<usize> {
        let now_ms = self.clock.now_ms();
        let mut blocks = self.blocks.write();

        let mut dropped = 0;
        let mut keep = Vec::with_capacity(blocks.len());
        for mut b in blocks.drain(..) {
            if b.t_end_ms() + self.retention_ms < now_ms {
                b.seal()?;
                let dir = b.dir().to_path_buf();
                drop(b);
                std::fs::remove_dir_all(&dir)?;
                log::info!("[store] retired block {}", dir.display());
                dropped += 1;
            } else {
                keep.push(b);
            }
        }
        *blocks = keep;
        Ok(dropped)
    }

    /// Seal the head, flush and persist every block's metadata.
    pub fn close(&self) -> EngineResult<()> {
        let mut blocks = self.blocks.write();
        for b in blocks.iter_mut() {
            b.seal()?;
        }
        log::info!("[store] closed ({} block(s))", blocks.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{LabelFilter, LabelMatch, Labels, TimeRange};
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

    struct ManualClock(AtomicU64);

    impl ManualClock {
        fn at(ms: u64) -> Arc<Self> {
            Arc::new(ManualClock(AtomicU64::new(ms)))
        }
        fn advance(&self, ms: u64) {
            self.0.fetch_add(ms, AtomicOrdering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            self.0.load(AtomicOrdering::SeqCst)
        }
    }

    const HOUR_MS: u64 = 3_600_000;
    const T0: u64 = 1_700_000_000_000;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn record(fp: u64, time_ms: u64, vector: Vec<f32>, l: &[(&str, &str)]) -> Record {
        Record {
            fingerprint: fp,
            time_ms,
            published_ms: time_ms,
            labels: labels(l),
            vector,
            score: 0.5,
        }
    }

    fn open_store(dir: &Path, clock: Arc<ManualClock>) -> Store {
        Store::open(
            dir,
            2,
            Duration::from_secs(3600),
            Duration::from_secs(2 * 3600),
            clock,
        )
        .unwrap()
    }

    fn all_time() -> TimeRange {
        TimeRange::new(0, u64::MAX)
    }

    fn plain_query(k: usize) -> Query {
        Query {
            time_range: all_time(),
            filter: LabelFilter::default(),
            vector: None,
            k,
            threshold: None,
        }
    }

    #[test]
    fn second_append_of_same_fingerprint_is_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(T0);
        let store = open_store(dir.path(), clock.clone());

        store.append(&record(1, T0, vec![1.0, 0.0], &[])).unwrap();
        clock.advance(1000);
        let err = store.append(&record(1, T0 + 1000, vec![1.0, 0.0], &[])).unwrap_err();
        assert!(err.is_duplicate());

        let hits = store.query(&plain_query(10)).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn duplicate_is_detected_across_rotated_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(T0);
        let store = open_store(dir.path(), clock.clone());

        store.append(&record(1, T0, vec![1.0, 0.0], &[])).unwrap();
        clock.advance(HOUR_MS + 1); // past the head window → next append rotates
        let err = store
            .append(&record(1, T0 + HOUR_MS + 1, vec![1.0, 0.0], &[]))
            .unwrap_err();
        assert!(err.is_duplicate());
    }

    #[test]
    fn window_rotation_creates_two_blocks_both_queryable() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(T0);
        let store = open_store(dir.path(), clock.clone());

        store.append(&record(1, T0, vec![1.0, 0.0], &[])).unwrap();
        clock.advance(HOUR_MS + 60_000);
        store
            .append(&record(2, T0 + HOUR_MS + 60_000, vec![0.0, 1.0], &[]))
            .unwrap();

        assert_eq!(store.blocks.read().len(), 2);
        assert!(store.blocks.read()[0].is_sealed());

        let hits = store.query(&plain_query(10)).unwrap();
        assert_eq!(hits.len(), 2);
        // Newest first.
        assert_eq!(hits[0].record.fingerprint, 2);
    }

    #[test]
    fn retention_gc_drops_expired_block_and_unlinks_files() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(T0);
        let store = open_store(dir.path(), clock.clone());

        store.append(&record(1, T0, vec![1.0, 0.0], &[])).unwrap();
        clock.advance(HOUR_MS + 60_000);
        store
            .append(&record(2, T0 + HOUR_MS + 60_000, vec![0.0, 1.0], &[]))
            .unwrap();

        // First block: t_end = T0 + 1h, retention 2h → expired after T0 + 3h.
        clock.advance(2 * HOUR_MS);
        assert_eq!(store.gc().unwrap(), 1);

        let hits = store.query(&plain_query(10)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.fingerprint, 2);

        let survivors: Vec<String> = std::fs::read_dir(dir.path().join(BLOCKS_DIR))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0], format!("{}", (T0 + HOUR_MS + 60_000) / 1000));
    }

    #[test]
    fn label_scan_without_vector_returns_every_match() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(T0);
        let store = open_store(dir.path(), clock.clone());

        store
            .append(&record(1, T0, vec![1.0, 0.0], &[("source", "hn")]))
            .unwrap();
        store
            .append(&record(2, T0 + 1, vec![0.0, 1.0], &[("source", "lobsters")]))
            .unwrap();

        let q = Query {
            time_range: all_time(),
            filter: LabelFilter::default()
                .with("source", LabelMatch::Eq { value: "hn".into() }),
            vector: None,
            k: 10,
            threshold: None,
        };
        let hits = store.query(&q).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.fingerprint, 1);
        assert!(hits[0].similarity.is_none());
    }

    #[test]
    fn vector_query_merges_global_top_k_across_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(T0);
        let store = open_store(dir.path(), clock.clone());

        store.append(&record(1, T0, vec![0.9, 0.0], &[])).unwrap();
        store.append(&record(2, T0 + 1, vec![0.7, 0.0], &[])).unwrap();
        clock.advance(HOUR_MS + 1);
        let t1 = T0 + HOUR_MS + 1;
        store.append(&record(3, t1, vec![0.8, 0.0], &[])).unwrap();

        let q = Query {
            time_range: all_time(),
            filter: LabelFilter::default(),
            vector: Some(vec![1.0, 0.0]),
            k: 2,
            threshold: None,
        };
        let hits = store.query(&q).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.fingerprint, 1); // 0.9
        assert_eq!(hits[1].record.fingerprint, 3); // 0.8, from the newer block
    }

    #[test]
    fn threshold_filters_low_similarity() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(T0);
        let store = open_store(dir.path(), clock.clone());

        store.append(&record(1, T0, vec![0.9, 0.0], &[])).unwrap();
        store.append(&record(2, T0 + 1, vec![0.0, 0.0], &[])).unwrap(); // zero vector

        let q = Query {
            time_range: all_time(),
            filter: LabelFilter::default(),
            vector: Some(vec![1.0, 0.0]),
            k: 10,
            threshold: Some(0.5),
        };
        let hits = store.query(&q).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.fingerprint, 1);
    }

    #[test]
    fn time_range_restricts_results() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(T0);
        let store = open_store(dir.path(), clock.clone());

        store.append(&record(1, T0, vec![1.0, 0.0], &[])).unwrap();
        store.append(&record(2, T0 + 10_000, vec![1.0, 0.0], &[])).unwrap();

        let q = Query {
            time_range: TimeRange::new(T0 + 5_000, T0 + 20_000),
            filter: LabelFilter::default(),
            vector: None,
            k: 10,
            threshold: None,
        };
        let hits = store.query(&q).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.fingerprint, 2);
    }

    #[test]
    fn reopen_preserves_records_bitwise() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(T0);
        let r = record(42, T0, vec![0.6, 0.8], &[("title", "x"), ("content", "a|b=c")]);
        {
            let store = open_store(dir.path(), clock.clone());
            store.append(&r).unwrap();
            store.close().unwrap();
        }
        let store = open_store(dir.path(), clock.clone());
        let got = store.get_by_fingerprint(42).unwrap();
        assert_eq!(got, r);
    }

    #[test]
    fn append_after_reopen_starts_a_new_block() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(T0);
        {
            let store = open_store(dir.path(), clock.clone());
            store.append(&record(1, T0, vec![1.0, 0.0], &[])).unwrap();
            store.close().unwrap(); // seals the head
        }
        clock.advance(1000);
        let store = open_store(dir.path(), clock.clone());
        store.append(&record(2, T0 + 1000, vec![0.0, 1.0], &[])).unwrap();
        assert_eq!(store.blocks.read().len(), 2);
        assert_eq!(store.query(&plain_query(10)).unwrap().len(), 2);
    }

    #[test]
    fn shadowed_fingerprint_returns_only_newest() {
        let dir = tempfile::tempdir().unwrap();
        let blocks_dir = dir.path().join(BLOCKS_DIR);
        std::fs::create_dir_all(&blocks_dir).unwrap();
        // Build two blocks that both contain fingerprint 7 — possible on
        // disk when an operator restores an old block from backup.
        {
            let mut b = Block::create(&blocks_dir, 2, T0, HOUR_MS).unwrap();
            b.append(&record(7, T0, vec![1.0, 0.0], &[("rev", "old")])).unwrap();
            b.seal().unwrap();
        }
        {
            let mut b = Block::create(&blocks_dir, 2, T0 + HOUR_MS, HOUR_MS).unwrap();
            b.append(&record(7, T0 + HOUR_MS, vec![0.0, 1.0], &[("rev", "new")]))
                .unwrap();
            b.seal().unwrap();
        }

        let clock = ManualClock::at(T0 + HOUR_MS);
        let store = open_store(dir.path(), clock);
        let hits = store.query(&plain_query(10)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.labels["rev"], "new");
    }

    #[test]
    fn corrupt_block_is_quarantined_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at(T0);
        {
            let store = open_store(dir.path(), clock.clone());
            store.append(&record(1, T0, vec![1.0, 0.0], &[])).unwrap();
            store.close().unwrap();
        }
        // Damage the journal beyond tail truncation: a fully-present record
        // whose id breaks the sequence.
        let block_dir = dir.path().join(BLOCKS_DIR).join(format!("{}", T0 / 1000));
        let journal_path = block_dir.join("journal.log");
        let mut bytes = std::fs::read(&journal_path).unwrap();
        bytes[4] ^= 0xff; // first payload byte is the low byte of id 0
        std::fs::write(&journal_path, &bytes).unwrap();

        let store = open_store(dir.path(), clock);
        assert_eq!(store.blocks.read().len(), 0);
        let names: Vec<String> = std::fs::read_dir(dir.path().join(BLOCKS_DIR))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.starts_with(BROKEN_BLOCK_PREFIX)));
    }
}
