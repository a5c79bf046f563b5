// ── Zenfeed Store: Block ───────────────────────────────────────────────────
// One time-window shard. Owns three files in its directory:
//   journal.log — append-only record metadata (durability boundary)
//   vectors.bin — mmap'd row-major float32 embedding matrix
//   meta.json   — dimensions, capacity, next_id, window, sealed flag
// plus two in-memory indexes rebuilt from the journal on open: the primary
// map (fingerprint → id) and the inverted index ((label, value) → ids).
//
// A block is mutated only by the store's single writer. After seal() it
// serves reads until retention expiry unlinks the directory.

use crate::atoms::constants::{INITIAL_BLOCK_CAPACITY, JOURNAL_FILE, META_FILE, VECTORS_FILE};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{LabelFilter, LabelMatch, Labels, Record, TimeRange};
use crate::engine::store::journal::{Journal, JournalEntry};
use crate::engine::store::vectors::{dot, VectorFile};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::path::{Path, PathBuf};

// ── Metadata ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMeta {
    pub dim: u32,
    pub capacity: u64,
    pub next_id: u64,
    pub t_start_ms: u64,
    pub t_end_ms: u64,
    pub sealed: bool,
}

/// Per-record metadata held in memory, indexed by local id.
#[derive(Debug, Clone)]
struct RecordMeta {
    fingerprint: u64,
    time_ms: u64,
    published_ms: u64,
    score: f32,
    labels: Labels,
}

// ── Block ──────────────────────────────────────────────────────────────────

pub struct Block {
    dir: PathBuf,
    meta: BlockMeta,
    journal: Journal,
    vectors: VectorFile,
    primary: HashMap<u64, u64>,
    inverted: HashMap<(String, String), Vec<u64>>,
    records: Vec<RecordMeta>,
}

impl Block {
    /// Create a fresh block directory under `parent`, named by its start
    /// second.
    pub fn create(
        parent: &Path,
        dim: usize,
        t_start_ms: u64,
        window_ms: u64,
    ) -> EngineResult<Block> {
        let dir = parent.join(format!("{}", t_start_ms / 1000));
        std::fs::create_dir_all(&dir)?;

        let meta = BlockMeta {
            dim: dim as u32,
            capacity: INITIAL_BLOCK_CAPACITY,
            next_id: 0,
            t_start_ms,
            t_end_ms: t_start_ms + window_ms,
            sealed: false,
        };
        let (journal, _) = Journal::open(&dir.join(JOURNAL_FILE))?;
        let vectors = VectorFile::open(&dir.join(VECTORS_FILE), dim, meta.capacity)?;

        let block = Block {
            dir,
            meta,
            journal,
            vectors,
            primary: HashMap::new(),
            inverted: HashMap::new(),
            records: Vec::new(),
        };
        block.write_meta()?;
        log::info!(
            "[store] created block {} (window {}s)",
            block.dir.display(),
            window_ms / 1000
        );
        Ok(block)
    }

    /// Reopen an existing block directory, replaying the journal to rebuild
    /// the in-memory indexes. The journal, not meta.json, is the record of
    /// truth for next_id; matrix rows past the last journal entry are
    /// garbage and get overwritten on the next append.
    pub fn open(dir: &Path, dim: usize) -> EngineResult<Block> {
        let meta_bytes = std::fs::read(dir.join(META_FILE))
            .map_err(|e| EngineError::Corruption(format!("meta.json unreadable: {}", e)))?;
        let mut meta: BlockMeta = serde_json::from_slice(&meta_bytes)
            .map_err(|e| EngineError::Corruption(format!("meta.json invalid: {}", e)))?;
        if meta.dim as usize != dim {
            return Err(EngineError::Config(format!(
                "block {} has dimension {}, deployment is {}",
                dir.display(),
                meta.dim,
                dim
            )));
        }

        let (journal, entries) = Journal::open(&dir.join(JOURNAL_FILE))?;
        meta.next_id = entries.len() as u64;
        meta.capacity = meta.capacity.max(meta.next_id).max(INITIAL_BLOCK_CAPACITY);
        let vectors = VectorFile::open(&dir.join(VECTORS_FILE), dim, meta.capacity)?;
        meta.capacity = vectors.capacity();

        let mut block = Block {
            dir: dir.to_path_buf(),
            meta,
            journal,
            vectors,
            primary: HashMap::with_capacity(entries.len()),
            inverted: HashMap::new(),
            records: Vec::with_capacity(entries.len()),
        };
        for entry in entries {
            block.index_entry(&entry);
            block.records.push(RecordMeta {
                fingerprint: entry.fingerprint,
                time_ms: entry.time_ms,
                published_ms: entry.published_ms,
                score: entry.score,
                labels: entry.labels,
            });
        }
        Ok(block)
    }

    fn index_entry(&mut self, entry: &JournalEntry) {
        self.primary.insert(entry.fingerprint, entry.id);
        for (name, value) in &entry.labels {
            if value.is_empty() {
                continue; // empty means absent
            }
            self.inverted
                .entry((name.clone(), value.clone()))
                .or_default()
                .push(entry.id);
        }
    }

    // ── Accessors ──────────────────────────────────────────────────────

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.meta.t_start_ms, self.meta.t_end_ms)
    }

    pub fn t_end_ms(&self) -> u64 {
        self.meta.t_end_ms
    }

    pub fn is_sealed(&self) -> bool {
        self.meta.sealed
    }

    pub fn len(&self) -> u64 {
        self.meta.next_id
    }

    pub fn is_empty(&self) -> bool {
        self.meta.next_id == 0
    }

    pub fn contains(&self, fingerprint: u64) -> bool {
        self.primary.contains_key(&fingerprint)
    }

    // ── Append ─────────────────────────────────────────────────────────

    /// Append one record, assigning the next local id. The vector row is
    /// written before the journal entry; the journal commit is what makes
    /// the record visible.
    pub fn append(&mut self, record: &Record) -> EngineResult<u64> {
        if self.meta.sealed {
            return Err(EngineError::Sealed);
        }
        if self.primary.contains_key(&record.fingerprint) {
            return Err(EngineError::Duplicate);
        }
        if record.vector.len() != self.meta.dim as usize {
            return Err(EngineError::Internal(format!(
                "vector dimension mismatch: got {}, block is {}",
                record.vector.len(),
                self.meta.dim
            )));
        }

        let id = self.meta.next_id;
        self.vectors.write_row(id, &record.vector)?;
        self.meta.capacity = self.vectors.capacity();

        let entry = JournalEntry {
            id,
            fingerprint: record.fingerprint,
            time_ms: record.time_ms,
            published_ms: record.published_ms,
            score: record.score,
            labels: record.labels.clone(),
        };
        self.journal.append(&entry)?;
        self.index_entry(&entry);
        self.records.push(RecordMeta {
            fingerprint: record.fingerprint,
            time_ms: record.time_ms,
            published_ms: record.published_ms,
            score: record.score,
            labels: entry.labels,
        });
        self.meta.next_id = id + 1;
        Ok(id)
    }

    // ── Reads ──────────────────────────────────────────────────────────

    pub fn get_by_fingerprint(&self, fingerprint: u64) -> Option<Record> {
        self.primary.get(&fingerprint).map(|&id| self.record(id))
    }

    /// Materialize record `id` (metadata + matrix row).
    pub fn record(&self, id: u64) -> Record {
        let meta = &self.records[id as usize];
        Record {
            fingerprint: meta.fingerprint,
            time_ms: meta.time_ms,
            published_ms: meta.published_ms,
            labels: meta.labels.clone(),
            vector: self.vectors.row(id).to_vec(),
            score: meta.score,
        }
    }

    pub fn time_of(&self, id: u64) -> u64 {
        self.records[id as usize].time_ms
    }

    /// Resolve a label filter to candidate ids, descending (newest first).
    ///
    /// Positive matchers (eq, in, prefix) drive posting-list lookups and
    /// the intersection starts from the shortest list; not-eq can only
    /// post-filter. A filter with no positive matcher scans every record.
    pub fn scan(&self, filter: &LabelFilter) -> Vec<u64> {
        let mut lists: Vec<Vec<u64>> = Vec::new();
        let mut negations: Vec<(&String, &LabelMatch)> = Vec::new();

        for (name, m) in &filter.clauses {
            if !m.is_positive() {
                negations.push((name, m));
                continue;
            }
            let list = match m {
                LabelMatch::Eq { value } => self
                    .inverted
                    .get(&(name.clone(), value.clone()))
                    .cloned()
                    .unwrap_or_default(),
                LabelMatch::In { values } => {
                    let mut ids: Vec<u64> = values
                        .iter()
                        .filter_map(|v| self.inverted.get(&(name.clone(), v.clone())))
                        .flatten()
                        .copied()
                        .collect();
                    ids.sort_unstable();
                    ids.dedup();
                    ids
                }
                LabelMatch::Prefix { value: prefix } => {
                    // No ordered index over values: walk all postings under
                    // the name.
                    let mut ids: Vec<u64> = self
                        .inverted
                        .iter()
                        .filter(|((n, v), _)| n == name && v.starts_with(prefix.as_str()))
                        .flat_map(|(_, ids)| ids)
                        .copied()
                        .collect();
                    ids.sort_unstable();
                    ids.dedup();
                    ids
                }
                LabelMatch::NotEq { .. } => unreachable!(),
            };
            if list.is_empty() {
                return Vec::new();
            }
            lists.push(list);
        }

        let mut candidates: Vec<u64> = if lists.is_empty() {
            (0..self.meta.next_id).collect()
        } else {
            lists.sort_by_key(Vec::len);
            let (driver, rest) = lists.split_first().unwrap();
            driver
                .iter()
                .copied()
                .filter(|id| rest.iter().all(|l| l.binary_search(id).is_ok()))
                .collect()
        };

        if !negations.is_empty() {
            candidates.retain(|&id| {
                let labels = &self.records[id as usize].labels;
                negations.iter().all(|(name, m)| {
                    let value = labels
                        .get(name.as_str())
                        .map(String::as_str)
                        .filter(|v| !v.is_empty());
                    m.matches(value)
                })
            });
        }

        candidates.sort_unstable_by(|a, b| b.cmp(a));
        candidates
    }

    /// Brute-force k-nearest by dot product over `candidates` (or every
    /// record when `None`). Returns (id, similarity) sorted by similarity
    /// descending, ties by id descending (newer first).
    pub fn knn(&self, query: &[f32], k: usize, candidates: Option<&[u64]>) -> Vec<(u64, f32)> {
        if k == 0 || self.meta.next_id == 0 {
            return Vec::new();
        }

        // Min-heap of the current top k: the root is the worst hit, so each
        // better candidate evicts it in O(log k).
        let mut heap: BinaryHeap<std::cmp::Reverse<Hit>> = BinaryHeap::with_capacity(k + 1);
        let mut consider = |id: u64| {
            let sim = dot(query, self.vectors.row(id));
            heap.push(std::cmp::Reverse(Hit { sim, id }));
            if heap.len() > k {
                heap.pop();
            }
        };

        match candidates {
            Some(ids) => ids.iter().copied().for_each(&mut consider),
            None => (0..self.meta.next_id).for_each(&mut consider),
        }

        let mut hits: Vec<(u64, f32)> =
            heap.into_iter().map(|std::cmp::Reverse(h)| (h.id, h.sim)).collect();
        hits.sort_unstable_by(|a, b| {
            b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(b.0.cmp(&a.0))
        });
        hits
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Mark read-only and flush everything. Idempotent.
    pub fn seal(&mut self) -> EngineResult<()> {
        if self.meta.sealed {
            return Ok(());
        }
        self.journal.sync()?;
        self.vectors.flush()?;
        self.meta.sealed = true;
        self.write_meta()?;
        log::info!("[store] sealed block {} ({} records)", self.dir.display(), self.len());
        Ok(())
    }

    /// Flush without sealing; used at clean shutdown before the head block
    /// is sealed by the store.
    pub fn flush(&mut self) -> EngineResult<()> {
        self.journal.sync()?;
        self.vectors.flush()?;
        self.write_meta()
    }

    fn write_meta(&self) -> EngineResult<()> {
        let bytes = serde_json::to_vec_pretty(&self.meta)?;
        std::fs::write(self.dir.join(META_FILE), bytes)?;
        Ok(())
    }
}

/// Heap entry ordered by (similarity, id) ascending, so the heap root under
/// `Reverse` is the lowest-similarity, oldest hit — the one to evict.
struct Hit {
    sim: f32,
    id: u64,
}

impl PartialEq for Hit {
    fn eq(&self, other: &Self) -> bool {
        self.sim == other.sim && self.id == other.id
    }
}
impl Eq for Hit {}

impl PartialOrd for Hit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Hit {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sim
            .partial_cmp(&other.sim)
            .unwrap_or(Ordering::Equal)
            .then(self.id.cmp(&other.id))
    }
}
