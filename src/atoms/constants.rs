// ── Zenfeed Atoms: Constants ───────────────────────────────────────────────
// All named constants for the crate live here.
// Collecting them in one place eliminates magic strings and makes the
// on-disk contract auditable.

// ── On-disk block layout ───────────────────────────────────────────────────
// A block directory is data/blocks/<t_start_unix>/ containing exactly these
// three files. Renaming any of them breaks reopen of existing stores.
pub const JOURNAL_FILE: &str = "journal.log";
pub const VECTORS_FILE: &str = "vectors.bin";
pub const META_FILE: &str = "meta.json";

/// Subdirectory of the data dir holding block directories.
pub const BLOCKS_DIR: &str = "blocks";

/// Subdirectory of the data dir holding the embedded cache database.
pub const LLM_CACHE_DIR: &str = "llm_cache";

/// Quarantine prefix for block directories that failed journal replay.
pub const BROKEN_BLOCK_PREFIX: &str = "broken-";

// ── Journal durability ─────────────────────────────────────────────────────
/// Appends between fsyncs. The journal is also synced on seal and close.
pub const JOURNAL_SYNC_EVERY: u64 = 64;

/// Initial vector-matrix capacity (rows) for a fresh block. Grows by doubling.
pub const INITIAL_BLOCK_CAPACITY: u64 = 1024;

// ── Well-known label names ─────────────────────────────────────────────────
// Every enriched record carries these five; deployments may add extras.
pub const LABEL_SOURCE: &str = "source";
pub const LABEL_CATEGORY: &str = "category";
pub const LABEL_TITLE: &str = "title";
pub const LABEL_LINK: &str = "link";
pub const LABEL_CONTENT: &str = "content";
pub const LABEL_TAGS: &str = "tags";
pub const LABEL_SUMMARY: &str = "summary";

// ── Enrichment fields ──────────────────────────────────────────────────────
/// Cache field name for the embedding output. Field names from config must
/// not collide with it.
pub const EMBEDDING_FIELD: &str = "embedding";

// ── Outbound HTTP ──────────────────────────────────────────────────────────
pub const USER_AGENT: &str = "ZenFeed";

// ── Process exit codes ─────────────────────────────────────────────────────
pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG: i32 = 1;
pub const EXIT_CORRUPTION: i32 = 2;
pub const EXIT_FORCED_SHUTDOWN: i32 = 3;
