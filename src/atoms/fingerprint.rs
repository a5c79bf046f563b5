// ── Zenfeed Atoms: Fingerprinting ──────────────────────────────────────────
// Deterministic 64-bit identities via xxh3.
//
// The item fingerprint is the uniqueness key for the whole pipeline: dedup
// in the store, LLM cache addressing, and rule dispatch keys all derive
// from it. Changing the hashing scheme invalidates every existing store
// and cache — treat the field order and separators as a stable contract.

use xxhash_rust::xxh3::Xxh3;

/// Field separator inside hashed tuples. 0x1F is ASCII Unit Separator and
/// cannot appear in normalized fields.
const SEP: u8 = 0x1f;

/// Fingerprint of a feed item: hash of (source_id, link, normalized title).
pub fn item_fingerprint(source_id: &str, link: &str, title: &str) -> u64 {
    let mut h = Xxh3::new();
    h.update(source_id.as_bytes());
    h.update(&[SEP]);
    h.update(link.as_bytes());
    h.update(&[SEP]);
    h.update(normalize_title(title).as_bytes());
    h.digest()
}

/// Dispatch key for at-most-once rule notification:
/// hash of (rule_id, rule_version, record fingerprint).
pub fn dispatch_key(rule_id: &str, rule_version: &str, fingerprint: u64) -> u64 {
    let mut h = Xxh3::new();
    h.update(rule_id.as_bytes());
    h.update(&[SEP]);
    h.update(rule_version.as_bytes());
    h.update(&[SEP]);
    h.update(&fingerprint.to_le_bytes());
    h.digest()
}

/// Cache key for a query-text embedding: hash of (text, embedding model).
pub fn text_key(text: &str, model: &str) -> u64 {
    let mut h = Xxh3::new();
    h.update(text.as_bytes());
    h.update(&[SEP]);
    h.update(model.as_bytes());
    h.digest()
}

/// Title normalization: trim, lowercase, collapse internal whitespace.
/// Keeps fingerprints stable across feeds that reflow or re-case titles.
pub fn normalize_title(title: &str) -> String {
    title.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let a = item_fingerprint("hn", "https://example.com/post", "Hello World");
        let b = item_fingerprint("hn", "https://example.com/post", "Hello World");
        assert_eq!(a, b);
    }

    #[test]
    fn title_normalization_collapses_whitespace_and_case() {
        let a = item_fingerprint("hn", "https://example.com/p", "Hello   World");
        let b = item_fingerprint("hn", "https://example.com/p", "  hello world ");
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_sources_do_not_collide_via_concatenation() {
        // Separator prevents ("ab", "c") from hashing like ("a", "bc").
        let a = item_fingerprint("ab", "c", "t");
        let b = item_fingerprint("a", "bc", "t");
        assert_ne!(a, b);
    }

    #[test]
    fn dispatch_key_varies_with_rule_version() {
        let fp = item_fingerprint("hn", "https://example.com/p", "t");
        assert_ne!(dispatch_key("r1", "v1", fp), dispatch_key("r1", "v2", fp));
        assert_ne!(dispatch_key("r1", "v1", fp), dispatch_key("r2", "v1", fp));
    }

    #[test]
    fn text_key_varies_with_model() {
        assert_ne!(text_key("rust news", "embed-a"), text_key("rust news", "embed-b"));
    }
}
