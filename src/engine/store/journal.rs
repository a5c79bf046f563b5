// ── Zenfeed Store: Record Journal ──────────────────────────────────────────
// Append-only log of record metadata; the durability boundary of a block.
// Vector rows live in the matrix file and are only considered committed
// once the matching journal entry is on disk.
//
// Wire format, little-endian, one record:
//   u32  payload length
//   u64  id
//   u64  fingerprint
//   u64  time_ms
//   u64  published_ms
//   f32  score
//   u16  label count, then per label:
//        u16 name length, name bytes, u16 value length, value bytes

use crate::atoms::constants::JOURNAL_SYNC_EVERY;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::Labels;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// One journal record. The embedding is not here — it lives in the matrix
/// row addressed by `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub id: u64,
    pub fingerprint: u64,
    pub time_ms: u64,
    pub published_ms: u64,
    pub score: f32,
    pub labels: Labels,
}

// ── Encoding ───────────────────────────────────────────────────────────────

pub fn encode_entry(e: &JournalEntry) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64);
    payload.extend_from_slice(&e.id.to_le_bytes());
    payload.extend_from_slice(&e.fingerprint.to_le_bytes());
    payload.extend_from_slice(&e.time_ms.to_le_bytes());
    payload.extend_from_slice(&e.published_ms.to_le_bytes());
    payload.extend_from_slice(&e.score.to_le_bytes());
    payload.extend_from_slice(&(e.labels.len() as u16).to_le_bytes());
    for (name, value) in &e.labels {
        payload.extend_from_slice(&(name.len() as u16).to_le_bytes());
        payload.extend_from_slice(name.as_bytes());
        payload.extend_from_slice(&(value.len() as u16).to_le_bytes());
        payload.extend_from_slice(value.as_bytes());
    }

    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    out
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> EngineResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(EngineError::corruption("journal record truncated mid-field"));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u16(&mut self) -> EngineResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> EngineResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f32(&mut self) -> EngineResult<f32> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn str(&mut self) -> EngineResult<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| EngineError::corruption("journal label is not UTF-8"))
    }
}

/// Decode one payload (without the length prefix).
pub fn decode_entry(payload: &[u8]) -> EngineResult<JournalEntry> {
    let mut c = Cursor { buf: payload, pos: 0 };
    let id = c.u64()?;
    let fingerprint = c.u64()?;
    let time_ms = c.u64()?;
    let published_ms = c.u64()?;
    let score = c.f32()?;
    let count = c.u16()?;
    let mut labels = Labels::new();
    for _ in 0..count {
        let name = c.str()?;
        let value = c.str()?;
        labels.insert(name, value);
    }
    if c.pos != payload.len() {
        return Err(EngineError::corruption("journal record has trailing bytes"));
    }
    Ok(JournalEntry { id, fingerprint, time_ms, published_ms, score, labels })
}

// ── Journal file ───────────────────────────────────────────────────────────

/// Append-only journal handle. fsync is batched: every
/// `JOURNAL_SYNC_EVERY` appends and on every explicit `sync()`.
#[derive(Debug)]
pub struct Journal {
    file: File,
    appends_since_sync: u64,
}

impl Journal {
    /// Open (creating if absent) and replay. A partial record at the tail
    /// is a torn final write — it is truncated away. A record that decodes
    /// badly within bounds means the log is damaged earlier than the tail
    /// and is reported as corruption.
    pub fn open(path: &Path) -> EngineResult<(Journal, Vec<JournalEntry>)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset + 4 <= buf.len() {
            let len = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
            if offset + 4 + len > buf.len() {
                break; // torn tail
            }
            let entry = decode_entry(&buf[offset + 4..offset + 4 + len])?;
            if entry.id != entries.len() as u64 {
                return Err(EngineError::Corruption(format!(
                    "journal id gap: expected {}, found {}",
                    entries.len(),
                    entry.id
                )));
            }
            entries.push(entry);
            offset += 4 + len;
        }

        if offset < buf.len() {
            log::warn!(
                "[store] truncating {} torn byte(s) at journal tail of {}",
                buf.len() - offset,
                path.display()
            );
            file.set_len(offset as u64)?;
        }
        file.seek(SeekFrom::End(0))?;

        Ok((Journal { file, appends_since_sync: 0 }, entries))
    }

    pub fn append(&mut self, entry: &JournalEntry) -> EngineResult<()> {
        self.file.write_all(&encode_entry(entry))?;
        self.appends_since_sync += 1;
        if self.appends_since_sync >= JOURNAL_SYNC_EVERY {
            self.sync()?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> EngineResult<()> {
        if self.appends_since_sync > 0 {
            self.file.sync_data()?;
            self.appends_since_sync = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64) -> JournalEntry {
        let mut labels = Labels::new();
        labels.insert("title".into(), format!("post {}", id));
        labels.insert("source".into(), "hn".into());
        JournalEntry {
            id,
            fingerprint: 0xfeed_0000 + id,
            time_ms: 1_700_000_000_000 + id,
            published_ms: 1_699_999_000_000,
            score: 0.5,
            labels,
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let e = entry(7);
        let bytes = encode_entry(&e);
        let decoded = decode_entry(&bytes[4..]).unwrap();
        assert_eq!(decoded, e);
    }

    #[test]
    fn label_values_with_delimiters_survive_verbatim() {
        let mut labels = Labels::new();
        labels.insert("title".into(), "a=b,c|d\ne\u{1f}f".into());
        let e = JournalEntry {
            id: 0,
            fingerprint: 1,
            time_ms: 2,
            published_ms: 3,
            score: 0.0,
            labels,
        };
        let bytes = encode_entry(&e);
        let decoded = decode_entry(&bytes[4..]).unwrap();
        assert_eq!(decoded.labels["title"], "a=b,c|d\ne\u{1f}f");
    }

    #[test]
    fn replay_rebuilds_all_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.log");
        {
            let (mut j, existing) = Journal::open(&path).unwrap();
            assert!(existing.is_empty());
            for i in 0..10 {
                j.append(&entry(i)).unwrap();
            }
            j.sync().unwrap();
        }
        let (_, replayed) = Journal::open(&path).unwrap();
        assert_eq!(replayed.len(), 10);
        assert_eq!(replayed[3], entry(3));
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.log");
        {
            let (mut j, _) = Journal::open(&path).unwrap();
            j.append(&entry(0)).unwrap();
            j.append(&entry(1)).unwrap();
            j.sync().unwrap();
        }
        // Simulate a crash mid-append: a length prefix plus half a payload.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&200u32.to_le_bytes()).unwrap();
            f.write_all(&[0xab; 17]).unwrap();
        }
        let (mut j, replayed) = Journal::open(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        // The journal is appendable again right after truncation.
        j.append(&entry(2)).unwrap();
        j.sync().unwrap();
        let (_, replayed) = Journal::open(&path).unwrap();
        assert_eq!(replayed.len(), 3);
    }

    #[test]
    fn id_gap_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.log");
        {
            let (mut j, _) = Journal::open(&path).unwrap();
            j.append(&entry(0)).unwrap();
            j.append(&entry(5)).unwrap(); // wrong id
            j.sync().unwrap();
        }
        let err = Journal::open(&path).unwrap_err();
        assert_eq!(err.kind(), "corruption");
    }
}
