// ── Zenfeed Engine: Feed Parsing ───────────────────────────────────────────
// Tolerant RSS 2.0 / Atom parser over quick-xml events. Produces the
// neutral FeedDocument the ingester consumes; no network here.
//
// Duplicated links within one document: first entry wins, later ones are
// dropped during parsing so the ingester never sees them.

use crate::atoms::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashSet;
use url::Url;

#[derive(Debug, Default)]
pub struct FeedDocument {
    pub title: String,
    pub entries: Vec<FeedEntry>,
}

#[derive(Debug, Default, Clone)]
pub struct FeedEntry {
    pub title: String,
    /// Normalized canonical URL.
    pub link: String,
    pub published: Option<DateTime<Utc>>,
    /// Entry body as shipped in the feed (HTML or text).
    pub summary: String,
}

/// Parse an RSS 2.0 or Atom document.
pub fn parse_feed(xml: &str) -> EngineResult<FeedDocument> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut doc = FeedDocument::default();
    let mut seen_links: HashSet<String> = HashSet::new();

    let mut in_entry = false;
    let mut entry = FeedEntry::default();
    let mut current_tag: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let tag = local_name(e.name().as_ref());
                match tag.as_str() {
                    "item" | "entry" => {
                        in_entry = true;
                        entry = FeedEntry::default();
                        current_tag = None;
                    }
                    "link" if in_entry => {
                        // Atom link carries its URL in href; RSS puts it in
                        // the element text, handled below.
                        if let Some(href) = attr(&e, b"href") {
                            let rel = attr(&e, b"rel");
                            if rel.as_deref().is_none() || rel.as_deref() == Some("alternate") {
                                entry.link = href;
                            }
                        }
                        current_tag = Some(tag);
                    }
                    _ => current_tag = Some(tag),
                }
            }
            Ok(Event::Empty(e)) => {
                let tag = local_name(e.name().as_ref());
                if in_entry && tag == "link" {
                    if let Some(href) = attr(&e, b"href") {
                        let rel = attr(&e, b"rel");
                        if rel.as_deref().is_none() || rel.as_deref() == Some("alternate") {
                            entry.link = href;
                        }
                    }
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| EngineError::upstream("feed", format!("bad entity: {}", e)))?
                    .into_owned();
                apply_text(&mut doc, &mut entry, in_entry, current_tag.as_deref(), &text);
            }
            Ok(Event::CData(t)) => {
                let text = String::from_utf8_lossy(&t).into_owned();
                apply_text(&mut doc, &mut entry, in_entry, current_tag.as_deref(), &text);
            }
            Ok(Event::End(e)) => {
                let tag = local_name(e.name().as_ref());
                if tag == "item" || tag == "entry" {
                    in_entry = false;
                    finish_entry(&mut doc, &mut seen_links, std::mem::take(&mut entry));
                }
                current_tag = None;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(EngineError::upstream("feed", format!("malformed XML: {}", e)));
            }
        }
    }

    Ok(doc)
}

fn apply_text(
    doc: &mut FeedDocument,
    entry: &mut FeedEntry,
    in_entry: bool,
    current_tag: Option<&str>,
    text: &str,
) {
    let Some(tag) = current_tag else { return };
    if !in_entry {
        if tag == "title" && doc.title.is_empty() {
            doc.title = text.to_string();
        }
        return;
    }
    match tag {
        "title" => append_text(&mut entry.title, text),
        "link" if entry.link.is_empty() => entry.link = text.to_string(),
        "pubdate" | "published" | "updated" | "date" => {
            if entry.published.is_none() {
                entry.published = parse_date(text);
            }
        }
        // RSS description / content:encoded, Atom summary / content. The
        // longer body wins when a feed ships both.
        "description" | "encoded" | "summary" | "content" => {
            if text.len() > entry.summary.len() {
                entry.summary = text.to_string();
            }
        }
        _ => {}
    }
}

fn finish_entry(doc: &mut FeedDocument, seen: &mut HashSet<String>, mut entry: FeedEntry) {
    if entry.link.is_empty() {
        log::warn!("[feed] dropping entry without link: {:?}", entry.title);
        return;
    }
    entry.link = normalize_link(&entry.link);
    // First wins within one fetch.
    if !seen.insert(entry.link.clone()) {
        return;
    }
    doc.entries.push(entry);
}

/// Accumulate a text node; adjacent nodes of one element join with a space.
fn append_text(dst: &mut String, text: &str) {
    if dst.is_empty() {
        *dst = text.to_string();
    } else {
        dst.push(' ');
        dst.push_str(text);
    }
}

/// Lowercased element name without namespace prefix.
fn local_name(name: &[u8]) -> String {
    let s = String::from_utf8_lossy(name);
    s.rsplit(':').next().unwrap_or(&s).to_ascii_lowercase()
}

fn attr(e: &quick_xml::events::BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// RFC 2822 (RSS) first, then RFC 3339 (Atom).
fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(text)
        .or_else(|_| DateTime::parse_from_rfc3339(text))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Canonicalize an entry URL: parse, drop the fragment, trim the trailing
/// slash. Unparseable URLs are kept verbatim (the fingerprint still works).
pub fn normalize_link(link: &str) -> String {
    match Url::parse(link.trim()) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string().trim_end_matches('/').to_string()
        }
        Err(_) => link.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0"?>
        <rss version="2.0"><channel>
          <title>Example Feed</title>
          <item>
            <title>First &amp; foremost</title>
            <link>https://example.com/a#comments</link>
            <pubDate>Mon, 01 Jun 2026 10:00:00 GMT</pubDate>
            <description><![CDATA[<p>Body A</p>]]></description>
          </item>
          <item>
            <title>Second</title>
            <link>https://example.com/b</link>
            <pubDate>Mon, 01 Jun 2026 11:00:00 GMT</pubDate>
            <description>Body B</description>
          </item>
        </channel></rss>"#;

    const ATOM: &str = r#"<?xml version="1.0"?>
        <feed xmlns="http://www.w3.org/2005/Atom">
          <title>Atom Feed</title>
          <entry>
            <title>Entry one</title>
            <link rel="alternate" href="https://example.org/posts/1/"/>
            <published>2026-06-01T10:00:00Z</published>
            <summary>short</summary>
            <content type="html">much longer body text here</content>
          </entry>
        </feed>"#;

    #[test]
    fn parses_rss_items() {
        let doc = parse_feed(RSS).unwrap();
        assert_eq!(doc.title, "Example Feed");
        assert_eq!(doc.entries.len(), 2);

        let first = &doc.entries[0];
        assert_eq!(first.title, "First & foremost");
        assert_eq!(first.link, "https://example.com/a"); // fragment dropped
        assert_eq!(first.summary, "<p>Body A</p>");
        let published = first.published.unwrap();
        assert_eq!(published.timestamp(), 1_780_308_000);
    }

    #[test]
    fn parses_atom_entries() {
        let doc = parse_feed(ATOM).unwrap();
        assert_eq!(doc.title, "Atom Feed");
        assert_eq!(doc.entries.len(), 1);

        let e = &doc.entries[0];
        assert_eq!(e.link, "https://example.org/posts/1");
        assert!(e.published.is_some());
        // The longer of summary/content wins.
        assert_eq!(e.summary, "much longer body text here");
    }

    #[test]
    fn empty_feed_parses_to_no_entries() {
        let doc = parse_feed(r#"<rss version="2.0"><channel><title>Empty</title></channel></rss>"#)
            .unwrap();
        assert!(doc.entries.is_empty());
    }

    #[test]
    fn duplicate_links_first_wins() {
        let xml = r#"<rss version="2.0"><channel>
            <item><title>keep</title><link>https://example.com/x</link></item>
            <item><title>drop</title><link>https://example.com/x/</link></item>
        </channel></rss>"#;
        let doc = parse_feed(xml).unwrap();
        assert_eq!(doc.entries.len(), 1);
        assert_eq!(doc.entries[0].title, "keep");
    }

    #[test]
    fn entry_without_link_is_dropped() {
        let xml = r#"<rss version="2.0"><channel>
            <item><title>linkless</title></item>
        </channel></rss>"#;
        let doc = parse_feed(xml).unwrap();
        assert!(doc.entries.is_empty());
    }

    #[test]
    fn malformed_xml_is_upstream_error() {
        let err = parse_feed("<rss><channel><item></chan").unwrap_err();
        assert_eq!(err.kind(), "upstream");
    }

    #[test]
    fn missing_date_is_none() {
        let xml = r#"<rss version="2.0"><channel>
            <item><title>t</title><link>https://example.com/x</link></item>
        </channel></rss>"#;
        let doc = parse_feed(xml).unwrap();
        assert!(doc.entries[0].published.is_none());
    }

    #[test]
    fn normalize_link_variants() {
        assert_eq!(
            normalize_link("https://example.com/a/#frag"),
            "https://example.com/a"
        );
        assert_eq!(normalize_link("https://example.com/a?page=2"), "https://example.com/a?page=2");
        assert_eq!(normalize_link("not a url"), "not a url");
    }
}
