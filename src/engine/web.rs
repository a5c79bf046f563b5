// ── Zenfeed Engine: HTTP Context, Robots Cache, Article Extraction ─────────
// The process-wide outbound HTTP state: one reqwest client (UA "ZenFeed"),
// plus the per-host robots.txt cache. Constructed once at startup and
// passed to every ingester.
//
// Robots policy per host, resolved once (write-once cache):
//   HTTP 404            → host is unrestricted
//   HTTP 401/403        → host denies all crawling
//   other non-2xx       → upstream error, retried on a later tick
//   2xx                 → Disallow prefixes for our agent (or *)

use crate::atoms::constants::USER_AGENT;
use crate::atoms::error::{EngineError, EngineResult};
use log::{info, warn};
use parking_lot::RwLock;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, PartialEq)]
enum RobotsPolicy {
    Unrestricted,
    Denied,
    /// Disallowed path prefixes; an empty list allows everything.
    Rules(Vec<String>),
}

pub struct HttpContext {
    client: Client,
    robots: RwLock<HashMap<String, RobotsPolicy>>,
}

impl HttpContext {
    pub fn new(timeout: Duration) -> EngineResult<HttpContext> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(HttpContext { client, robots: RwLock::new(HashMap::new()) })
    }

    /// Fetch a URL as text (feed XML or article HTML). Non-2xx is upstream.
    pub async fn fetch_text(&self, url: &str) -> EngineResult<String> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::upstream(
                "fetch",
                format!("{} returned HTTP {}", url, status.as_u16()),
            ));
        }
        Ok(response.text().await?)
    }

    /// Crawl an article URL: robots check, fetch, extract markdown.
    pub async fn crawl(&self, link: &str) -> EngineResult<String> {
        let url = Url::parse(link)
            .map_err(|e| EngineError::upstream("crawl", format!("bad url {}: {}", link, e)))?;
        if !self.crawl_allowed(&url).await? {
            return Err(EngineError::upstream(
                "crawl",
                format!("robots.txt disallows {}", link),
            ));
        }
        let html = self.fetch_text(link).await?;
        Ok(html_to_markdown(&html))
    }

    /// Whether robots policy permits fetching this URL.
    pub async fn crawl_allowed(&self, url: &Url) -> EngineResult<bool> {
        let host = match url.host_str() {
            Some(h) => h.to_string(),
            None => return Ok(false),
        };
        let policy = self.robots_policy(url, &host).await?;
        Ok(match policy {
            RobotsPolicy::Unrestricted => true,
            RobotsPolicy::Denied => false,
            RobotsPolicy::Rules(disallowed) => {
                let path = url.path();
                !disallowed.iter().any(|prefix| path.starts_with(prefix.as_str()))
            }
        })
    }

    async fn robots_policy(&self, url: &Url, host: &str) -> EngineResult<RobotsPolicy> {
        if let Some(policy) = self.robots.read().get(host) {
            return Ok(policy.clone());
        }

        let robots_url = format!("{}://{}/robots.txt", url.scheme(), host);
        let response = self.client.get(&robots_url).send().await?;
        let policy = match response.status().as_u16() {
            404 => RobotsPolicy::Unrestricted,
            401 | 403 => {
                warn!("[web] {} denies robots.txt — host treated as disallowed", host);
                RobotsPolicy::Denied
            }
            s if (200..300).contains(&s) => {
                let text = response.text().await?;
                RobotsPolicy::Rules(parse_robots(&text, USER_AGENT))
            }
            s => {
                return Err(EngineError::upstream(
                    "robots",
                    format!("{} returned HTTP {}", robots_url, s),
                ))
            }
        };

        info!("[web] robots policy for {}: {:?}", host, policy);
        // Write-once: a racing resolver for the same host computed the same
        // answer, first insert wins.
        self.robots.write().entry(host.to_string()).or_insert(policy.clone());
        Ok(policy)
    }
}

// ── robots.txt parsing ─────────────────────────────────────────────────────

/// Extract the Disallow prefixes applying to `agent`: the group naming the
/// agent wins, otherwise the `*` group. Empty Disallow lines allow all.
pub fn parse_robots(text: &str, agent: &str) -> Vec<String> {
    struct Group {
        agents: Vec<String>,
        disallows: Vec<String>,
    }

    let mut groups: Vec<Group> = Vec::new();
    let mut in_agent_lines = false;
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else { continue };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "user-agent" => {
                if !in_agent_lines {
                    groups.push(Group { agents: Vec::new(), disallows: Vec::new() });
                    in_agent_lines = true;
                }
                if let Some(g) = groups.last_mut() {
                    g.agents.push(value.to_ascii_lowercase());
                }
            }
            "disallow" => {
                in_agent_lines = false;
                if let Some(g) = groups.last_mut() {
                    if !value.is_empty() {
                        g.disallows.push(value.to_string());
                    }
                }
            }
            _ => in_agent_lines = false,
        }
    }

    let agent = agent.to_ascii_lowercase();
    let named = groups.iter().find(|g| g.agents.iter().any(|a| *a == agent));
    let wildcard = groups.iter().find(|g| g.agents.iter().any(|a| a == "*"));
    named.or(wildcard).map(|g| g.disallows.clone()).unwrap_or_default()
}

// ── HTML → Markdown ────────────────────────────────────────────────────────

/// Reduce an article page to markdown-ish text: headings, paragraphs and
/// list items from <article>, <main> or <body>, whichever exists first.
/// Script, style and page chrome are skipped.
pub fn html_to_markdown(html: &str) -> String {
    let document = Html::parse_document(html);

    for selector in ["article", "main", "body"] {
        let sel = Selector::parse(selector).unwrap();
        if let Some(root) = document.select(&sel).next() {
            let mut out = String::new();
            render_element(&root, &mut out);
            let trimmed = collapse_blank_lines(&out);
            if !trimmed.trim().is_empty() {
                return trimmed;
            }
        }
    }
    String::new()
}

const SKIPPED_TAGS: &[&str] =
    &["script", "style", "nav", "header", "footer", "aside", "form", "noscript", "svg"];

fn render_element(element: &ElementRef, out: &mut String) {
    let tag = element.value().name();
    if SKIPPED_TAGS.contains(&tag) {
        return;
    }

    match tag {
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = tag[1..].parse::<usize>().unwrap_or(1);
            let text = inline_text(element);
            if !text.is_empty() {
                out.push_str(&format!("\n{} {}\n\n", "#".repeat(level), text));
            }
        }
        "p" | "blockquote" | "pre" => {
            let text = inline_text(element);
            if !text.is_empty() {
                out.push_str(&text);
                out.push_str("\n\n");
            }
        }
        "li" => {
            let text = inline_text(element);
            if !text.is_empty() {
                out.push_str(&format!("- {}\n", text));
            }
        }
        "ul" | "ol" => {
            for child in element.child_elements() {
                render_element(&child, out);
            }
            out.push('\n');
        }
        _ => {
            for child in element.child_elements() {
                render_element(&child, out);
            }
        }
    }
}

/// Flattened text of an element with whitespace normalized.
fn inline_text(element: &ElementRef) -> String {
    let mut text = String::new();
    for piece in element.text() {
        let trimmed = piece.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !text.is_empty() {
            text.push(' ');
        }
        text.push_str(trimmed);
    }
    text
}

fn collapse_blank_lines(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut blank_run = 0;
    for line in s.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn robots_wildcard_group() {
        let rules = parse_robots(
            "User-agent: *\nDisallow: /admin\nDisallow: /private/\n",
            "ZenFeed",
        );
        assert_eq!(rules, vec!["/admin", "/private/"]);
    }

    #[test]
    fn robots_named_group_wins_over_wildcard() {
        let text = "User-agent: *\nDisallow: /\n\nUser-agent: zenfeed\nDisallow: /drafts\n";
        assert_eq!(parse_robots(text, "ZenFeed"), vec!["/drafts"]);
    }

    #[test]
    fn robots_empty_disallow_allows_everything() {
        let rules = parse_robots("User-agent: *\nDisallow:\n", "ZenFeed");
        assert!(rules.is_empty());
    }

    #[test]
    fn robots_stacked_agents_share_one_group() {
        let text = "User-agent: googlebot\nUser-agent: zenfeed\nDisallow: /api\n";
        assert_eq!(parse_robots(text, "ZenFeed"), vec!["/api"]);
    }

    #[test]
    fn robots_comments_and_unknown_keys_are_ignored() {
        let text = "# welcome crawlers\nUser-agent: *\nCrawl-delay: 10\nDisallow: /tmp # scratch\n";
        assert_eq!(parse_robots(text, "ZenFeed"), vec!["/tmp"]);
    }

    #[test]
    fn robots_no_matching_group_means_unrestricted() {
        let text = "User-agent: googlebot\nDisallow: /\n";
        assert!(parse_robots(text, "ZenFeed").is_empty());
    }

    #[test]
    fn markdown_extracts_article_structure() {
        let html = r#"
            <html><head><style>p { color: red }</style></head>
            <body>
              <nav>Home | About</nav>
              <article>
                <h1>Rust 1.80</h1>
                <p>LazyCell is stable.</p>
                <ul><li>one</li><li>two</li></ul>
              </article>
              <footer>© 2026</footer>
            </body></html>"#;
        let md = html_to_markdown(html);
        assert!(md.contains("# Rust 1.80"));
        assert!(md.contains("LazyCell is stable."));
        assert!(md.contains("- one"));
        assert!(!md.contains("Home | About"));
        assert!(!md.contains("color: red"));
        assert!(!md.contains("© 2026"));
    }

    #[test]
    fn markdown_falls_back_to_body() {
        let html = "<html><body><p>just text</p></body></html>";
        assert_eq!(html_to_markdown(html), "just text");
    }

    #[test]
    fn markdown_of_empty_page_is_empty() {
        assert_eq!(html_to_markdown("<html><body></body></html>"), "");
    }
}
