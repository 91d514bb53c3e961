use crate::config::ToolsConfig;
use crate::errors::{OxiclawError, OxiclawResult};
use crate::utils::subprocess::run_command;
use scraper::{Html, Selector};
use std::time::Duration;
use tracing::debug;

/// Cleaned content above this size is truncated and flagged.
pub const MAX_CONTENT_BYTES: usize = 4 * 1024 * 1024;

const FETCH_TIMEOUT_SECS: u64 = 30;
const TRANSCRIPT_MAX_OUTPUT: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Extracted {
    pub title: String,
    pub content: String,
}

pub struct Extractor {
    http: reqwest::Client,
    transcript_bin: String,
    transcript_timeout: Duration,
}

impl Extractor {
    pub fn new(tools: &ToolsConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .user_agent(concat!("oxiclaw/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            transcript_bin: tools.transcript_bin.clone(),
            transcript_timeout: Duration::from_secs(tools.transcript_timeout_secs),
        })
    }

    /// Dispatch to the extractor for a detected source type.
    pub async fn extract(&self, source_type: &str, url: &str) -> OxiclawResult<Extracted> {
        match source_type {
            "video" => self.extract_video(url).await,
            "pdf" => self.extract_pdf(url).await,
            // Tweets render as regular pages for our purposes
            _ => self.extract_article(url).await,
        }
    }

    async fn extract_article(&self, url: &str) -> OxiclawResult<Extracted> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| OxiclawError::Extraction(format!("fetch {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(OxiclawError::Extraction(format!(
                "fetch {url}: HTTP {}",
                response.status()
            )));
        }
        let html = response
            .text()
            .await
            .map_err(|e| OxiclawError::Extraction(format!("read body of {url}: {e}")))?;

        let extracted = parse_article(&html, url);
        if extracted.content.is_empty() {
            return Err(OxiclawError::Extraction(format!(
                "no readable text in {url}"
            )));
        }
        Ok(extracted)
    }

    async fn extract_pdf(&self, url: &str) -> OxiclawResult<Extracted> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| OxiclawError::Extraction(format!("fetch {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(OxiclawError::Extraction(format!(
                "fetch {url}: HTTP {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| OxiclawError::Extraction(format!("read body of {url}: {e}")))?;

        // PDF parsing is CPU-bound; keep it off the async runtime.
        let content = tokio::task::spawn_blocking(move || {
            pdf_extract::extract_text_from_mem(&bytes)
        })
        .await
        .map_err(|e| OxiclawError::Extraction(format!("pdf task failed: {e}")))?
        .map_err(|e| OxiclawError::Extraction(format!("pdf parse: {e}")))?;

        if content.trim().is_empty() {
            return Err(OxiclawError::Extraction(format!("no text layer in {url}")));
        }
        let title = url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(url)
            .to_string();
        Ok(Extracted { title, content })
    }

    async fn extract_video(&self, url: &str) -> OxiclawResult<Extracted> {
        let output = run_command(
            &self.transcript_bin,
            &[url],
            None,
            self.transcript_timeout,
            TRANSCRIPT_MAX_OUTPUT,
        )
        .await
        .map_err(|e| OxiclawError::Extraction(format!("transcript CLI: {e}")))?;

        if output.exit_code != Some(0) {
            return Err(OxiclawError::Extraction(format!(
                "transcript CLI exited {:?}: {}",
                output.exit_code,
                output.stderr.lines().next().unwrap_or("")
            )));
        }
        if output.stdout.trim().is_empty() {
            return Err(OxiclawError::Extraction(format!(
                "no transcript available for {url}"
            )));
        }
        debug!("transcript fetched for {} ({} bytes)", url, output.stdout.len());
        Ok(Extracted {
            title: format!("Transcript: {url}"),
            content: output.stdout,
        })
    }
}

/// Pull a title and readable text out of an HTML document.
fn parse_article(html: &str, url: &str) -> Extracted {
    let document = Html::parse_document(html);

    let title_sel = Selector::parse("title").expect("static selector");
    let title = document
        .select(&title_sel)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| url.to_string());

    // Prefer structured content containers; fall back to all paragraphs.
    let mut parts: Vec<String> = Vec::new();
    for selector in ["article p", "main p", "p, h1, h2, h3, li"] {
        let sel = Selector::parse(selector).expect("static selector");
        parts = document
            .select(&sel)
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if !parts.is_empty() {
            break;
        }
    }

    Extracted {
        title,
        content: parts.join("\n\n"),
    }
}

/// Strip control characters and collapse whitespace runs.
pub fn clean_content(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;
    let mut newlines = 0u8;
    for c in raw.chars() {
        match c {
            '\n' => {
                newlines = newlines.saturating_add(1);
                pending_space = false;
            }
            c if c.is_whitespace() => pending_space = true,
            c if c.is_control() => {}
            c => {
                if newlines > 0 {
                    out.push('\n');
                    if newlines > 1 {
                        out.push('\n');
                    }
                    newlines = 0;
                } else if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                out.push(c);
            }
        }
    }
    out
}

/// Minimum cleaned-content length by source type.
fn min_length(source_type: &str) -> usize {
    match source_type {
        "article" => 200,
        "video" | "pdf" => 100,
        "tweet" | "text" => 10,
        _ => 50,
    }
}

/// Enforce the per-type minimum and the global maximum.
///
/// Returns the (possibly truncated) content and whether truncation happened.
pub fn validate_content(source_type: &str, content: String) -> OxiclawResult<(String, bool)> {
    if content.chars().count() < min_length(source_type) {
        return Err(OxiclawError::Extraction(format!(
            "{} content too short ({} chars, need {})",
            source_type,
            content.chars().count(),
            min_length(source_type)
        )));
    }
    if content.len() > MAX_CONTENT_BYTES {
        let truncated = crate::utils::truncate_utf8(&content, MAX_CONTENT_BYTES).to_string();
        return Ok((truncated, true));
    }
    Ok((content, false))
}
