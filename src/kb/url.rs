use anyhow::{Context, Result};
use url::Url;

/// Query parameters that only carry tracking state; stripped during
/// normalization so the same document never ingests twice under
/// campaign-tagged links.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
    "gclid",
    "igshid",
    "mc_cid",
    "mc_eid",
    "ref_src",
    "s",
];

/// Normalize a URL for dedup: lowercase scheme and host, drop tracking
/// params and the fragment, trim the trailing slash.
pub fn normalize_url(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw.trim()).with_context(|| format!("invalid URL: {raw}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("unsupported URL scheme: {}", url.scheme());
    }

    // The url crate already lowercases scheme and host during parsing.
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        let query: String = kept
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        url.set_query(Some(&query));
    }
    url.set_fragment(None);

    let mut out = url.to_string();
    while out.ends_with('/') {
        out.pop();
    }
    Ok(out)
}

/// Source type inferred from the URL shape. Callers may override.
pub fn detect_source_type(url: &str) -> &'static str {
    let parsed = match Url::parse(url) {
        Ok(u) => u,
        Err(_) => return "other",
    };
    let host = parsed.host_str().unwrap_or("").trim_start_matches("www.");
    let path = parsed.path().to_lowercase();

    if matches!(host, "twitter.com" | "x.com") {
        "tweet"
    } else if matches!(host, "youtube.com" | "youtu.be" | "m.youtube.com" | "vimeo.com") {
        "video"
    } else if path.ends_with(".pdf") {
        "pdf"
    } else {
        "article"
    }
}

/// Pull HTTP(S) URLs out of free-form message text.
pub fn extract_urls(text: &str) -> Vec<String> {
    // Conservative: stop at whitespace and common trailing punctuation.
    static URL_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = URL_RE.get_or_init(|| {
        regex::Regex::new(r#"https?://[^\s<>"')\]]+"#).expect("url regex compiles")
    });
    re.find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', '!', '?']).to_string())
        .collect()
}
