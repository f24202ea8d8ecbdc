use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::Value;

pub(crate) fn http_client(timeout: Duration) -> Result<HttpClient> {
    let builder = HttpClient::builder().timeout(timeout);
    // Loopback test servers must not be routed through an ambient proxy.
    #[cfg(test)]
    let builder = builder.no_proxy();
    builder.build().context("failed to build HTTP client")
}

pub(crate) fn response_json_or_error(service: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{service} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{service} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{service} returned invalid JSON payload"))?;
    Ok(parsed)
}

/// Renders an error and its causes on one line, dropping repeated messages.
pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

/// Detail length kept when an adapter error is folded into a stage error.
pub(crate) const STAGE_DETAIL_MAX_CHARS: usize = 800;

#[cfg(test)]
mod tests {
    use super::{error_chain_text, truncate_text};

    #[test]
    fn error_chain_text_preserves_nested_contexts() {
        let err = anyhow::anyhow!("socket closed")
            .context("Gemini request failed (https://example.test)")
            .context("image generation failed");
        let rendered = error_chain_text(&err, 400);
        assert_eq!(
            rendered,
            "image generation failed | caused by: Gemini request failed (https://example.test) | caused by: socket closed"
        );
    }

    #[test]
    fn error_chain_text_skips_duplicates_and_truncates() {
        let err = anyhow::anyhow!("boom").context("boom").context("outer");
        assert_eq!(error_chain_text(&err, 400), "outer | caused by: boom");
        assert_eq!(error_chain_text(&err, 5), "outer…");
    }

    #[test]
    fn truncate_text_counts_chars_not_bytes() {
        assert_eq!(truncate_text("ééé", 3), "ééé");
        assert_eq!(truncate_text("éééé", 2), "éé…");
    }
}
