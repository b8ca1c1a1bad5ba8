use std::io::{ErrorKind, Read};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{Map, Value};

use crate::cancel::CancelToken;

const BODY_READ_CHUNK: usize = 8 * 1024;
const ERROR_BODY_MAX_CHARS: usize = 512;

/// Lazily built blocking client.
///
/// reqwest's blocking client gives up after 30s unless told otherwise; here
/// the deadline is `None` (wait for as long as the provider needs) unless a
/// caller opts into one. Long calls are bounded with a `CancelToken` instead.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedClient {
    timeout: Option<Duration>,
    http: OnceLock<HttpClient>,
}

impl SharedClient {
    pub(crate) fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            http: OnceLock::new(),
        }
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn get(&self) -> Result<HttpClient> {
        if let Some(http) = self.http.get() {
            return Ok(http.clone());
        }
        let built = HttpClient::builder()
            .timeout(self.timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(self.http.get_or_init(|| built).clone())
    }
}

/// Reads `reader` to the end, checking `cancel` before every read. The reader
/// (and with it the connection) is dropped as soon as the token trips.
pub(crate) fn read_body<R: Read>(mut reader: R, cancel: Option<&CancelToken>) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut chunk = vec![0u8; BODY_READ_CHUNK];
    loop {
        if CancelToken::tripped(cancel) {
            bail!("response read cancelled after {} bytes", body.len());
        }
        match reader.read(&mut chunk) {
            Ok(0) => return Ok(body),
            Ok(read) => body.extend_from_slice(&chunk[..read]),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(anyhow!(err).context("response body read failed")),
        }
    }
}

/// Decodes a JSON reply, turning non-2xx statuses into errors that quote the
/// start of the body.
pub(crate) fn response_json_or_error(
    provider: &str,
    response: HttpResponse,
    cancel: Option<&CancelToken>,
) -> Result<Value> {
    if CancelToken::tripped(cancel) {
        bail!("{provider} call cancelled before the response was read");
    }
    let status = response.status();
    let bytes = read_body(response, cancel)
        .with_context(|| format!("{provider} response body read failed"))?;
    let body = String::from_utf8_lossy(&bytes);
    if !status.is_success() {
        bail!(
            "{provider} request failed ({}): {}",
            status.as_u16(),
            truncate_text(body.trim(), ERROR_BODY_MAX_CHARS)
        );
    }
    serde_json::from_str(&body).with_context(|| format!("{provider} returned invalid JSON payload"))
}

/// Fails on non-2xx responses, keeping the body open for streaming otherwise.
pub(crate) fn ensure_success(provider: &str, response: HttpResponse) -> Result<HttpResponse> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    bail!(
        "{provider} request failed ({}): {}",
        status.as_u16(),
        truncate_text(body.trim(), ERROR_BODY_MAX_CHARS)
    );
}

/// One-line rendering of an error and its causes, consecutive repeats
/// collapsed, cut to `max_chars`.
pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string().trim().to_string();
        if text.is_empty() || parts.last() == Some(&text) {
            continue;
        }
        parts.push(text);
    }
    let joined = if parts.is_empty() {
        err.to_string()
    } else {
        parts.join(" | caused by: ")
    };
    truncate_text(&joined, max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &value[..cut]),
        None => value.to_string(),
    }
}

pub(crate) fn merge_object(target: &mut Map<String, Value>, extra: &Map<String, Value>) {
    for (key, value) in extra {
        target.insert(key.clone(), value.clone());
    }
}

pub(crate) fn api_base(configured: Option<&str>, default: &str) -> String {
    configured
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use anyhow::Context;

    use super::*;

    /// Yields `chunks` one per read and trips `cancel` after the first.
    struct TrippingReader {
        chunks: Vec<&'static [u8]>,
        reads: usize,
        cancel: CancelToken,
    }

    impl Read for TrippingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let Some(chunk) = self.chunks.get(self.reads) else {
                return Ok(0);
            };
            self.reads += 1;
            self.cancel.cancel();
            buf[..chunk.len()].copy_from_slice(chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn body_read_stops_at_next_read_after_cancel() {
        let cancel = CancelToken::new();
        let mut reader = TrippingReader {
            chunks: vec![b"{\"a\":", b"1}"],
            reads: 0,
            cancel: cancel.clone(),
        };
        let result = read_body(&mut reader, Some(&cancel));
        assert!(result.is_err());
        assert_eq!(reader.reads, 1);
    }

    #[test]
    fn body_read_without_token_reads_everything() -> anyhow::Result<()> {
        let body = read_body(Cursor::new(b"hello world".to_vec()), None)?;
        assert_eq!(body, b"hello world");
        Ok(())
    }

    #[test]
    fn clients_have_no_deadline_unless_asked() -> anyhow::Result<()> {
        let client = SharedClient::default();
        assert_eq!(client.timeout(), None);
        client.get()?;
        let bounded = SharedClient::with_timeout(Some(Duration::from_secs(90)));
        assert_eq!(bounded.timeout(), Some(Duration::from_secs(90)));
        Ok(())
    }

    #[test]
    fn error_chain_text_preserves_nested_contexts() {
        let err = Err::<(), anyhow::Error>(anyhow::anyhow!("connection refused"))
            .context("NanoGPT request failed")
            .err()
            .unwrap_or_else(|| anyhow::anyhow!("missing"));
        assert_eq!(
            error_chain_text(&err, 200),
            "NanoGPT request failed | caused by: connection refused"
        );
        assert_eq!(error_chain_text(&err, 6), "NanoGP…");
    }

    #[test]
    fn truncate_marks_cut_text() {
        assert_eq!(truncate_text("abcdef", 3), "abc…");
        assert_eq!(truncate_text("abc", 3), "abc");
        assert_eq!(truncate_text("héllo", 2), "hé…");
    }

    #[test]
    fn api_base_trims_trailing_slash() {
        assert_eq!(
            api_base(Some(" https://example.test/v1/ "), "https://default"),
            "https://example.test/v1"
        );
        assert_eq!(api_base(Some("  "), "https://default"), "https://default");
        assert_eq!(api_base(None, "https://default"), "https://default");
    }
}
