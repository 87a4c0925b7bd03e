//! Shared HTTP client, SSE framing, and status classification.

use std::sync::OnceLock;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};

use crate::error::ProviderError;

static SHARED_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// Get (or create) the shared reqwest client.
///
/// Request deadlines are applied per call by the agent loop, so the client
/// itself only bounds connection setup.
pub fn shared_client() -> &'static reqwest::Client {
    SHARED_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    })
}

/// Build default headers for a Bearer-token API.
pub fn bearer_headers(api_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(val) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
        headers.insert(AUTHORIZATION, val);
    }
    headers
}

/// Build Anthropic-style headers (x-api-key).
pub fn anthropic_headers(api_key: &str, version: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(val) = HeaderValue::from_str(api_key) {
        headers.insert("x-api-key", val);
    }
    if let Ok(val) = HeaderValue::from_str(version) {
        headers.insert("anthropic-version", val);
    }
    headers
}

/// POST a JSON body and return the response if the status is 2xx.
pub async fn post_json(
    url: &str,
    headers: HeaderMap,
    body: &serde_json::Value,
) -> Result<reqwest::Response, ProviderError> {
    let resp = shared_client()
        .post(url)
        .headers(headers)
        .json(body)
        .send()
        .await?;

    let status = resp.status().as_u16();
    if (200..300).contains(&status) {
        return Ok(resp);
    }
    let retry_after = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
    let body_text = resp.text().await.unwrap_or_default();
    Err(status_to_error(status, retry_after, &body_text))
}

/// Parse an SSE "data:" line, returning None for "[DONE]" and non-data lines.
pub fn parse_sse_data(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return None;
    }
    Some(data)
}

/// Splits a byte stream into SSE `data:` payloads.
///
/// Bytes are buffered until a full line arrives, so a UTF-8 character split
/// across network chunks is decoded intact. A line that is not valid UTF-8
/// is `Malformed`.
#[derive(Debug, Default)]
pub(crate) struct SseFramer {
    buffer: Vec<u8>,
}

impl SseFramer {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, ProviderError> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            if let Some(data) = decode_line(&line)? {
                payloads.push(data);
            }
        }
        Ok(payloads)
    }

    /// Flush a final line that had no trailing newline.
    pub(crate) fn finish(&mut self) -> Result<Option<String>, ProviderError> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }
}

fn decode_line(line: &[u8]) -> Result<Option<String>, ProviderError> {
    let line = std::str::from_utf8(line).map_err(|e| {
        ProviderError::malformed(format!("stream line is not valid UTF-8: {e}")).with_source(e)
    })?;
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }
    Ok(parse_sse_data(line).map(str::to_string))
}

/// Turn a streaming response body into its SSE `data:` payloads.
pub fn sse_data_stream(resp: reqwest::Response) -> BoxStream<'static, Result<String, ProviderError>> {
    let byte_stream = resp.bytes_stream();
    let stream = async_stream::stream! {
        let mut framer = SseFramer::default();
        let mut failed = false;
        futures::pin_mut!(byte_stream);

        while let Some(chunk_result) = byte_stream.next().await {
            let framed = match chunk_result {
                Ok(chunk) => framer.push(&chunk),
                Err(e) => Err(ProviderError::from(e)),
            };
            match framed {
                Ok(payloads) => {
                    for data in payloads {
                        yield Ok(data);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    failed = true;
                    break;
                }
            }
        }

        if !failed {
            match framer.finish() {
                Ok(Some(data)) => {
                    yield Ok(data);
                }
                Ok(None) => {}
                Err(e) => {
                    yield Err(e);
                }
            }
        }
    };
    Box::pin(stream)
}

/// Classify a non-2xx HTTP answer.
pub fn status_to_error(status: u16, retry_after: Option<Duration>, body: &str) -> ProviderError {
    let message = error_message(body);
    let err = match status {
        401 | 403 => ProviderError::authentication(message),
        429 => ProviderError::rate_limited(message, retry_after.or_else(|| body_retry_after(body))),
        408 | 500..=599 => ProviderError::transport(message),
        _ => ProviderError::invalid_request(message),
    };
    err.with_status(status)
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}

fn body_retry_after(body: &str) -> Option<Duration> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error")?.get("retry_after")?.as_f64())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}
