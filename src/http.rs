//! Blocking JSON-over-HTTP plumbing shared by the embedding and completion clients.

use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// Where a service expects its API key.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ApiKey<'a> {
    /// `Authorization: Bearer <key>`.
    Bearer(&'a str),
    /// The raw key in a named header such as `x-api-key`.
    Header(&'static str, &'a str),
}

/// Client that sends the key, `extra` headers and a JSON content type on every request.
pub(crate) fn json_client(
    service: &str,
    key: ApiKey<'_>,
    extra: &[(&'static str, &'static str)],
    timeout: Duration,
) -> Result<Client> {
    let secret = match key {
        ApiKey::Bearer(secret) | ApiKey::Header(_, secret) => secret.trim(),
    };
    anyhow::ensure!(!secret.is_empty(), "missing {service} API key");
    let (name, raw) = match key {
        ApiKey::Bearer(_) => (AUTHORIZATION, format!("Bearer {secret}")),
        ApiKey::Header(name, _) => (HeaderName::from_static(name), secret.to_string()),
    };
    let mut value =
        HeaderValue::from_str(&raw).with_context(|| format!("invalid {service} API key"))?;
    value.set_sensitive(true);

    let mut headers = HeaderMap::new();
    headers.insert(name, value);
    for &(name, value) in extra {
        headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Client::builder()
        .timeout(timeout)
        .default_headers(headers)
        .build()
        .with_context(|| format!("failed to build {service} HTTP client"))
}

/// POSTs `body` and decodes the JSON reply.
///
/// 429, 5xx and transient transport errors are retried with backoff until
/// `max_attempts` calls have been made; anything else fails at once.
pub(crate) fn post_json<Req, Resp>(
    client: &Client,
    endpoint: &str,
    body: &Req,
    max_attempts: usize,
    service: &str,
) -> Result<Resp>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1usize;
    loop {
        let failure = match client.post(endpoint).json(body).send() {
            Ok(resp) if resp.status().is_success() => {
                return resp
                    .json()
                    .with_context(|| format!("failed to parse {service} response"));
            }
            Ok(resp) => {
                let status = resp.status();
                let text = resp
                    .text()
                    .unwrap_or_else(|_| "<body unavailable>".to_string());
                if !should_retry(status) || attempt >= max_attempts {
                    bail!("{service} request failed ({status}): {text}");
                }
                status.to_string()
            }
            Err(err) => {
                if !is_retryable_error(&err) || attempt >= max_attempts {
                    return Err(err).with_context(|| format!("{service} request failed"));
                }
                err.to_string()
            }
        };
        warn!(service, attempt, error = %failure, "request failed, retrying");
        thread::sleep(retry_backoff(attempt));
        attempt += 1;
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_body() || err.is_request()
}

/// 1 s doubling per failed attempt, capped at 16 s.
fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn retries_only_throttling_and_server_errors() {
        assert!(should_retry(StatusCode::TOO_MANY_REQUESTS));
        assert!(should_retry(StatusCode::BAD_GATEWAY));
        assert!(!should_retry(StatusCode::UNAUTHORIZED));
        assert!(!should_retry(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(retry_backoff(1), Duration::from_millis(1000));
        assert_eq!(retry_backoff(2), Duration::from_millis(2000));
        assert_eq!(retry_backoff(9), Duration::from_millis(16000));
    }

    #[test]
    fn blank_or_unprintable_keys_are_rejected() {
        let timeout = Duration::from_secs(1);
        let blank = json_client("Example", ApiKey::Bearer("  "), &[], timeout).unwrap_err();
        assert_eq!(blank.to_string(), "missing Example API key");
        let newline = json_client("Example", ApiKey::Header("x-api-key", "a\nb"), &[], timeout)
            .unwrap_err();
        assert_eq!(newline.to_string(), "invalid Example API key");
    }

    #[test]
    fn well_formed_keys_build_a_client() {
        let client = json_client(
            "Example",
            ApiKey::Header("x-api-key", "secret"),
            &[("anthropic-version", "2023-06-01")],
            Duration::from_secs(1),
        );
        assert!(client.is_ok());
    }
}
