use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Network level failure. Retryable on the next scheduled refresh, never
/// retried inline.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("Request to {url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("Response from {url} is too large: {size} bytes")]
    TooLarge { url: String, size: usize },
    #[error("Invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("Request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl FetchError {
    fn from_reqwest(url: &str, timeout: Duration, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
                timeout,
            }
        } else {
            Self::Transport {
                url: url.to_string(),
                source: err,
            }
        }
    }
}

/// GETs `url` and returns the full body, bounded by `timeout` end to end.
pub async fn fetch_bytes(
    client: &reqwest::Client,
    url: &str,
    query: &[(&str, String)],
    timeout: Duration,
    max_size: usize,
) -> Result<Bytes, FetchError> {
    debug!("Fetching {url}");
    let target = if query.is_empty() {
        reqwest::Url::parse(url)
    } else {
        reqwest::Url::parse_with_params(url, query)
    };
    let target = target.map_err(|err| {
        FetchError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        }
    })?;
    let response = client
        .get(target)
        .timeout(timeout)
        .send()
        .await
        .map_err(|err| FetchError::from_reqwest(url, timeout, err))?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let body = response
        .bytes()
        .await
        .map_err(|err| FetchError::from_reqwest(url, timeout, err))?;
    if body.len() > max_size {
        return Err(FetchError::TooLarge {
            url: url.to_string(),
            size: body.len(),
        });
    }
    Ok(body)
}
