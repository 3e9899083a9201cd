use crate::backend::types::{FetchSessionId, SubscriptionUrl};
use crate::backend::{FetchFuture, SubscriptionSource};
use crate::constants::{self, MAX_REDIRECTS};
use reqwest::redirect::{Attempt, Policy};
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

const TLS_MARKERS: [&str; 5] = ["tls", "ssl", "certificate", "handshake", "corrupt message"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("{message}")]
    Transport { message: String },
    #[error("{message}")]
    Tls { message: String },
    #[error("server responded with HTTP {status}")]
    Protocol { status: u16 },
    #[error("refused redirect from {from} to {to}: HTTPS to HTTP downgrade")]
    RedirectDowngrade { from: String, to: String },
    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: u64 },
    #[error("request was cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn is_tls(&self) -> bool {
        matches!(self, FetchError::Tls { .. })
    }
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub user_agent: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_body_bytes: u64,
    pub verify_peer: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            user_agent: constants::user_agent(),
            timeout: constants::DEFAULT_FETCH_TIMEOUT,
            connect_timeout: constants::DEFAULT_CONNECT_TIMEOUT,
            max_body_bytes: constants::DEFAULT_MAX_BODY_BYTES,
            verify_peer: true,
        }
    }
}

#[derive(Debug, Error)]
#[error("refusing redirect from {from} to {to}")]
struct DowngradeRedirect {
    from: Url,
    to: Url,
}

#[derive(Debug, Error)]
#[error("too many redirects (limit {0})")]
struct TooManyRedirects(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectVerdict {
    Follow,
    Downgrade,
    TooMany,
}

/// Decides whether a redirect to `next` may be followed. `previous` holds the
/// original URL followed by every hop so far.
pub fn redirect_verdict(previous: &[Url], next: &Url) -> RedirectVerdict {
    if previous.len() > MAX_REDIRECTS {
        return RedirectVerdict::TooMany;
    }
    match previous.last() {
        Some(from) if from.scheme() == "https" && next.scheme() != "https" => {
            RedirectVerdict::Downgrade
        }
        _ => RedirectVerdict::Follow,
    }
}

fn redirect_policy() -> Policy {
    Policy::custom(|attempt: Attempt| {
        match redirect_verdict(attempt.previous(), attempt.url()) {
            RedirectVerdict::Follow => attempt.follow(),
            RedirectVerdict::Downgrade => {
                let to = attempt.url().clone();
                let from = attempt.previous().last().cloned().unwrap_or_else(|| to.clone());
                tracing::warn!("Refusing redirect from {} to {}", from, to);
                attempt.error(DowngradeRedirect { from, to })
            }
            RedirectVerdict::TooMany => attempt.error(TooManyRedirects(MAX_REDIRECTS)),
        }
    })
}

/// HTTP(S) client for subscription documents.
#[derive(Debug, Clone)]
pub struct SubscriptionFetcher {
    client: reqwest::Client,
    max_body_bytes: u64,
}

impl SubscriptionFetcher {
    pub fn new(options: &FetchOptions) -> Result<Self, FetchError> {
        let builder = reqwest::Client::builder()
            .redirect(redirect_policy())
            .user_agent(options.user_agent.clone())
            .timeout(options.timeout)
            .connect_timeout(options.connect_timeout);

        #[cfg(any(feature = "rustls", feature = "native-tls"))]
        let builder = if options.verify_peer {
            builder
        } else {
            tracing::warn!(
                "TLS peer verification is DISABLED for subscription downloads. Certificates will not be checked."
            );
            builder.danger_accept_invalid_certs(true)
        };

        #[cfg(not(any(feature = "rustls", feature = "native-tls")))]
        if !options.verify_peer {
            tracing::warn!("TLS support is not compiled in; ignoring peer verification opt-out");
        }

        let client = builder.build().map_err(|e| FetchError::Transport {
            message: format!("failed to build HTTP client: {}", error_chain(&e)),
        })?;

        Ok(Self {
            client,
            max_body_bytes: options.max_body_bytes,
        })
    }

    pub async fn fetch_bytes(&self, url: &SubscriptionUrl) -> Result<Vec<u8>, FetchError> {
        tracing::info!("Fetching subscription from {}", url);

        let mut response = self
            .client
            .get(url.as_url().clone())
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Protocol {
                status: status.as_u16(),
            });
        }

        let limit = self.max_body_bytes;
        if let Some(length) = response.content_length()
            && length > limit
        {
            return Err(FetchError::BodyTooLarge { limit });
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(classify)? {
            if (body.len() + chunk.len()) as u64 > limit {
                return Err(FetchError::BodyTooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        tracing::info!("Downloaded {} bytes from {}", body.len(), url);

        Ok(body)
    }
}

impl SubscriptionSource for SubscriptionFetcher {
    fn fetch(&self, url: &SubscriptionUrl) -> FetchFuture {
        let fetcher = self.clone();
        let url = url.clone();
        Box::pin(async move { fetcher.fetch_bytes(&url).await })
    }
}

fn classify(error: reqwest::Error) -> FetchError {
    if let Some(downgrade) = find_cause::<DowngradeRedirect>(&error) {
        return FetchError::RedirectDowngrade {
            from: downgrade.from.to_string(),
            to: downgrade.to.to_string(),
        };
    }

    let message = error_chain(&error);
    if !error.is_timeout() && tls_in_causes(&error) {
        FetchError::Tls { message }
    } else if let Some(status) = error.status() {
        FetchError::Protocol {
            status: status.as_u16(),
        }
    } else {
        FetchError::Transport { message }
    }
}

/// Only the causes are inspected; reqwest's own message carries the request
/// URL, which may contain any of the markers.
fn tls_in_causes(error: &reqwest::Error) -> bool {
    error
        .source()
        .is_some_and(|cause| looks_like_tls(&error_chain(cause)))
}

fn find_cause<'a, T: StdError + 'static>(error: &'a (dyn StdError + 'static)) -> Option<&'a T> {
    let mut current = Some(error);
    while let Some(cause) = current {
        if let Some(found) = cause.downcast_ref::<T>() {
            return Some(found);
        }
        current = cause.source();
    }
    None
}

/// Joins an error and its sources into one line, skipping repeats.
pub fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current = Some(error);
    while let Some(cause) = current {
        let text = cause.to_string();
        if !parts.iter().any(|p| p.contains(&text)) {
            parts.push(text);
        }
        current = cause.source();
    }
    parts.join(": ")
}

pub fn looks_like_tls(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    TLS_MARKERS.iter().any(|marker| lowered.contains(marker))
}

#[derive(Debug)]
pub struct FetchCompletion {
    pub session: FetchSessionId,
    pub result: Result<Vec<u8>, FetchError>,
}

/// One outstanding download. Aborting is cooperative: the task still posts a
/// completion (with [`FetchError::Cancelled`]) which the owner must ignore.
#[derive(Debug)]
pub struct FetchSession {
    id: FetchSessionId,
    cancellation_token: CancellationToken,
}

impl FetchSession {
    pub fn spawn(
        id: FetchSessionId,
        source: &Arc<dyn SubscriptionSource>,
        url: &SubscriptionUrl,
        completions: mpsc::UnboundedSender<FetchCompletion>,
    ) -> Self {
        let cancellation_token = CancellationToken::new();
        let token = cancellation_token.clone();
        let request = source.fetch(url);

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => Err(FetchError::Cancelled),
                result = request => result,
            };
            let _ = completions.send(FetchCompletion {
                session: id,
                result,
            });
        });

        Self {
            id,
            cancellation_token,
        }
    }

    pub fn id(&self) -> FetchSessionId {
        self.id
    }

    /// Safe to call any number of times, before or after completion.
    pub fn abort(&self) {
        if !self.cancellation_token.is_cancelled() {
            tracing::debug!("Aborting fetch session {}", self.id);
        }
        self.cancellation_token.cancel();
    }
}
