use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use url::Url;

/// A subscription URL that passed syntax and scheme checks.
///
/// Only `http` and `https` URLs with a host are representable; the empty
/// "not configured" case is modelled as `Option<SubscriptionUrl>` by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionUrl(Url);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrlError {
    #[error("subscription URL is empty")]
    Empty,
    #[error("subscription URL is malformed: {0}")]
    Malformed(String),
    #[error("unsupported URL scheme '{0}', expected http or https")]
    UnsupportedScheme(String),
}

impl UrlError {
    pub fn user_message(&self) -> String {
        match self {
            UrlError::Empty => crate::errors::url::EMPTY.to_string(),
            UrlError::Malformed(reason) => crate::errors::url::malformed(reason),
            UrlError::UnsupportedScheme(scheme) => crate::errors::url::unsupported_scheme(scheme),
        }
    }
}

impl SubscriptionUrl {
    pub fn parse(raw: &str) -> Result<Self, UrlError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(UrlError::Empty);
        }

        let url = Url::parse(trimmed).map_err(|e| UrlError::Malformed(e.to_string()))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(UrlError::UnsupportedScheme(other.to_string())),
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(UrlError::Malformed("missing host".to_string()));
        }

        Ok(Self(url))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_url(&self) -> &Url {
        &self.0
    }

    pub fn is_secure(&self) -> bool {
        self.0.scheme() == "https"
    }
}

impl fmt::Display for SubscriptionUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of accepting a new subscription URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlAccepted {
    pub url: SubscriptionUrl,
    pub insecure: bool,
}

impl UrlAccepted {
    pub fn new(url: SubscriptionUrl) -> Self {
        let insecure = !url.is_secure();
        Self { url, insecure }
    }

    pub fn warning(&self) -> Option<&'static str> {
        self.insecure.then_some(crate::errors::url::HTTP_WARNING)
    }
}

/// Lifecycle of the managed proxy process. Owned by the process manager;
/// the controller only observes it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display, strum::EnumIter,
)]
pub enum ProxyProcessState {
    #[default]
    NotRunning,
    Starting,
    Running,
    Stopping,
}

impl ProxyProcessState {
    pub fn all() -> impl Iterator<Item = Self> {
        use strum::IntoEnumIterator;
        Self::iter()
    }

    pub fn is_active(self) -> bool {
        matches!(self, ProxyProcessState::Starting | ProxyProcessState::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum SyncState {
    #[default]
    Idle,
    Fetching,
    Applying,
}

/// Which configuration the proxy is started with. At most one source is
/// active at a time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ActiveConfig {
    Subscription {
        path: PathBuf,
    },
    Local {
        name: String,
        index: usize,
        path: PathBuf,
    },
    #[default]
    Unavailable,
}

impl ActiveConfig {
    pub fn path(&self) -> Option<&Path> {
        match self {
            ActiveConfig::Subscription { path } | ActiveConfig::Local { path, .. } => Some(path),
            ActiveConfig::Unavailable => None,
        }
    }

    pub fn is_subscription(&self) -> bool {
        matches!(self, ActiveConfig::Subscription { .. })
    }
}

impl fmt::Display for ActiveConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActiveConfig::Subscription { path } => write!(f, "subscription ({})", path.display()),
            ActiveConfig::Local { name, index, .. } => write!(f, "local #{} '{}'", index, name),
            ActiveConfig::Unavailable => write!(f, "none"),
        }
    }
}

/// Generation token for one fetch. A completion is only acted upon when its
/// id matches the controller's current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FetchSessionId(u64);

impl FetchSessionId {
    pub fn first() -> Self {
        Self(1)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for FetchSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(SystemTime);

impl Timestamp {
    pub fn now() -> Self {
        Self(SystemTime::now())
    }

    /// Local wall-clock rendering used in status lines.
    pub fn local_display(&self) -> String {
        chrono::DateTime::<chrono::Local>::from(self.0)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", humantime::format_rfc3339(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_url_accepts_http_and_https() {
        let https = SubscriptionUrl::parse("https://example.com/sub?token=abc").unwrap();
        assert!(https.is_secure());
        assert_eq!(https.as_str(), "https://example.com/sub?token=abc");

        let http = SubscriptionUrl::parse("  http://example.com/sub  ").unwrap();
        assert!(!http.is_secure());
    }

    #[test]
    fn test_subscription_url_rejects_empty() {
        assert_eq!(SubscriptionUrl::parse(""), Err(UrlError::Empty));
        assert_eq!(SubscriptionUrl::parse("   "), Err(UrlError::Empty));
    }

    #[test]
    fn test_subscription_url_rejects_malformed() {
        let result = SubscriptionUrl::parse("not a url");
        assert!(matches!(result, Err(UrlError::Malformed(_))));
    }

    #[test]
    fn test_subscription_url_rejects_other_schemes() {
        let result = SubscriptionUrl::parse("ftp://example.com/config.json");
        assert_eq!(result, Err(UrlError::UnsupportedScheme("ftp".to_string())));

        let result = SubscriptionUrl::parse("file:///etc/passwd");
        assert_eq!(result, Err(UrlError::UnsupportedScheme("file".to_string())));
    }

    #[test]
    fn test_url_accepted_warns_for_http() {
        let accepted = UrlAccepted::new(SubscriptionUrl::parse("http://example.com").unwrap());
        assert!(accepted.insecure);
        assert!(accepted.warning().unwrap().contains("HTTP instead of HTTPS"));

        let accepted = UrlAccepted::new(SubscriptionUrl::parse("https://example.com").unwrap());
        assert!(accepted.warning().is_none());
    }

    #[test]
    fn test_active_config_path() {
        let subscription = ActiveConfig::Subscription {
            path: PathBuf::from("/data/subscription_config.json"),
        };
        assert_eq!(
            subscription.path(),
            Some(Path::new("/data/subscription_config.json"))
        );
        assert!(subscription.is_subscription());
        assert_eq!(ActiveConfig::Unavailable.path(), None);
    }

    #[test]
    fn test_process_state_activity() {
        let active: Vec<_> = ProxyProcessState::all()
            .filter(|state| state.is_active())
            .collect();
        assert_eq!(
            active,
            vec![ProxyProcessState::Starting, ProxyProcessState::Running]
        );
    }

    #[test]
    fn test_fetch_session_ids_increase() {
        let first = FetchSessionId::first();
        let second = first.next();
        assert!(second > first);
        assert_eq!(second.to_string(), "#2");
    }
}
