use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use crate::error::Error;

const DEFAULT_PROCESSOR_URL: &str = "https://api.stripe.com/";
const DEFAULT_CREDENTIALS_FILE: &str = "travel-booking-credentials.json";

/// Client configuration.
///
/// Required field (`api_base_url`) is a constructor parameter; everything
/// else has a default and a `with_*` override.
///
/// ```rust,ignore
/// let config = ClientConfig::new("https://api.example.com/api/".parse()?)
///     .with_processor_key("pk_test_123")
///     .with_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClientConfig {
    pub(crate) api_base_url: Url,
    pub(crate) processor_url: Url,
    pub(crate) processor_key: Option<String>,
    pub(crate) credentials_path: PathBuf,
    pub(crate) timeout: Duration,
    pub(crate) user_agent: String,
}

impl ClientConfig {
    /// Required fields are parameters; the rest take defaults.
    #[must_use]
    pub fn new(api_base_url: Url) -> Self {
        Self {
            api_base_url: with_trailing_slash(api_base_url),
            processor_url: DEFAULT_PROCESSOR_URL
                .parse()
                .expect("valid default URL"),
            processor_key: None,
            credentials_path: PathBuf::from(DEFAULT_CREDENTIALS_FILE),
            timeout: Duration::from_secs(30),
            user_agent: concat!("travel-booking-client/", env!("CARGO_PKG_VERSION")).into(),
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `TRAVEL_API_URL`: backend API base URL
    ///
    /// # Optional env vars
    /// - `TRAVEL_PROCESSOR_URL`: card processor API base URL
    /// - `TRAVEL_PROCESSOR_KEY`: processor publishable key
    /// - `TRAVEL_CREDENTIALS_PATH`: file holding the persisted token and user
    /// - `TRAVEL_HTTP_TIMEOUT_SECS`: per-request timeout in seconds
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if required env vars are missing or values are invalid.
    pub fn from_env() -> Result<Self, Error> {
        let api_url = std::env::var("TRAVEL_API_URL")
            .map_err(|_| Error::Config("TRAVEL_API_URL is required".into()))?;
        let api_url: Url = api_url
            .parse()
            .map_err(|e| Error::Config(format!("TRAVEL_API_URL: {e}")))?;

        let mut config = Self::new(api_url);

        if let Ok(url_str) = std::env::var("TRAVEL_PROCESSOR_URL") {
            let url: Url = url_str
                .parse()
                .map_err(|e| Error::Config(format!("TRAVEL_PROCESSOR_URL: {e}")))?;
            config = config.with_processor_url(url);
        }
        if let Ok(key) = std::env::var("TRAVEL_PROCESSOR_KEY") {
            config = config.with_processor_key(key);
        }
        if let Ok(path) = std::env::var("TRAVEL_CREDENTIALS_PATH") {
            config = config.with_credentials_path(path);
        }
        if let Ok(secs) = std::env::var("TRAVEL_HTTP_TIMEOUT_SECS") {
            let secs: u64 = secs
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("TRAVEL_HTTP_TIMEOUT_SECS: {e}")))?;
            config = config.with_timeout(Duration::from_secs(secs));
        }

        Ok(config)
    }

    /// Override the card processor API base (default: `https://api.stripe.com/`).
    #[must_use]
    pub fn with_processor_url(mut self, url: Url) -> Self {
        self.processor_url = with_trailing_slash(url);
        self
    }

    /// Set the processor publishable key.
    #[must_use]
    pub fn with_processor_key(mut self, key: impl Into<String>) -> Self {
        self.processor_key = Some(key.into());
        self
    }

    /// Override the persisted credentials file.
    #[must_use]
    pub fn with_credentials_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_path = path.into();
        self
    }

    /// Override the per-request timeout (default: 30s).
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the `User-Agent` header.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Backend API base URL (always ends in `/`).
    #[must_use]
    pub fn api_base_url(&self) -> &Url {
        &self.api_base_url
    }

    /// Card processor API base URL (always ends in `/`).
    #[must_use]
    pub fn processor_url(&self) -> &Url {
        &self.processor_url
    }

    /// Processor publishable key, if configured.
    #[must_use]
    pub fn processor_key(&self) -> Option<&str> {
        self.processor_key.as_deref()
    }

    /// File holding the persisted token and user.
    #[must_use]
    pub fn credentials_path(&self) -> &Path {
        &self.credentials_path
    }

    /// Per-request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `User-Agent` sent with every request.
    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

// `Url::join` drops the last path segment unless the base ends in '/'.
fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
