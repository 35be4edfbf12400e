use std::env;

pub const DEFAULT_BASE_URL: &str = "https://esi.evetech.net/latest";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_CONCURRENT_PAGES: usize = 8;
pub const DEFAULT_MAX_PAGES: u32 = 1000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be a positive integer, got {value:?}")]
    InvalidNumber { name: &'static str, value: String },
}

/// Runtime configuration for the ESI client, passed once at construction.
#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    pub user_agent: String,
    pub timeout_secs: u64,
    /// Extra headers sent on every request.
    pub default_headers: Vec<(String, String)>,
    /// Ceiling on trailing pages fetched at once by the paginated fetcher.
    pub max_concurrent_pages: usize,
    /// Highest page number the paginated fetcher will request, whatever
    /// `X-Pages` announces.
    pub max_pages: u32,
}

impl Config {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_agent: default_user_agent(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            default_headers: Vec::new(),
            max_concurrent_pages: DEFAULT_MAX_CONCURRENT_PAGES,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    pub fn with_max_concurrent_pages(mut self, n: usize) -> Self {
        self.max_concurrent_pages = n.max(1);
        self
    }

    pub fn with_max_pages(mut self, n: u32) -> Self {
        self.max_pages = n.max(1);
        self
    }

    /// Load configuration from environment.
    ///
    /// Env vars:
    /// - ESI_BASE_URL (default: https://esi.evetech.net/latest)
    /// - ESI_USER_AGENT (default: esi-pager/<version>)
    /// - ESI_HTTP_TIMEOUT_SECS (default: 30)
    /// - ESI_MAX_CONCURRENT_PAGES (default: 8)
    /// - ESI_MAX_PAGES (default: 1000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = env::var("ESI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let mut cfg = Self::new(base_url);
        if let Ok(ua) = env::var("ESI_USER_AGENT") {
            if !ua.trim().is_empty() {
                cfg.user_agent = ua;
            }
        }
        if let Some(secs) = positive_from_env("ESI_HTTP_TIMEOUT_SECS")? {
            cfg.timeout_secs = secs as u64;
        }
        if let Some(n) = positive_from_env("ESI_MAX_CONCURRENT_PAGES")? {
            cfg.max_concurrent_pages = n;
        }
        if let Some(n) = positive_from_env("ESI_MAX_PAGES")? {
            cfg.max_pages = u32::try_from(n).unwrap_or(u32::MAX);
        }
        Ok(cfg)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

fn default_user_agent() -> String {
    format!("esi-pager/{}", env!("CARGO_PKG_VERSION"))
}

fn positive_from_env(name: &'static str) -> Result<Option<usize>, ConfigError> {
    match env::var(name) {
        Ok(raw) => parse_positive(name, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_positive(name: &'static str, raw: &str) -> Result<usize, ConfigError> {
    raw.trim()
        .parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| ConfigError::InvalidNumber {
            name,
            value: raw.to_string(),
        })
}
