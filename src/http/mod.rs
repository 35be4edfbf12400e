use crate::budget::{BudgetSnapshot, BudgetTracker};
use crate::cache::ResponseCache;
use crate::config::Config;
use crate::error::{ApiError, ClientError, Outcome, DEFAULT_ERROR_WINDOW_SECS};
use crate::gate::LockoutGate;
use crate::headers::parse_headers;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, IF_NONE_MATCH, USER_AGENT,
};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Status the remote service uses for an exhausted error budget.
pub const ERROR_LIMITED: u16 = 420;

/// Uniform result of one GET, whatever status came back.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope<T> {
    pub endpoint: String,
    pub payload: Option<T>,
    pub status: StatusCode,
    pub validator: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub total_pages: Option<u32>,
    pub budget: Option<BudgetSnapshot>,
    /// Payload was served from the cache after a 304.
    pub from_cache: bool,
    /// Body of a non-success response, if any.
    pub error_body: Option<String>,
    /// Set when a 2xx body could not be deserialized.
    pub decode_error: Option<String>,
}

impl<T> ResponseEnvelope<T> {
    fn empty(endpoint: &str, status: StatusCode) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            payload: None,
            status,
            validator: None,
            last_modified: None,
            expires_at: None,
            total_pages: None,
            budget: None,
            from_cache: false,
            error_body: None,
            decode_error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success() || (self.status == StatusCode::NOT_MODIFIED && self.from_cache)
    }

    /// Classified error for any status other than 2xx and 304.
    pub fn error(&self) -> Option<ApiError> {
        if self.status.is_success() || self.status == StatusCode::NOT_MODIFIED {
            return None;
        }
        Some(ApiError::classify(
            self.endpoint.clone(),
            self.status.as_u16(),
            self.error_body.clone(),
            self.budget.clone(),
        ))
    }

    pub fn into_outcome(self) -> Outcome<T> {
        if let Some(err) = self.error() {
            return if err.retryable() {
                Outcome::Transient(err)
            } else {
                Outcome::Fatal(err)
            };
        }
        if let Some(message) = self.decode_error {
            return Outcome::Corrupt {
                status: self.status.as_u16(),
                message,
            };
        }
        match self.payload {
            Some(v) => Outcome::Data(v),
            None => Outcome::NoData,
        }
    }
}

pub fn build_client(cfg: &Config) -> Result<Client, ClientError> {
    let mut default_headers = HeaderMap::new();
    default_headers.insert(USER_AGENT, header_value("user-agent", &cfg.user_agent)?);
    default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    for (name, value) in &cfg.default_headers {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| ClientError::InvalidHeader {
                name: name.clone(),
                message: e.to_string(),
            })?;
        default_headers.insert(header_name, header_value(name, value)?);
    }
    // Authorization is attached per request; tokens rotate underneath us.
    Client::builder()
        .default_headers(default_headers)
        .timeout(Duration::from_secs(cfg.timeout_secs))
        .use_rustls_tls()
        .build()
        .map_err(ClientError::Build)
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, ClientError> {
    HeaderValue::from_str(value).map_err(|e| ClientError::InvalidHeader {
        name: name.to_string(),
        message: e.to_string(),
    })
}

fn auth_header(token: &str) -> Result<HeaderValue, ClientError> {
    let mut value = header_value("authorization", &format!("Bearer {}", token))?;
    value.set_sensitive(true);
    Ok(value)
}

/// Performs single GETs against the configured base URL.
///
/// Clones share the HTTP connection pool, the optional response cache, the
/// lockout gate and the budget tracker.
#[derive(Debug, Clone)]
pub struct Executor {
    client: Client,
    cfg: Arc<Config>,
    cache: Option<Arc<ResponseCache<Value>>>,
    gate: Arc<LockoutGate>,
    budgets: Arc<BudgetTracker>,
}

impl Executor {
    pub fn new(cfg: Config) -> Result<Self, ClientError> {
        let client = build_client(&cfg)?;
        Ok(Self::with_client(client, cfg))
    }

    pub fn with_client(client: Client, cfg: Config) -> Self {
        Self {
            client,
            cfg: Arc::new(cfg),
            cache: None,
            gate: Arc::new(LockoutGate::new()),
            budgets: Arc::new(BudgetTracker::new()),
        }
    }

    /// Enables validator-based revalidation through `cache`.
    pub fn with_cache(mut self, cache: Arc<ResponseCache<Value>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Shares a lockout gate with other executors talking to the same service.
    pub fn with_gate(mut self, gate: Arc<LockoutGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn gate(&self) -> &Arc<LockoutGate> {
        &self.gate
    }

    pub fn budgets(&self) -> &Arc<BudgetTracker> {
        &self.budgets
    }

    pub fn cache(&self) -> Option<&Arc<ResponseCache<Value>>> {
        self.cache.as_ref()
    }

    /// Absolute URL for `endpoint`; absolute URLs pass through unchanged.
    pub fn url_for(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        if endpoint.starts_with('/') {
            format!("{}{}", self.cfg.base_url, endpoint)
        } else {
            format!("{}/{}", self.cfg.base_url, endpoint)
        }
    }

    /// Issues one GET. Any HTTP response yields `Ok`; only transport failures,
    /// an engaged lockout, or an unbuildable request yield `Err`.
    pub async fn execute<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        token: Option<&str>,
    ) -> Result<ResponseEnvelope<T>, ClientError> {
        let url = self.url_for(endpoint);
        if let Err(e) = url::Url::parse(&url) {
            return Err(ClientError::InvalidRequest {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            });
        }
        if let Some(retry_in) = self.gate.remaining() {
            warn!(
                "GET {} skipped: error budget lockout, {}s left",
                endpoint,
                retry_in.as_secs()
            );
            return Err(ClientError::LockedOut {
                endpoint: endpoint.to_string(),
                retry_in,
            });
        }

        let cached = match &self.cache {
            Some(cache) => cache.get(&url).await,
            None => None,
        };

        let mut req = self.client.get(&url);
        if let Some(token) = token {
            req = req.header(AUTHORIZATION, auth_header(token)?);
        }
        if let Some(entry) = &cached {
            if let Ok(v) = HeaderValue::from_str(&entry.validator) {
                req = req.header(IF_NONE_MATCH, v);
            }
        }

        let res = req.send().await.map_err(|source| {
            warn!("GET {} transport error: {}", endpoint, source);
            ClientError::Transport {
                endpoint: endpoint.to_string(),
                source,
            }
        })?;

        let status = res.status();
        let parsed = parse_headers(res.headers());
        self.budgets.observe(&parsed.budget);

        let body = res.bytes().await.map_err(|source| {
            warn!("GET {} failed reading body: {}", endpoint, source);
            ClientError::Transport {
                endpoint: endpoint.to_string(),
                source,
            }
        })?;

        let mut env = ResponseEnvelope::empty(endpoint, status);
        env.validator = parsed.validator;
        env.last_modified = parsed.last_modified;
        env.expires_at = parsed.expires_at;
        env.total_pages = parsed.total_pages;
        env.budget = (!parsed.budget.is_empty()).then_some(parsed.budget);

        let budget_line = env
            .budget
            .as_ref()
            .map(|b| b.to_string())
            .unwrap_or_else(|| "no budget headers".into());

        if status == StatusCode::NOT_MODIFIED {
            self.serve_from_cache(&url, cached.as_deref(), &mut env).await;
        } else if status.is_success() {
            self.decode_success(&url, &body, &mut env).await;
        } else {
            let text = String::from_utf8_lossy(&body).into_owned();
            env.error_body = (!text.is_empty()).then_some(text);
            if status.as_u16() == ERROR_LIMITED {
                let reset = env
                    .budget
                    .as_ref()
                    .and_then(|b| b.error_budget_reset_seconds)
                    .unwrap_or(DEFAULT_ERROR_WINDOW_SECS);
                self.gate.engage(Duration::from_secs(reset));
            }
            let kind = env.error().map(|e| e.kind.code()).unwrap_or("unknown");
            warn!(
                "GET {} -> {} ({}) [{}]",
                endpoint,
                status.as_u16(),
                kind,
                budget_line
            );
        }

        if let Some(budget) = &env.budget {
            let health = budget.health();
            if !health.is_healthy() {
                warn!(
                    "GET {} budget running low (tokens={}, errors={}) [{}]",
                    endpoint, health.low_on_tokens, health.low_on_error_budget, budget_line
                );
            }
        }
        info!(
            "GET {} -> {}{} [{}]",
            endpoint,
            status.as_u16(),
            if env.from_cache { " (cached)" } else { "" },
            budget_line
        );
        Ok(env)
    }

    async fn serve_from_cache<T: DeserializeOwned>(
        &self,
        url: &str,
        entry: Option<&crate::cache::CacheEntry<Value>>,
        env: &mut ResponseEnvelope<T>,
    ) {
        let (Some(cache), Some(entry)) = (&self.cache, entry) else {
            warn!("GET {} -> 304 with nothing cached to serve", env.endpoint);
            return;
        };
        match serde_json::from_value::<T>(entry.payload.clone()) {
            Ok(v) => {
                env.payload = Some(v);
                env.from_cache = true;
                let validator = env
                    .validator
                    .get_or_insert_with(|| entry.validator.clone())
                    .clone();
                cache
                    .set(url, validator, entry.payload.clone(), env.expires_at)
                    .await;
                debug!("GET {} revalidated from cache", env.endpoint);
            }
            Err(e) => {
                warn!(
                    "GET {} -> 304 but cached payload failed to deserialize: {}",
                    env.endpoint, e
                );
                env.decode_error = Some(e.to_string());
            }
        }
    }

    async fn decode_success<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &[u8],
        env: &mut ResponseEnvelope<T>,
    ) {
        if body.is_empty() {
            return;
        }
        let cache = self.cache.as_ref().filter(|_| env.validator.is_some());
        let decoded = match cache {
            Some(_) => serde_json::from_slice::<Value>(body)
                .and_then(|v| serde_json::from_value::<T>(v.clone()).map(|t| (t, Some(v)))),
            None => serde_json::from_slice::<T>(body).map(|t| (t, None)),
        };
        match decoded {
            Ok((payload, raw)) => {
                env.payload = Some(payload);
                if let (Some(cache), Some(raw), Some(validator)) = (cache, raw, &env.validator) {
                    cache
                        .set(url, validator.clone(), raw, env.expires_at)
                        .await;
                }
            }
            Err(e) => {
                warn!(
                    "GET {} -> {}: deserialization error: {}",
                    env.endpoint,
                    env.status.as_u16(),
                    e
                );
                env.decode_error = Some(e.to_string());
            }
        }
    }
}
