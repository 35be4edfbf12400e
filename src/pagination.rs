//! Multi-page fetches driven by the `X-Pages` header.
//!
//! Page 1 decides the page count. Pages 2..N are fetched concurrently under a
//! ceiling, merged back in page order, and checked against page 1's
//! `Last-Modified`. The remote service has no cross-page snapshot, so a
//! mismatch is reported, never fatal. A failed trailing page only removes its
//! own items. Pages past `Config::max_pages` are never requested, however
//! many `X-Pages` announces.

use crate::error::{ApiError, ClientError, ErrorKind, Outcome};
use crate::http::Executor;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use tokio::sync::watch;
use uuid::Uuid;

pub const PAGE_PLACEHOLDER: &str = "{page}";

/// Page `n` disagreed with page 1 about when the data set last changed.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConsistencyWarning {
    pub page: u32,
    pub reference: DateTime<Utc>,
    pub observed: DateTime<Utc>,
}

impl fmt::Display for ConsistencyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "page {} last modified {} but page 1 last modified {}",
            self.page,
            self.observed.to_rfc2822(),
            self.reference.to_rfc2822()
        )
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PageFailure {
    pub page: u32,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PagedResult<T> {
    /// Items of every retrieved page, in page order.
    pub items: Vec<T>,
    /// Page count announced by page 1; 0 if cancelled before it arrived.
    pub total_pages: u32,
    /// Requested pages that contributed nothing because they failed or never
    /// completed.
    pub missing_pages: Vec<u32>,
    /// Announced pages above the page ceiling, left unrequested.
    pub unrequested_pages: u32,
    pub failures: Vec<PageFailure>,
    pub warnings: Vec<ConsistencyWarning>,
    pub cancelled: bool,
}

impl<T> PagedResult<T> {
    fn cancelled_before_first_page() -> Self {
        Self {
            items: Vec::new(),
            total_pages: 0,
            missing_pages: Vec::new(),
            unrequested_pages: 0,
            failures: Vec::new(),
            warnings: Vec::new(),
            cancelled: true,
        }
    }

    pub fn missing_count(&self) -> usize {
        self.missing_pages.len() + self.unrequested_pages as usize
    }

    pub fn is_complete(&self) -> bool {
        self.missing_count() == 0 && !self.cancelled
    }
}

/// The only ways a paginated fetch fails as a whole: page 1 never produced a
/// usable response.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("invalid page template {template}: {message}")]
    Template { template: String, message: String },
}

/// Builds the endpoint for `page`: substitutes `{page}` if present, else sets
/// the `page` query parameter on the resolved URL.
pub fn page_endpoint(exec: &Executor, template: &str, page: u32) -> Result<String, FetchError> {
    if template.contains(PAGE_PLACEHOLDER) {
        return Ok(exec.url_for(&template.replace(PAGE_PLACEHOLDER, &page.to_string())));
    }
    let mut url = url::Url::parse(&exec.url_for(template)).map_err(|e| FetchError::Template {
        template: template.to_string(),
        message: e.to_string(),
    })?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "page")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair("page", &page.to_string());
    Ok(url.to_string())
}

#[derive(Debug, Clone)]
pub struct PageFetcher {
    exec: Executor,
    max_concurrent: usize,
    max_pages: u32,
}

impl PageFetcher {
    pub fn new(exec: Executor) -> Self {
        let max_concurrent = exec.config().max_concurrent_pages.max(1);
        let max_pages = exec.config().max_pages.max(1);
        Self {
            exec,
            max_concurrent,
            max_pages,
        }
    }

    pub fn with_max_concurrent_pages(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }

    pub fn with_max_pages(mut self, n: u32) -> Self {
        self.max_pages = n.max(1);
        self
    }

    pub fn executor(&self) -> &Executor {
        &self.exec
    }

    pub async fn fetch_all<T: DeserializeOwned>(
        &self,
        template: &str,
        token: Option<&str>,
    ) -> Result<PagedResult<T>, FetchError> {
        self.run(template, token, None).await
    }

    /// Like [`fetch_all`](Self::fetch_all), but stops when `cancel` flips to
    /// `true` and returns the pages completed so far.
    pub async fn fetch_all_until<T: DeserializeOwned>(
        &self,
        template: &str,
        token: Option<&str>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<PagedResult<T>, FetchError> {
        self.run(template, token, Some(&mut cancel)).await
    }

    async fn run<T: DeserializeOwned>(
        &self,
        template: &str,
        token: Option<&str>,
        mut cancel: Option<&mut watch::Receiver<bool>>,
    ) -> Result<PagedResult<T>, FetchError> {
        let fetch_id = Uuid::new_v4();
        info!("fetch {} started for {}", fetch_id, template);

        let first_endpoint = page_endpoint(&self.exec, template, 1)?;
        let first = match until_cancelled(
            self.exec.execute::<Vec<T>>(&first_endpoint, token),
            cancel.as_deref_mut(),
        )
        .await
        {
            Some(res) => res?,
            None => {
                info!("fetch {} cancelled before page 1 arrived", fetch_id);
                return Ok(PagedResult::cancelled_before_first_page());
            }
        };

        let total_pages = first.total_pages.unwrap_or(1);
        let last_page = total_pages.min(self.max_pages);
        let reference = first.last_modified;
        let mut pages: BTreeMap<u32, Vec<T>> = BTreeMap::new();
        let mut failures = Vec::new();
        let mut warnings = Vec::new();
        let mut cancelled = false;

        match first.into_outcome() {
            Outcome::Data(items) => {
                pages.insert(1, items);
            }
            Outcome::NoData => {
                pages.insert(1, Vec::new());
            }
            Outcome::Transient(e) | Outcome::Fatal(e) => {
                warn!("fetch {} aborted: page 1 failed: {}", fetch_id, e);
                return Err(FetchError::Api(e));
            }
            // A 2xx still tells us how many pages exist; only page 1's items are lost.
            Outcome::Corrupt { status, message } => {
                failures.push(PageFailure {
                    page: 1,
                    reason: format!("status {} with undecodable body: {}", status, message),
                    kind: None,
                });
            }
        }

        if last_page < total_pages {
            warn!(
                "fetch {}: X-Pages announced {} pages, only requesting up to page {}",
                fetch_id, total_pages, last_page
            );
        }

        if last_page > 1 {
            let exec = &self.exec;
            let in_flight = stream::iter(2..=last_page)
                .map(move |page| async move {
                    let res = match page_endpoint(exec, template, page) {
                        Ok(endpoint) => exec
                            .execute::<Vec<T>>(&endpoint, token)
                            .await
                            .map_err(FetchError::from),
                        Err(e) => Err(e),
                    };
                    (page, res)
                })
                .buffer_unordered(self.max_concurrent);
            futures::pin_mut!(in_flight);

            loop {
                let next = match cancel.as_deref_mut() {
                    None => in_flight.next().await,
                    Some(rx) => {
                        tokio::select! {
                            biased;
                            _ = wait_cancelled(rx) => {
                                cancelled = true;
                                break;
                            }
                            next = in_flight.next() => next,
                        }
                    }
                };
                let Some((page, res)) = next else {
                    break;
                };
                let env = match res {
                    Ok(env) => env,
                    Err(e) => {
                        failures.push(PageFailure {
                            page,
                            reason: e.to_string(),
                            kind: None,
                        });
                        continue;
                    }
                };
                let observed = env.last_modified;
                match env.into_outcome() {
                    Outcome::Data(items) => {
                        pages.insert(page, items);
                    }
                    Outcome::NoData => {
                        pages.insert(page, Vec::new());
                    }
                    Outcome::Transient(e) | Outcome::Fatal(e) => {
                        failures.push(PageFailure {
                            page,
                            reason: e.to_string(),
                            kind: Some(e.kind),
                        });
                        continue;
                    }
                    Outcome::Corrupt { status, message } => {
                        failures.push(PageFailure {
                            page,
                            reason: format!("status {} with undecodable body: {}", status, message),
                            kind: None,
                        });
                        continue;
                    }
                }
                if let (Some(reference), Some(observed)) = (reference, observed) {
                    if reference != observed {
                        let warning = ConsistencyWarning {
                            page,
                            reference,
                            observed,
                        };
                        warn!("fetch {}: {}", fetch_id, warning);
                        warnings.push(warning);
                    }
                }
            }
        }

        let missing_pages: Vec<u32> = (1..=last_page)
            .filter(|p| !pages.contains_key(p))
            .collect();
        failures.sort_by_key(|f| f.page);
        warnings.sort_by_key(|w| w.page);
        let items: Vec<T> = pages.into_values().flatten().collect();

        let unrequested_pages = total_pages - last_page;
        if missing_pages.is_empty() && unrequested_pages == 0 {
            info!(
                "fetch {} done: {} items from {} pages, {} consistency warnings",
                fetch_id,
                items.len(),
                total_pages,
                warnings.len()
            );
        } else {
            warn!(
                "fetch {} done with {} of {} pages missing {:?}, {} unrequested{}",
                fetch_id,
                missing_pages.len(),
                total_pages,
                missing_pages,
                unrequested_pages,
                if cancelled { " (cancelled)" } else { "" }
            );
        }

        Ok(PagedResult {
            items,
            total_pages,
            missing_pages,
            unrequested_pages,
            failures,
            warnings,
            cancelled,
        })
    }
}

async fn until_cancelled<F: Future>(
    fut: F,
    cancel: Option<&mut watch::Receiver<bool>>,
) -> Option<F::Output> {
    match cancel {
        None => Some(fut.await),
        Some(rx) => {
            tokio::select! {
                biased;
                _ = wait_cancelled(rx) => None,
                out = fut => Some(out),
            }
        }
    }
}

/// Resolves once the flag reads `true`; never resolves if the sender goes away first.
async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        futures::future::pending::<()>().await;
    }
}
