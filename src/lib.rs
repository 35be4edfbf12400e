//! Client layer for the rate-limited, paginated ESI REST API.
//!
//! [`http::Executor`] performs single GETs and always hands back a
//! [`http::ResponseEnvelope`] for any HTTP answer; [`pagination::PageFetcher`]
//! reassembles multi-page result sets on top of it. Budget counters, error
//! classification and the validator cache live in their own modules so they
//! can be used and tested without a network.

pub mod budget;
pub mod cache;
pub mod config;
pub mod error;
pub mod gate;
pub mod headers;
pub mod http;
pub mod pagination;
pub mod token;

pub use budget::{BudgetHealth, BudgetSnapshot, BudgetTracker};
pub use cache::{CacheEntry, ResponseCache};
pub use config::Config;
pub use error::{classify, ApiError, ClientError, ErrorKind, Outcome};
pub use gate::LockoutGate;
pub use http::{Executor, ResponseEnvelope};
pub use pagination::{ConsistencyWarning, FetchError, PageFetcher, PagedResult};
pub use token::{EnvToken, StaticToken, TokenSource};
