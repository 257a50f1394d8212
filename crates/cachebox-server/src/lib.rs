//! # cachebox-server
//!
//! The client-facing half of cachebox: the mirror-surface router, the
//! cache-or-proxy engine, request-id plumbing and cache counters.
//!
//! The engine is the interesting part — see [`engine`] for the hit /
//! miss / skip state machine and the streaming fan-out that feeds the
//! client, the store and the digest hasher from a single upstream read.

pub mod api;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod trace;

pub use api::{create_router, AppState};
pub use engine::{CacheEngine, RequestContext, SkipPolicy, SERVICE_NAME};
pub use error::{Result, ServeError};
pub use metrics::CacheMetrics;
