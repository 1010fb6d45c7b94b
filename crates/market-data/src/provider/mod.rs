//! Upstream provider abstraction.
//!
//! This module contains:
//! - The `FetchProvider` trait the cache calls when an entry needs refreshing
//! - Provider capabilities and rate limiting configuration
//!
//! The network client itself lives outside this workspace; it only has to
//! implement `FetchProvider`. Everything above it (freshness, persistence,
//! coalescing, throttling) treats the provider as an opaque collaborator that
//! may fail with `SymbolNotFound`, `RateLimited` or `Transport`.

mod capabilities;
mod traits;

// Re-exports
pub use capabilities::{ProviderCapabilities, RateLimit};
pub use traits::FetchProvider;
