//! Upstream access guards.
//!
//! This module protects the provider and the cache from each other:
//! - Rate limiting per provider
//! - Price bar validation

mod rate_limiter;
mod validator;

pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use validator::{BarValidator, ValidationIssue, ValidationSeverity, ValidatorConfig};
