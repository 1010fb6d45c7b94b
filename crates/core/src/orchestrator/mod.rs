//! Multi-symbol refresh orchestration.
//!
//! ```text
//!   refresh_all(symbols, kind)
//!        │
//!        ├─ evaluate each symbol ──► Fresh ──────────────► AlreadyFresh
//!        │
//!        └─ lease (symbol, kind) ──► held elsewhere ──► wait ─► Coalesced
//!                 │
//!                 ▼ leader
//!           worker permit ──► limiter token ──► DatasetManager refresh
//!                 │
//!                 └─ RateLimited / UpstreamUnavailable ─► backoff, retry
//!                                                        until budget spent
//! ```
//!
//! One symbol's failure never fails the batch; every symbol gets its own
//! result.

mod batch;
mod context;
mod lease;

pub use batch::{BatchOrchestrator, BatchReport};
pub use context::{LimiterGate, RefreshContext};
pub use lease::{Lease, LeaseGuard, LeaseTable, LeaseWaiter};

/// How a refresh of one `(symbol, kind)` ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Nothing to fetch.
    AlreadyFresh,
    /// Fetched and stored after this many attempts.
    Refreshed { attempts: u32 },
    /// Another caller's in-flight refresh covered this one.
    Coalesced,
    /// The option chain expired; the final cached chain stays as is.
    Expired,
}
