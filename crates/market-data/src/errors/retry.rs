/// Classification for retry policy.
///
/// Used by the batch orchestrator to decide how to respond to an upstream error.
///
/// | Class | Requeue symbol? | Counts against retry budget? |
/// |-------|-----------------|------------------------------|
/// | `Never` | No | No (reported immediately) |
/// | `WithBackoff` | Yes, after an exponential delay | Yes |
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryClass {
    /// Never retry - bad symbol, validation error, or terminal failure.
    /// The request is fundamentally invalid and retrying won't help.
    Never,

    /// Retry after backing off.
    ///
    /// Used for transient errors like rate limiting (429), timeouts and
    /// transport failures. The symbol goes back to the queue without
    /// holding a worker slot while it waits.
    WithBackoff,
}
