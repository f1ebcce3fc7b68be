use thiserror::Error;

/// Failure classes for the ad engine. None of these should ever take the
/// host process down; the refresh driver logs them and retries on its own
/// schedule.
#[derive(Debug, Error)]
pub enum PromoError {
    /// Malformed feed content (unparsable slot ids, bad JSON). Fails the
    /// current feed only; other feeds are unaffected.
    #[error("feed parse error: {0}")]
    Parse(String),

    /// Network failure, server-side error page, or an empty body. Retried
    /// on the next scheduled cycle, never in a tight loop.
    #[error("transport error: {0}")]
    Transport(String),

    /// Cache file or persisted snapshot missing, unreadable, or corrupt.
    /// Degrades to "treat as absent".
    #[error("storage error: {0}")]
    Storage(String),

    /// Lookup for a feed, slot, or candidate that does not exist. The
    /// consumer query surface converts these into sentinel values.
    #[error("unknown {0}")]
    State(String),
}

pub type PromoResult<T> = Result<T, PromoError>;
