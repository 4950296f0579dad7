use thiserror::Error;

/// Network failure classification used by the retry policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("transient fetch error: {0}")]
    Transient(String),
    #[error("permanent fetch error: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Why a candidate ended in the `Failed` state.
#[derive(Debug, Error)]
pub enum CandidateError {
    #[error("retries exhausted: {0}")]
    TransientFetch(String),
    #[error("{0}")]
    PermanentFetch(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("store constraint violation: {0}")]
    StoreConstraintViolation(String),
    #[error("io error: {0}")]
    Io(String),
}

impl CandidateError {
    pub fn kind(&self) -> &'static str {
        match self {
            CandidateError::TransientFetch(_) => "transient_fetch",
            CandidateError::PermanentFetch(_) => "permanent_fetch",
            CandidateError::Decode(_) => "decode",
            CandidateError::StoreConstraintViolation(_) => "store_constraint",
            CandidateError::Io(_) => "io",
        }
    }
}

impl From<FetchError> for CandidateError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Transient(msg) => CandidateError::TransientFetch(msg),
            FetchError::Permanent(msg) => CandidateError::PermanentFetch(msg),
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("link discovery unavailable: {0}")]
    Unavailable(String),
    #[error("discovery round failed: {0}")]
    RoundFailed(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("provenance store lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Sorts raw sqlite constraint failures into `Constraint` so callers can
    /// tell integrity problems apart from I/O or locking trouble.
    pub fn classify(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, msg)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Constraint(msg.clone().unwrap_or_else(|| code.to_string()))
            }
            _ => StoreError::Sqlite(err),
        }
    }
}

impl From<StoreError> for CandidateError {
    fn from(err: StoreError) -> Self {
        CandidateError::StoreConstraintViolation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_errors_map_onto_candidate_failures() {
        let transient: CandidateError = FetchError::Transient("reset".into()).into();
        assert_eq!(transient.kind(), "transient_fetch");
        let permanent: CandidateError = FetchError::Permanent("HTTP 404".into()).into();
        assert_eq!(permanent.kind(), "permanent_fetch");
        assert_eq!(permanent.to_string(), "HTTP 404");
    }
}
