use std::fmt;

/// Classification of a cloud API failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudErrorKind {
    /// The pod (or other resource) does not exist.
    NotFound,
    /// Authentication or authorization failure.
    Auth,
    /// Account or region quota exhausted.
    Quota,
    /// Worth retrying: rate limits, 5xx, connect/timeout failures.
    Transient,
    /// Everything else; retrying will not help.
    Fatal,
}

impl fmt::Display for CloudErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::Auth => "auth",
            Self::Quota => "quota",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Error surface of the cloud adapter.
#[derive(Debug, Clone, thiserror::Error)]
#[error("cloud error ({kind}): {detail}")]
pub struct CloudError {
    pub kind: CloudErrorKind,
    pub detail: String,
}

impl CloudError {
    pub fn new(kind: CloudErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::NotFound, detail)
    }

    pub fn auth(detail: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::Auth, detail)
    }

    pub fn quota(detail: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::Quota, detail)
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::Transient, detail)
    }

    pub fn fatal(detail: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::Fatal, detail)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == CloudErrorKind::Transient
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == CloudErrorKind::NotFound
    }
}
