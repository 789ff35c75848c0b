use std::fmt::{self, Display};

/// The kind of error that occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The content is moderated.
    Moderated,
    /// The model provider is rate limited.
    RateLimitExceeded,
    /// The connection to the provider failed or was interrupted.
    Network,
    /// The provider did not answer in time.
    Timeout,
    /// The provider is temporarily unavailable (e.g. 5xx responses).
    Unavailable,
    /// The credential is missing or rejected.
    Unauthorized,
    /// The request was rejected as malformed.
    InvalidRequest,
    /// The provider sent something we cannot understand.
    MalformedResponse,
    /// Any other errors.
    Other,
}

impl ErrorKind {
    /// Returns `true` if a request failing with this kind may succeed when
    /// sent again later.
    #[inline]
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimitExceeded
                | ErrorKind::Network
                | ErrorKind::Timeout
                | ErrorKind::Unavailable
        )
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Moderated => "content moderated",
            ErrorKind::RateLimitExceeded => "rate limit exceeded",
            ErrorKind::Network => "network error",
            ErrorKind::Timeout => "timed out",
            ErrorKind::Unavailable => "service unavailable",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::InvalidRequest => "invalid request",
            ErrorKind::MalformedResponse => "malformed response",
            ErrorKind::Other => "other error",
        };
        f.write_str(s)
    }
}
