//! Crawl error taxonomy
//!
//! Retriable kinds stay local to the request: they land on the error
//! trail and the request is reclaimed. Only a handler-of-last-resort
//! failure or a storage failure while marking a request handled
//! terminates the whole crawl.

/// Typed failure kinds recognized by the retry pipeline
#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    /// The user handler missed its deadline
    #[error("handle_request_function timed out after {secs} seconds.")]
    HandlerTimeout { secs: u64 },

    /// Navigation missed its deadline (browser crawler)
    #[error("Navigation timed out after {secs} seconds.")]
    NavigationTimeout { secs: u64 },

    /// The response status implies the session is burned
    #[error("Request blocked - received {status} status code.")]
    RequestBlocked { status: u16 },

    /// Every session rotation for this request came back blocked
    #[error("Request failed {rotations} times with blocked status codes; no usable session left.")]
    SessionDepleted { rotations: u32 },
}

impl CrawlError {
    /// Whether this kind already carries its own session penalty
    ///
    /// Blocked and navigation-timeout paths penalize the session at the
    /// point of detection; the generic failure path must not penalize it
    /// again.
    #[must_use]
    pub fn penalizes_session(&self) -> bool {
        !matches!(
            self,
            Self::RequestBlocked { .. } | Self::NavigationTimeout { .. }
        )
    }
}

/// Result of one handler invocation, decided by the wrapper
///
/// The pipeline branches on the variant; no error is ever re-thrown to
/// steer control flow.
#[derive(Debug)]
pub enum HandlerOutcome {
    Success,
    /// Record, bump the retry counter, reclaim
    RetriableFailure(anyhow::Error),
    /// Record, notify the failed-request handler, mark handled
    TerminalFailure(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_message_is_canonical() {
        let error = CrawlError::RequestBlocked { status: 429 };
        assert_eq!(
            error.to_string(),
            "Request blocked - received 429 status code."
        );
    }

    #[test]
    fn test_timeout_message_embeds_seconds() {
        let error = CrawlError::HandlerTimeout { secs: 60 };
        assert!(error.to_string().contains("60 seconds"));
    }

    #[test]
    fn test_session_penalty_exemptions() {
        assert!(!CrawlError::RequestBlocked { status: 403 }.penalizes_session());
        assert!(!CrawlError::NavigationTimeout { secs: 30 }.penalizes_session());
        assert!(CrawlError::HandlerTimeout { secs: 60 }.penalizes_session());
    }
}
