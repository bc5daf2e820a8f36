//! Timeouts and retry scheduling for external calls
//!
//! Every call to the instance-metadata API, the cluster control plane and the
//! target registry goes through [`timeout::bounded`]. The retry schedule is
//! produced by the `backon` crate.

pub mod timeout {
    //! Timeout configuration for external service calls

    use std::future::Future;
    use std::time::Duration;

    use crate::error::{Error, Result};

    /// Default timeout for instance-metadata lookups
    pub const INSTANCE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

    /// Default timeout for cluster control-plane calls
    pub const CLUSTER_CALL_TIMEOUT: Duration = Duration::from_secs(15);

    /// Default timeout for target registry writes
    pub const TARGET_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Run `fut` with a deadline, mapping expiry to [`Error::Timeout`]
    ///
    /// A timed-out call is classified retryable.
    pub async fn bounded<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{operation} timed out after {}ms",
                limit.as_millis()
            ))),
        }
    }
}

pub mod retry {
    //! Retry utilities
    //!
    //! The delay schedule comes from `backon`; this module adds the policy
    //! knobs and transient-error classification.

    use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
    use std::time::Duration;

    use crate::config::ReconcilerConfig;

    /// Bounded retry budget with exponential, optionally jittered, backoff
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RetryPolicy {
        /// Total attempts including the first one
        pub max_attempts: u32,
        pub min_delay: Duration,
        pub max_delay: Duration,
        pub jitter: bool,
    }

    impl Default for RetryPolicy {
        fn default() -> Self {
            Self {
                max_attempts: 5,
                min_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(10),
                jitter: true,
            }
        }
    }

    impl RetryPolicy {
        #[must_use]
        pub fn from_config(config: &ReconcilerConfig) -> Self {
            Self {
                max_attempts: config.max_attempts,
                min_delay: Duration::from_millis(config.backoff_min_ms),
                max_delay: Duration::from_millis(config.backoff_max_ms),
                jitter: config.backoff_jitter,
            }
        }

        /// Delays to sleep between attempts (`max_attempts - 1` of them)
        #[must_use]
        pub fn delays(&self) -> ExponentialBackoff {
            let builder = ExponentialBuilder::default()
                .with_min_delay(self.min_delay)
                .with_max_delay(self.max_delay)
                .with_factor(2.0)
                .with_max_times(self.max_attempts.saturating_sub(1) as usize);

            if self.jitter {
                builder.with_jitter().build()
            } else {
                builder.build()
            }
        }
    }

    /// Check if an I/O error is transient and worth retrying
    #[must_use]
    pub fn is_transient_io_error(err: &std::io::Error) -> bool {
        matches!(
            err.kind(),
            std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::UnexpectedEof
        )
    }

    /// Check whether a control-plane error message describes a transient failure
    ///
    /// Used for CLI-backed adapters whose only error signal is stderr text.
    #[must_use]
    pub fn is_transient_message(message: &str) -> bool {
        let msg = message.to_lowercase();
        msg.contains("timed out")
            || msg.contains("timeout")
            || msg.contains("connection reset")
            || msg.contains("connection refused")
            || msg.contains("unable to connect")
            || msg.contains("temporarily unavailable")
            || msg.contains("throttl")
            || msg.contains("rate exceeded")
            || msg.contains("too many requests")
            || msg.contains("internal error")
            || msg.contains("service unavailable")
            || msg.contains("eof")
    }
}
