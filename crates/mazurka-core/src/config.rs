use std::time::Duration;

use serde::Deserialize;

fn default_head_size() -> usize {
    8_000
}

fn default_trailers_size() -> usize {
    8_000
}

fn default_idle_secs() -> u64 {
    90
}

fn default_recovery_attempts() -> u32 {
    5
}

fn default_unsuccessful() -> u32 {
    7
}

fn default_discard_informational() -> bool {
    true
}

/// Engine limits and toggles.
///
/// Every field has a production default; embedders tune them with the
/// `with_*` setters or load them from `MAZURKA_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Max size in bytes of a request head (request-line plus headers).
    #[serde(default = "default_head_size")]
    pub max_request_head_size: usize,

    /// Max size in bytes of the trailer block of a chunked request body.
    #[serde(default = "default_trailers_size")]
    pub max_request_trailers_size: usize,

    /// How long a connection may sit idle between bytes of a request head
    /// or body before the read is cancelled.
    #[serde(default = "default_idle_secs", rename = "timeout_idle_connection_secs")]
    pub timeout_idle_connection_secs: u64,

    /// How many times the application error-handler chain is re-entered
    /// for one exchange before the channel is closed unconditionally.
    #[serde(default = "default_recovery_attempts")]
    pub max_error_recovery_attempts: u32,

    /// How many consecutive 4xx/5xx responses a connection may serve
    /// before it is fully closed.
    #[serde(default = "default_unsuccessful")]
    pub max_unsuccessful_responses: u32,

    /// Reject HTTP/1.0 clients with 426 Upgrade Required.
    #[serde(default)]
    pub reject_clients_using_http1_0: bool,

    /// Answer `Expect: 100-continue` immediately after the head instead of
    /// on first body access.
    #[serde(default)]
    pub immediately_continue_expect_100: bool,

    /// Silently drop interim responses the client's protocol version cannot
    /// receive instead of failing the write.
    #[serde(default = "default_discard_informational")]
    pub discard_rejected_informational: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_request_head_size: default_head_size(),
            max_request_trailers_size: default_trailers_size(),
            timeout_idle_connection_secs: default_idle_secs(),
            max_error_recovery_attempts: default_recovery_attempts(),
            max_unsuccessful_responses: default_unsuccessful(),
            reject_clients_using_http1_0: false,
            immediately_continue_expect_100: false,
            discard_rejected_informational: default_discard_informational(),
        }
    }
}

impl Config {
    /// Load configuration from `MAZURKA_*` environment variables, falling
    /// back to the defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        fn var<T: std::str::FromStr>(name: &str, default: T) -> T {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        let d = Config::default();
        Config {
            max_request_head_size: var("MAZURKA_MAX_REQUEST_HEAD_SIZE", d.max_request_head_size),
            max_request_trailers_size: var(
                "MAZURKA_MAX_REQUEST_TRAILERS_SIZE",
                d.max_request_trailers_size,
            ),
            timeout_idle_connection_secs: var(
                "MAZURKA_TIMEOUT_IDLE_CONNECTION_SECS",
                d.timeout_idle_connection_secs,
            ),
            max_error_recovery_attempts: var(
                "MAZURKA_MAX_ERROR_RECOVERY_ATTEMPTS",
                d.max_error_recovery_attempts,
            ),
            max_unsuccessful_responses: var(
                "MAZURKA_MAX_UNSUCCESSFUL_RESPONSES",
                d.max_unsuccessful_responses,
            ),
            reject_clients_using_http1_0: var(
                "MAZURKA_REJECT_CLIENTS_USING_HTTP1_0",
                d.reject_clients_using_http1_0,
            ),
            immediately_continue_expect_100: var(
                "MAZURKA_IMMEDIATELY_CONTINUE_EXPECT_100",
                d.immediately_continue_expect_100,
            ),
            discard_rejected_informational: var(
                "MAZURKA_DISCARD_REJECTED_INFORMATIONAL",
                d.discard_rejected_informational,
            ),
        }
    }

    pub fn timeout_idle_connection(&self) -> Duration {
        Duration::from_secs(self.timeout_idle_connection_secs)
    }

    pub fn with_max_request_head_size(mut self, bytes: usize) -> Self {
        self.max_request_head_size = bytes;
        self
    }

    pub fn with_max_request_trailers_size(mut self, bytes: usize) -> Self {
        self.max_request_trailers_size = bytes;
        self
    }

    pub fn with_timeout_idle_connection(mut self, timeout: Duration) -> Self {
        self.timeout_idle_connection_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_max_error_recovery_attempts(mut self, attempts: u32) -> Self {
        self.max_error_recovery_attempts = attempts;
        self
    }

    pub fn with_max_unsuccessful_responses(mut self, max: u32) -> Self {
        self.max_unsuccessful_responses = max;
        self
    }

    pub fn with_reject_clients_using_http1_0(mut self, reject: bool) -> Self {
        self.reject_clients_using_http1_0 = reject;
        self
    }

    pub fn with_immediately_continue_expect_100(mut self, immediate: bool) -> Self {
        self.immediately_continue_expect_100 = immediate;
        self
    }

    pub fn with_discard_rejected_informational(mut self, discard: bool) -> Self {
        self.discard_rejected_informational = discard;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.max_request_head_size, 8_000);
        assert_eq!(c.max_request_trailers_size, 8_000);
        assert_eq!(c.timeout_idle_connection(), Duration::from_secs(90));
        assert_eq!(c.max_error_recovery_attempts, 5);
        assert_eq!(c.max_unsuccessful_responses, 7);
        assert!(!c.reject_clients_using_http1_0);
        assert!(!c.immediately_continue_expect_100);
        assert!(c.discard_rejected_informational);
    }

    #[test]
    fn builder_setters() {
        let c = Config::default()
            .with_max_request_head_size(100)
            .with_reject_clients_using_http1_0(true);
        assert_eq!(c.max_request_head_size, 100);
        assert!(c.reject_clients_using_http1_0);
    }
}
