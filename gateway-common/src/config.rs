use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Per-`Authorization` type overrides: `[<type>]` sections in the config
/// file (`[basic]`, `[negotiate]`, `[remote-login-ssh]`, ...).
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct AuthTypeConfig {
    pub action: Option<String>,
    pub command: Option<String>,
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub response_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RemoteSshConfig {
    #[serde(default = "default_ssh_host")]
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_bridge_command")]
    pub bridge_command: String,
}

fn default_ssh_host() -> String {
    "127.0.0.1".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_bridge_command() -> String {
    "gateway-bridge".to_string()
}

impl Default for RemoteSshConfig {
    fn default() -> Self {
        Self {
            host: default_ssh_host(),
            port: default_ssh_port(),
            bridge_command: default_bridge_command(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Route `basic` auth through an SSH round-trip to the local machine
    /// instead of spawning the login helper directly.
    pub login_loopback: bool,
    /// `"begin:rate:max"`, see [`MaxStartups`].
    pub max_startups: Option<String>,
    pub auth_types: HashMap<String, AuthTypeConfig>,
    pub remote_login_ssh: RemoteSshConfig,
    pub session_program: String,
    #[serde(with = "humantime_serde")]
    pub session_idle: Duration,
    #[serde(with = "humantime_serde")]
    pub process_idle: Duration,
    #[serde(with = "humantime_serde")]
    pub auth_process_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub auth_response_timeout: Duration,
    pub cookie_insecure: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            login_loopback: false,
            max_startups: None,
            auth_types: HashMap::new(),
            remote_login_ssh: RemoteSshConfig::default(),
            session_program: "gateway-session".to_string(),
            session_idle: Duration::from_secs(15),
            process_idle: Duration::from_secs(90),
            auth_process_timeout: Duration::from_secs(30),
            auth_response_timeout: Duration::from_secs(60),
            cookie_insecure: false,
        }
    }
}

impl GatewayConfig {
    pub fn auth_type(&self, name: &str) -> Option<&AuthTypeConfig> {
        self.auth_types.get(name)
    }
}

pub const MIN_AUTH_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAX_AUTH_TIMEOUT: Duration = Duration::from_secs(900);

/// Clamp a configured per-type timeout to `[MIN_AUTH_TIMEOUT,
/// MAX_AUTH_TIMEOUT]`, falling back to `default` and warning on anything out
/// of range. Mirrors the `timeout_option()` helper in the original gateway.
pub fn clamp_timeout(auth_type: &str, name: &str, configured: Option<Duration>, default: Duration) -> Duration {
    let Some(value) = configured else {
        return default;
    };
    let clamped = value.clamp(MIN_AUTH_TIMEOUT, MAX_AUTH_TIMEOUT);
    if clamped != value {
        warn!(
            auth_type,
            %name,
            requested = ?value,
            using = ?clamped,
            "invalid auth timeout, clamping"
        );
    }
    clamped
}

/// The parsed form of `MaxStartups = "begin:rate:max"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStartups {
    pub begin: u32,
    pub rate: u32,
    pub max: u32,
}

impl Default for MaxStartups {
    fn default() -> Self {
        Self {
            begin: 10,
            rate: 100,
            max: 10,
        }
    }
}

impl MaxStartups {
    /// Parse `"begin:rate:max"`, `"begin:rate"`, or a bare `"max"`.
    /// Malformed or out-of-range specs revert to the default and are logged.
    pub fn parse(spec: Option<&str>) -> Self {
        let default = Self::default();
        let Some(spec) = spec else {
            return default;
        };

        let parts: Vec<&str> = spec.split(':').collect();
        let parsed: Option<Vec<u32>> = parts.iter().map(|p| p.parse::<u32>().ok()).collect();
        let Some(numbers) = parsed else {
            warn!(spec, "illegal MaxStartups spec, reverting to defaults");
            return default;
        };

        let this = match numbers.len() {
            1 => Self {
                begin: numbers[0],
                rate: 100,
                max: numbers[0],
            },
            2 => Self {
                begin: numbers[0],
                rate: numbers[1],
                max: numbers[0],
            },
            3 => Self {
                begin: numbers[0],
                rate: numbers[1],
                max: numbers[2],
            },
            _ => {
                warn!(spec, "illegal MaxStartups spec, reverting to defaults");
                return default;
            }
        };

        if this.begin > this.max || this.rate > 100 || this.rate < 1 {
            warn!(spec, "illegal MaxStartups spec, reverting to defaults");
            return default;
        }

        this
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_three_part_spec() {
        let m = MaxStartups::parse(Some("10:30:60"));
        assert_eq!(m, MaxStartups { begin: 10, rate: 30, max: 60 });
    }

    #[test]
    fn bare_number_is_hard_limit_with_full_rate() {
        let m = MaxStartups::parse(Some("5"));
        assert_eq!(m, MaxStartups { begin: 5, rate: 100, max: 5 });
    }

    #[test]
    fn two_part_spec_keeps_begin_as_max() {
        let m = MaxStartups::parse(Some("5:50"));
        assert_eq!(m, MaxStartups { begin: 5, rate: 50, max: 5 });
    }

    #[test]
    fn invalid_rate_reverts_to_default() {
        let m = MaxStartups::parse(Some("1:150:10"));
        assert_eq!(m, MaxStartups::default());
    }

    #[test]
    fn begin_above_max_reverts_to_default() {
        let m = MaxStartups::parse(Some("20:50:10"));
        assert_eq!(m, MaxStartups::default());
    }

    #[test]
    fn garbage_reverts_to_default() {
        let m = MaxStartups::parse(Some("not-a-number"));
        assert_eq!(m, MaxStartups::default());
    }

    #[test]
    fn none_is_default() {
        assert_eq!(MaxStartups::parse(None), MaxStartups::default());
    }

    #[test]
    fn clamp_timeout_keeps_in_range_value() {
        let d = clamp_timeout("basic", "timeout", Some(Duration::from_secs(45)), Duration::from_secs(30));
        assert_eq!(d, Duration::from_secs(45));
    }

    #[test]
    fn clamp_timeout_clamps_out_of_range_value() {
        let d = clamp_timeout("basic", "timeout", Some(Duration::from_secs(5000)), Duration::from_secs(30));
        assert_eq!(d, MAX_AUTH_TIMEOUT);
    }

    #[test]
    fn clamp_timeout_uses_default_when_unset() {
        let d = clamp_timeout("basic", "timeout", None, Duration::from_secs(30));
        assert_eq!(d, Duration::from_secs(30));
    }
}
