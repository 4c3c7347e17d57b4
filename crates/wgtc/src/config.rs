use clap::Parser;
use std::fmt;
use std::time::Duration;
use wgt_common::cipher::parse_hex_key;
use wgt_common::types::KEY_LEN;

/// Minimum accepted bearer token length, matching the relay.
pub const MIN_TOKEN_LEN: usize = 16;

/// Default local service, as in the generated agent scripts.
pub const DEFAULT_TARGET: &str = "127.0.0.1:443";

/// Where `--public-ip auto` looks up the agent's external address.
pub const IP_DISCOVERY_URL: &str = "http://api.ipify.org";

/// CLI interface for the agent.
#[derive(Parser, Debug)]
#[command(name = "wgtc", about = "waitgate agent")]
#[command(version)]
pub struct Args {
    /// Relay control-channel URL, e.g. `wss://relay.example.com/tunnel`.
    #[arg(long, env = "WGTC_RELAY")]
    pub relay: String,

    /// Bearer token shared with the relay.
    #[arg(long, env = "TUNNEL_TOKEN", hide_env_values = true)]
    pub tunnel_token: String,

    /// 32-byte frame key, hex encoded.
    #[arg(long, env = "TUNNEL_CHACHA_KEY", hide_env_values = true)]
    pub chacha_key: String,

    /// Local TCP service that forwarded streams are dialled against.
    #[arg(long, env = "WGTC_TARGET", default_value = DEFAULT_TARGET)]
    pub target: String,

    /// Base URL for proxied HTTP requests. Derived from `--target` when absent.
    #[arg(long, env = "WGTC_HTTP_TARGET")]
    pub http_target: Option<String>,

    /// Address announced to the relay in `HELLO`; `auto` looks it up.
    #[arg(long, env = "WGTC_PUBLIC_IP")]
    pub public_ip: Option<String>,

    /// Delay before re-dialling a local service that refused the connection.
    #[arg(long, env = "WGTC_RETRY_DELAY_MS", default_value_t = 3000)]
    pub retry_delay_ms: u64,

    /// Give up on a stream after this many refused dials.
    #[arg(long, env = "WGTC_MAX_DIAL_ATTEMPTS", default_value_t = 20)]
    pub max_dial_attempts: u32,

    /// First reconnect delay after losing the relay.
    #[arg(long, env = "WGTC_RECONNECT_MS", default_value_t = 5000)]
    pub reconnect_ms: u64,

    /// Upper bound for the reconnect delay.
    #[arg(long, env = "WGTC_RECONNECT_MAX_MS", default_value_t = 60_000)]
    pub reconnect_max_ms: u64,

    /// Timeout for one proxied HTTP request against the local service.
    #[arg(long, env = "WGTC_PROXY_TIMEOUT_MS", default_value_t = 30_000)]
    pub proxy_timeout_ms: u64,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// How the agent learns the address it reports in `HELLO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicIp {
    /// No `HELLO` is sent.
    Disabled,
    /// Sent as configured.
    Fixed(String),
    /// Looked up from [`IP_DISCOVERY_URL`] on every connect.
    Discover,
}

/// Local dial retry parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialPolicy {
    /// Pause between attempts after `ConnectionRefused`.
    pub retry_delay: Duration,
    /// Total attempts before the stream is dropped.
    pub max_attempts: u32,
}

impl Default for DialPolicy {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(3),
            max_attempts: 20,
        }
    }
}

/// Reconnect backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub initial: Duration,
    /// Maximum delay between reconnect attempts.
    pub max: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(60),
            factor: 2.0,
        }
    }
}

/// Runtime configuration of the agent.
#[derive(Clone)]
pub struct AgentConfig {
    /// Relay control-channel URL.
    pub relay_url: String,
    /// Bearer token presented on upgrade.
    pub tunnel_token: String,
    /// Frame key shared with the relay.
    pub cipher_key: [u8; KEY_LEN],
    /// `host:port` of the local TCP service.
    pub target: String,
    /// Base URL of the local HTTP service.
    pub http_target: String,
    /// `HELLO` behaviour.
    pub public_ip: PublicIp,
    /// Local dial retries.
    pub dial: DialPolicy,
    /// Relay reconnect backoff.
    pub reconnect: ReconnectPolicy,
    /// Per-request timeout for proxied HTTP.
    pub proxy_timeout: Duration,
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("relay_url", &self.relay_url)
            .field("tunnel_token", &"<redacted>")
            .field("cipher_key", &"<redacted>")
            .field("target", &self.target)
            .field("http_target", &self.http_target)
            .field("public_ip", &self.public_ip)
            .field("dial", &self.dial)
            .field("reconnect", &self.reconnect)
            .field("proxy_timeout", &self.proxy_timeout)
            .finish()
    }
}

/// HTTP base URL for a TCP target: port 443 implies TLS.
#[must_use]
pub fn http_target_for(target: &str) -> String {
    if target.rsplit_once(':').is_some_and(|(_, port)| port == "443") {
        format!("https://{target}")
    } else {
        format!("http://{target}")
    }
}

impl AgentConfig {
    /// Configuration with default policies for the given endpoints.
    #[must_use]
    pub fn new(relay_url: String, tunnel_token: String, cipher_key: [u8; KEY_LEN], target: String) -> Self {
        let http_target = http_target_for(&target);
        Self {
            relay_url,
            tunnel_token,
            cipher_key,
            target,
            http_target,
            public_ip: PublicIp::Disabled,
            dial: DialPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            proxy_timeout: Duration::from_secs(30),
        }
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.relay_url.starts_with("ws://") || self.relay_url.starts_with("wss://")) {
            return Err(format!(
                "relay URL must start with ws:// or wss://, got {}",
                self.relay_url
            ));
        }
        if self.tunnel_token.len() < MIN_TOKEN_LEN {
            return Err(format!(
                "tunnel token must be at least {MIN_TOKEN_LEN} characters"
            ));
        }
        if self.target.rsplit_once(':').map_or(true, |(host, port)| {
            host.is_empty() || port.parse::<u16>().is_err()
        }) {
            return Err(format!("target must be host:port, got {}", self.target));
        }
        if !(self.http_target.starts_with("http://") || self.http_target.starts_with("https://"))
        {
            return Err(format!(
                "HTTP target must start with http:// or https://, got {}",
                self.http_target
            ));
        }
        if self.dial.max_attempts == 0 {
            return Err("max dial attempts must be greater than 0".into());
        }
        if self.reconnect.initial.is_zero() {
            return Err("reconnect delay must be greater than 0".into());
        }
        if self.reconnect.initial > self.reconnect.max {
            return Err("reconnect delay must not exceed the maximum".into());
        }
        if self.reconnect.factor < 1.0 {
            return Err(format!(
                "backoff factor must be >= 1.0, got {}",
                self.reconnect.factor
            ));
        }
        if self.proxy_timeout.is_zero() {
            return Err("proxy timeout must be greater than 0".into());
        }
        Ok(())
    }
}

impl TryFrom<Args> for AgentConfig {
    type Error = String;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let key = parse_hex_key(args.chacha_key.trim()).map_err(|e| format!("TUNNEL_CHACHA_KEY: {e}"))?;
        let mut config = Self::new(args.relay, args.tunnel_token, key, args.target);
        if let Some(http_target) = args.http_target {
            config.http_target = http_target.trim_end_matches('/').to_string();
        }
        config.public_ip = match args.public_ip.as_deref().map(str::trim) {
            None | Some("") => PublicIp::Disabled,
            Some("auto") => PublicIp::Discover,
            Some(ip) => PublicIp::Fixed(ip.to_string()),
        };
        config.dial = DialPolicy {
            retry_delay: Duration::from_millis(args.retry_delay_ms),
            max_attempts: args.max_dial_attempts,
        };
        config.reconnect.initial = Duration::from_millis(args.reconnect_ms);
        config.reconnect.max = Duration::from_millis(args.reconnect_max_ms);
        config.proxy_timeout = Duration::from_millis(args.proxy_timeout_ms);
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_HEX: &str = "4242424242424242424242424242424242424242424242424242424242424242";

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec![
            "wgtc",
            "--relay",
            "ws://relay.test:8080/tunnel",
            "--tunnel-token",
            "wgt_0123456789abcdef",
            "--chacha-key",
            KEY_HEX,
        ];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn defaults_follow_target() {
        let config = AgentConfig::try_from(args(&[])).unwrap();
        assert_eq!(config.target, "127.0.0.1:443");
        assert_eq!(config.http_target, "https://127.0.0.1:443");
        assert_eq!(config.public_ip, PublicIp::Disabled);
        assert_eq!(config.cipher_key, [0x42; KEY_LEN]);

        let config = AgentConfig::try_from(args(&["--target", "10.0.0.5:8080"])).unwrap();
        assert_eq!(config.http_target, "http://10.0.0.5:8080");
    }

    #[test]
    fn explicit_http_target_and_hello() {
        let config = AgentConfig::try_from(args(&[
            "--http-target",
            "http://127.0.0.1:3000/",
            "--public-ip",
            "auto",
        ]))
        .unwrap();
        assert_eq!(config.http_target, "http://127.0.0.1:3000");
        assert_eq!(config.public_ip, PublicIp::Discover);

        let config = AgentConfig::try_from(args(&["--public-ip", "203.0.113.4"])).unwrap();
        assert_eq!(config.public_ip, PublicIp::Fixed("203.0.113.4".into()));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(AgentConfig::try_from(args(&["--target", "no-port"])).is_err());
        assert!(AgentConfig::try_from(args(&["--max-dial-attempts", "0"])).is_err());
        assert!(AgentConfig::try_from(args(&["--reconnect-ms", "90000"])).is_err());

        let mut config = AgentConfig::try_from(args(&[])).unwrap();
        config.relay_url = "http://relay.test/tunnel".into();
        assert!(config.validate().is_err());

        let mut config = AgentConfig::try_from(args(&[])).unwrap();
        config.tunnel_token = "short".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_key() {
        let argv = vec![
            "wgtc",
            "--relay",
            "ws://relay.test/tunnel",
            "--tunnel-token",
            "wgt_0123456789abcdef",
            "--chacha-key",
            "abcd",
        ];
        let err = AgentConfig::try_from(Args::parse_from(argv)).unwrap_err();
        assert!(err.contains("TUNNEL_CHACHA_KEY"));
    }

    #[test]
    fn debug_hides_secrets() {
        let config = AgentConfig::try_from(args(&[])).unwrap();
        let shown = format!("{config:?}");
        assert!(!shown.contains("wgt_0123456789abcdef"));
        assert!(shown.contains("<redacted>"));
    }
}
