use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use wgt_common::cipher::parse_hex_key;
use wgt_common::types::KEY_LEN;

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "wgts")]
#[command(about = "waitgate relay server")]
#[command(version)]
pub struct Args {
    /// Public socket address for raw TCP and HTTP traffic.
    #[arg(long, default_value = "0.0.0.0:8000", env = "WGTS_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "WGTS_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Bearer token the agent must present on `/tunnel`.
    #[arg(long, env = "TUNNEL_TOKEN", hide_env_values = true)]
    pub tunnel_token: String,
    /// Shared ChaCha20-Poly1305 key, 64 hex characters.
    #[arg(long, env = "TUNNEL_CHACHA_KEY", hide_env_values = true)]
    pub chacha_key: String,
    /// Rate-limit window in milliseconds.
    #[arg(long, default_value = "60000", env = "RL_WINDOW_MS")]
    pub rl_window_ms: u64,
    /// Maximum requests per source address per window.
    #[arg(long, default_value = "100", env = "RL_MAX")]
    pub rl_max: u32,
    /// Ban duration in milliseconds once a source exceeds the limit.
    #[arg(long, default_value = "300000", env = "RL_BAN_MS")]
    pub rl_ban_ms: u64,
    /// Number of simultaneously banned sources that trips the global ban.
    #[arg(long, default_value = "100", env = "RL_GLOBAL_THRESHOLD")]
    pub rl_global_threshold: usize,
    /// Global ban duration in milliseconds.
    #[arg(long, default_value = "60000", env = "RL_GLOBAL_BAN_MS")]
    pub rl_global_ban_ms: u64,
    /// Addresses that are never throttled (comma separated).
    #[arg(long, env = "WHITELIST_IPS", value_delimiter = ',')]
    pub whitelist: Vec<IpAddr>,
    /// HTTP connections must deliver request headers within this many milliseconds.
    #[arg(long, default_value = "15000", env = "HTTP_IDLE_TIMEOUT_MS")]
    pub http_idle_timeout_ms: u64,
    /// Pending proxied HTTP requests fail with 504 after this many milliseconds.
    #[arg(long, default_value = "30000", env = "WGTS_PROXY_TIMEOUT_MS")]
    pub proxy_timeout_ms: u64,
    /// Optional HTML page served (with 502) while no agent is attached.
    #[arg(long, env = "WGTS_FALLBACK_PAGE")]
    pub fallback_page: Option<PathBuf>,
    /// Take the client address from `X-Forwarded-For` on HTTP requests.
    #[arg(long, env = "WGTS_TRUST_FORWARDED")]
    pub trust_forwarded: bool,
    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Per-stream buffering policy of the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPolicy {
    /// Delay before the first buffered bytes are flushed as one frame.
    pub flush_delay: Duration,
    /// Streams with no traffic at all after registration are dropped after this.
    pub idle_timeout: Duration,
    /// Hard ceiling on bytes buffered before the first flush.
    pub max_init_buffer: usize,
    /// Size of a single local read.
    pub read_chunk: usize,
}

impl Default for StreamPolicy {
    fn default() -> Self {
        Self {
            flush_delay: Duration::from_millis(50),
            idle_timeout: Duration::from_secs(30),
            max_init_buffer: 256 * 1024,
            read_chunk: 16 * 1024,
        }
    }
}

/// Throttling and ban parameters of the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Counting window `W`.
    pub window: Duration,
    /// Requests `N` allowed per window before a ban.
    pub max_requests: u32,
    /// Ban duration `B`.
    pub ban_duration: Duration,
    /// Banned-source count that must be exceeded to raise the global ban.
    pub global_threshold: usize,
    /// How long the global ban lasts once raised.
    pub global_ban_duration: Duration,
    /// Sources inactive and unbanned for this many windows are evicted.
    pub purge_after_windows: u32,
    /// Interval of the eviction sweep.
    pub sweep_interval: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 100,
            ban_duration: Duration::from_secs(300),
            global_threshold: 100,
            global_ban_duration: Duration::from_secs(60),
            purge_after_windows: 20,
            sweep_interval: Duration::from_secs(600),
        }
    }
}

/// Runtime configuration derived from [`Args`].
#[derive(Clone)]
pub struct RelayConfig {
    /// Public socket address.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// Bearer token expected on the control-channel upgrade.
    pub tunnel_token: String,
    /// Shared frame key.
    pub cipher_key: [u8; KEY_LEN],
    /// Rate limiter parameters.
    pub rate_limit: RateLimitPolicy,
    /// Statically whitelisted sources.
    pub whitelist: Vec<IpAddr>,
    /// Multiplexer buffering policy.
    pub stream: StreamPolicy,
    /// Header read timeout for HTTP connections.
    pub http_idle_timeout: Duration,
    /// Correlation timeout for proxied HTTP requests.
    pub proxy_timeout: Duration,
    /// Hard ceiling on a proxied request body.
    pub max_body: usize,
    /// HTML body served while no agent is attached.
    pub fallback_page: Option<PathBuf>,
    /// Trust `X-Forwarded-For` on HTTP requests.
    pub trust_forwarded: bool,
    /// Interval between WebSocket pings on the control channel.
    pub ping_interval: Duration,
    /// Control channel is dropped after this long without inbound traffic.
    pub channel_idle_timeout: Duration,
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("listen", &self.listen)
            .field("metrics_addr", &self.metrics_addr)
            .field("rate_limit", &self.rate_limit)
            .field("whitelist", &self.whitelist)
            .field("stream", &self.stream)
            .field("http_idle_timeout", &self.http_idle_timeout)
            .field("proxy_timeout", &self.proxy_timeout)
            .field("max_body", &self.max_body)
            .field("fallback_page", &self.fallback_page)
            .field("trust_forwarded", &self.trust_forwarded)
            .finish_non_exhaustive()
    }
}

/// Hard ceiling on a proxied HTTP request body (10 MiB).
pub const DEFAULT_MAX_BODY: usize = 10 * 1024 * 1024;

impl RelayConfig {
    /// Builds a configuration with default tuning around the two secrets.
    #[must_use]
    pub fn new(listen: SocketAddr, tunnel_token: String, cipher_key: [u8; KEY_LEN]) -> Self {
        Self {
            listen,
            metrics_addr: "127.0.0.1:9090".parse().unwrap_or(listen),
            tunnel_token,
            cipher_key,
            rate_limit: RateLimitPolicy::default(),
            whitelist: Vec::new(),
            stream: StreamPolicy::default(),
            http_idle_timeout: Duration::from_secs(15),
            proxy_timeout: Duration::from_secs(30),
            max_body: DEFAULT_MAX_BODY,
            fallback_page: None,
            trust_forwarded: false,
            ping_interval: Duration::from_secs(30),
            channel_idle_timeout: Duration::from_secs(120),
        }
    }

    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.tunnel_token.trim().is_empty() {
            return Err("tunnel_token must not be empty".to_string());
        }
        if self.tunnel_token.len() < 16 {
            return Err("tunnel_token is too short (minimum 16 characters)".to_string());
        }

        let rl = &self.rate_limit;
        if rl.window.is_zero() {
            return Err("rl_window_ms must be greater than 0".to_string());
        }
        if rl.window > Duration::from_secs(86_400) {
            return Err("rl_window_ms exceeds reasonable limit (1 day)".to_string());
        }
        if rl.max_requests == 0 {
            return Err("rl_max must be greater than 0".to_string());
        }
        if rl.ban_duration.is_zero() {
            return Err("rl_ban_ms must be greater than 0".to_string());
        }
        if rl.ban_duration > Duration::from_secs(7 * 86_400) {
            return Err("rl_ban_ms exceeds reasonable limit (7 days)".to_string());
        }
        if rl.global_threshold == 0 {
            return Err("rl_global_threshold must be greater than 0".to_string());
        }
        if rl.global_ban_duration.is_zero() {
            return Err("rl_global_ban_ms must be greater than 0".to_string());
        }
        if rl.global_ban_duration > Duration::from_secs(86_400) {
            return Err("rl_global_ban_ms exceeds reasonable limit (1 day)".to_string());
        }

        if self.http_idle_timeout.is_zero() {
            return Err("http_idle_timeout_ms must be greater than 0".to_string());
        }
        if self.proxy_timeout.is_zero() {
            return Err("proxy_timeout_ms must be greater than 0".to_string());
        }
        if self.proxy_timeout > Duration::from_secs(3600) {
            return Err("proxy_timeout_ms exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.stream.max_init_buffer == 0 {
            return Err("max_init_buffer must be greater than 0".to_string());
        }
        if self.stream.read_chunk == 0 {
            return Err("read_chunk must be greater than 0".to_string());
        }
        if self.stream.flush_delay >= self.stream.idle_timeout {
            return Err("stream flush delay must be shorter than its idle timeout".to_string());
        }
        if self.max_body == 0 {
            return Err("max_body must be greater than 0".to_string());
        }
        Ok(())
    }
}

impl TryFrom<Args> for RelayConfig {
    type Error = String;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let cipher_key = parse_hex_key(&args.chacha_key)
            .map_err(|_| "TUNNEL_CHACHA_KEY must be 64 hex characters".to_string())?;

        let mut config = Self::new(args.listen, args.tunnel_token.trim().to_string(), cipher_key);
        config.metrics_addr = args.metrics_addr;
        config.rate_limit = RateLimitPolicy {
            window: Duration::from_millis(args.rl_window_ms),
            max_requests: args.rl_max,
            ban_duration: Duration::from_millis(args.rl_ban_ms),
            global_threshold: args.rl_global_threshold,
            global_ban_duration: Duration::from_millis(args.rl_global_ban_ms),
            ..RateLimitPolicy::default()
        };
        config.whitelist = args.whitelist;
        config.http_idle_timeout = Duration::from_millis(args.http_idle_timeout_ms);
        config.proxy_timeout = Duration::from_millis(args.proxy_timeout_ms);
        config.fallback_page = args.fallback_page;
        config.trust_forwarded = args.trust_forwarded;
        Ok(config)
    }
}
