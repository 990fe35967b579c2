//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "velo";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PROXY_PORT: u16 = 8080;
const DEFAULT_WEBHOOK_PORT: u16 = 8081;
const DEFAULT_WEBHOOK_PATH: &str = "/webhook";
const DEFAULT_ORIGIN_TIMEOUT_SECS: u64 = 10;
const DEFAULT_STRIP_SEGMENTS: usize = 1;
const DEFAULT_KEYSPACE: &str = "velo";
const DEFAULT_TTL_SECONDS: u64 = 600;
const DEFAULT_OP_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_DEBOUNCE_INTERVAL_MS: u64 = 1_000;
const DEFAULT_EVENT_BUFFER: usize = 256;

/// Command-line arguments for the Velo binary.
#[derive(Debug, Parser)]
#[command(name = "velo", version, about = "Velo caching item-API gateway")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "VELO_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the proxy and webhook listeners.
    Serve(Box<ServeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host for both the proxy and the webhook.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the proxy listener port.
    #[arg(long = "server-proxy-port", value_name = "PORT")]
    pub proxy_port: Option<u16>,

    /// Override the webhook listener port.
    #[arg(long = "server-webhook-port", value_name = "PORT")]
    pub webhook_port: Option<u16>,

    /// Override the webhook route path.
    #[arg(long = "server-webhook-path", value_name = "PATH")]
    pub webhook_path: Option<String>,

    /// Override the origin base URL.
    #[arg(long = "origin-base-url", value_name = "URL")]
    pub origin_base_url: Option<String>,

    /// Override the origin access token.
    #[arg(long = "origin-token", env = "VELO_ORIGIN_TOKEN", value_name = "TOKEN")]
    pub origin_token: Option<String>,

    /// Override the origin request timeout.
    #[arg(long = "origin-timeout-seconds", value_name = "SECONDS")]
    pub origin_timeout_seconds: Option<u64>,

    /// Override the number of path segments stripped before forwarding.
    #[arg(long = "origin-strip-segments", value_name = "COUNT")]
    pub origin_strip_segments: Option<usize>,

    /// Toggle the query-result cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Override the redis connection URL.
    #[arg(long = "cache-redis-url", value_name = "URL")]
    pub cache_redis_url: Option<String>,

    /// Override the cache entry time-to-live.
    #[arg(long = "cache-ttl-seconds", value_name = "SECONDS")]
    pub cache_ttl_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub origin: OriginSettings,
    pub cache: CacheSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub proxy_addr: SocketAddr,
    pub webhook_addr: SocketAddr,
    pub webhook_path: String,
}

#[derive(Debug, Clone)]
pub struct OriginSettings {
    pub base_url: Url,
    pub token: String,
    pub timeout: Duration,
    pub strip_segments: usize,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub redis_url: Option<String>,
    pub keyspace: String,
    pub ttl_seconds: u64,
    pub op_timeout_ms: u64,
    pub debounce_interval_ms: u64,
    pub event_buffer: usize,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("VELO").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    origin: RawOriginSettings,
    cache: RawCacheSettings,
    logging: RawLoggingSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.proxy_port {
            self.server.proxy_port = Some(port);
        }
        if let Some(port) = overrides.webhook_port {
            self.server.webhook_port = Some(port);
        }
        if let Some(path) = overrides.webhook_path.as_ref() {
            self.server.webhook_path = Some(path.clone());
        }
        if let Some(url) = overrides.origin_base_url.as_ref() {
            self.origin.base_url = Some(url.clone());
        }
        if let Some(token) = overrides.origin_token.as_ref() {
            self.origin.token = Some(token.clone());
        }
        if let Some(seconds) = overrides.origin_timeout_seconds {
            self.origin.timeout_seconds = Some(seconds);
        }
        if let Some(count) = overrides.origin_strip_segments {
            self.origin.strip_segments = Some(count);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(url) = overrides.cache_redis_url.as_ref() {
            self.cache.redis_url = Some(url.clone());
        }
        if let Some(ttl) = overrides.cache_ttl_seconds {
            self.cache.ttl_seconds = Some(ttl);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            origin,
            cache,
            logging,
        } = raw;

        let server = build_server_settings(server)?;
        let origin = build_origin_settings(origin)?;
        let cache = build_cache_settings(cache)?;
        let logging = build_logging_settings(logging)?;

        Ok(Self {
            server,
            origin,
            cache,
            logging,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let proxy_port = server.proxy_port.unwrap_or(DEFAULT_PROXY_PORT);
    if proxy_port == 0 {
        return Err(LoadError::invalid(
            "server.proxy_port",
            "port must be greater than zero",
        ));
    }

    let webhook_port = server.webhook_port.unwrap_or(DEFAULT_WEBHOOK_PORT);
    if webhook_port == 0 {
        return Err(LoadError::invalid(
            "server.webhook_port",
            "port must be greater than zero",
        ));
    }
    if webhook_port == proxy_port {
        return Err(LoadError::invalid(
            "server.webhook_port",
            "webhook and proxy listeners must use different ports",
        ));
    }

    let proxy_addr = parse_socket_addr(&host, proxy_port)
        .map_err(|reason| LoadError::invalid("server.proxy_addr", reason))?;
    let webhook_addr = parse_socket_addr(&host, webhook_port)
        .map_err(|reason| LoadError::invalid("server.webhook_addr", reason))?;

    let webhook_path = server
        .webhook_path
        .unwrap_or_else(|| DEFAULT_WEBHOOK_PATH.to_string());
    if !webhook_path.starts_with('/') {
        return Err(LoadError::invalid(
            "server.webhook_path",
            "path must start with `/`",
        ));
    }

    Ok(ServerSettings {
        proxy_addr,
        webhook_addr,
        webhook_path,
    })
}

fn build_origin_settings(origin: RawOriginSettings) -> Result<OriginSettings, LoadError> {
    let raw_url = origin
        .base_url
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| LoadError::invalid("origin.base_url", "a base URL is required"))?;

    // Relative paths join under the base, so it has to end with a slash.
    let normalized = if raw_url.ends_with('/') {
        raw_url.to_string()
    } else {
        format!("{raw_url}/")
    };
    let base_url = Url::parse(&normalized)
        .map_err(|err| LoadError::invalid("origin.base_url", format!("failed to parse: {err}")))?;

    let token = origin
        .token
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| LoadError::invalid("origin.token", "an access token is required"))?
        .to_string();

    let timeout_seconds = origin
        .timeout_seconds
        .unwrap_or(DEFAULT_ORIGIN_TIMEOUT_SECS);
    if timeout_seconds == 0 {
        return Err(LoadError::invalid(
            "origin.timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(OriginSettings {
        base_url,
        token,
        timeout: Duration::from_secs(timeout_seconds),
        strip_segments: origin.strip_segments.unwrap_or(DEFAULT_STRIP_SEGMENTS),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let enabled = cache.enabled.unwrap_or(true);

    let redis_url = cache.redis_url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    if enabled && redis_url.is_none() {
        return Err(LoadError::invalid(
            "cache.redis_url",
            "required while the cache is enabled",
        ));
    }

    let keyspace = cache
        .keyspace
        .unwrap_or_else(|| DEFAULT_KEYSPACE.to_string());
    if keyspace.trim().is_empty() {
        return Err(LoadError::invalid("cache.keyspace", "must not be empty"));
    }

    Ok(CacheSettings {
        enabled,
        redis_url,
        keyspace,
        ttl_seconds: cache.ttl_seconds.unwrap_or(DEFAULT_TTL_SECONDS),
        op_timeout_ms: cache.op_timeout_ms.unwrap_or(DEFAULT_OP_TIMEOUT_MS),
        debounce_interval_ms: cache
            .debounce_interval_ms
            .unwrap_or(DEFAULT_DEBOUNCE_INTERVAL_MS),
        event_buffer: cache.event_buffer.unwrap_or(DEFAULT_EVENT_BUFFER),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    proxy_port: Option<u16>,
    webhook_port: Option<u16>,
    webhook_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOriginSettings {
    base_url: Option<String>,
    token: Option<String>,
    timeout_seconds: Option<u64>,
    strip_segments: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    redis_url: Option<String>,
    keyspace: Option<String>,
    ttl_seconds: Option<u64>,
    op_timeout_ms: Option<u64>,
    debounce_interval_ms: Option<u64>,
    event_buffer: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_raw() -> RawSettings {
        let mut raw = RawSettings::default();
        raw.origin.base_url = Some("https://origin.example.com".to_string());
        raw.origin.token = Some("secret".to_string());
        raw.cache.redis_url = Some("redis://127.0.0.1/".to_string());
        raw
    }

    #[test]
    fn minimal_settings_resolve_with_defaults() {
        let settings = Settings::from_raw(minimal_raw()).expect("valid settings");

        assert_eq!(settings.server.proxy_addr.port(), DEFAULT_PROXY_PORT);
        assert_eq!(settings.server.webhook_addr.port(), DEFAULT_WEBHOOK_PORT);
        assert_eq!(settings.server.webhook_path, "/webhook");
        assert_eq!(settings.origin.timeout, Duration::from_secs(10));
        assert_eq!(settings.origin.strip_segments, 1);
        assert!(settings.cache.enabled);
        assert_eq!(settings.cache.ttl_seconds, 600);
    }

    #[test]
    fn base_url_gains_a_trailing_slash() {
        let settings = Settings::from_raw(minimal_raw()).expect("valid settings");
        assert_eq!(
            settings.origin.base_url.as_str(),
            "https://origin.example.com/"
        );
    }

    #[test]
    fn missing_origin_token_is_rejected() {
        let mut raw = minimal_raw();
        raw.origin.token = Some("   ".to_string());

        let err = Settings::from_raw(raw).expect_err("invalid settings");
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "origin.token",
                ..
            }
        ));
    }

    #[test]
    fn enabled_cache_requires_redis_url() {
        let mut raw = minimal_raw();
        raw.cache.redis_url = None;

        let err = Settings::from_raw(raw).expect_err("invalid settings");
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "cache.redis_url",
                ..
            }
        ));
    }

    #[test]
    fn disabled_cache_does_not_require_redis_url() {
        let mut raw = minimal_raw();
        raw.cache.enabled = Some(false);
        raw.cache.redis_url = None;

        let settings = Settings::from_raw(raw).expect("valid settings");
        assert!(!settings.cache.enabled);
        assert!(settings.cache.redis_url.is_none());
    }

    #[test]
    fn listeners_must_not_share_a_port() {
        let mut raw = minimal_raw();
        raw.server.proxy_port = Some(9000);
        raw.server.webhook_port = Some(9000);

        let err = Settings::from_raw(raw).expect_err("invalid settings");
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "server.webhook_port",
                ..
            }
        ));
    }

    #[test]
    fn webhook_path_must_be_rooted() {
        let mut raw = minimal_raw();
        raw.server.webhook_path = Some("webhook".to_string());

        let err = Settings::from_raw(raw).expect_err("invalid settings");
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "server.webhook_path",
                ..
            }
        ));
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = minimal_raw();
        raw.server.proxy_port = Some(4000);
        raw.logging.level = Some("info".to_string());

        let overrides = ServeOverrides {
            proxy_port: Some(4321),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };

        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.server.proxy_addr.port(), 4321);
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    }

    #[test]
    fn cli_json_logging_enforces_format() {
        let mut raw = minimal_raw();
        let overrides = ServeOverrides {
            log_json: Some(true),
            ..Default::default()
        };

        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert!(matches!(settings.logging.format, LogFormat::Json));
    }

    #[test]
    fn default_to_serve_command() {
        let args = CliArgs::parse_from(["velo"]);
        let command = args
            .command
            .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
        assert!(matches!(command, Command::Serve(_)));
    }

    #[test]
    fn parse_serve_overrides() {
        let args = CliArgs::parse_from([
            "velo",
            "serve",
            "--server-host",
            "0.0.0.0",
            "--origin-base-url",
            "https://origin.example.com",
            "--cache-enabled",
            "false",
        ]);

        match args.command.expect("serve command") {
            Command::Serve(serve) => {
                assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
                assert_eq!(
                    serve.overrides.origin_base_url.as_deref(),
                    Some("https://origin.example.com")
                );
                assert_eq!(serve.overrides.cache_enabled, Some(false));
            }
        }
    }
}
