//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "texrender";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_SCRATCH_SUBDIR: &str = "texrender";
const DEFAULT_COMPILE_MAX_CONCURRENT: u32 = 4;
const DEFAULT_COMPILE_DEADLINE_SECS: u64 = 60;
const DEFAULT_MAX_BODY_BYTES: u64 = 20 * 1024 * 1024;
pub(crate) const DEFAULT_LATEXML_PATH: &str = "latexmlc";
pub(crate) const DEFAULT_PDFLATEX_PATH: &str = "pdflatex";
pub(crate) const DEFAULT_COMPILE_TIMEOUT_SECS: u64 = 20;
pub(crate) const DEFAULT_ASSET_FETCH_TIMEOUT_SECS: u64 = 15;
pub(crate) const DEFAULT_ASSET_MAX_IN_FLIGHT: u32 = 4;
pub(crate) const DEFAULT_ASSET_MAX_BYTES: u64 = 20 * 1024 * 1024;

/// Command-line arguments for the texrender binary.
#[derive(Debug, Parser)]
#[command(name = "texrender", version, about = "LaTeX to HTML/PDF rendering service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TEXRENDER_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the rendering HTTP service.
    Serve(Box<ServeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CompileOverrides {
    /// Override the LaTeXML (`latexmlc`) executable path.
    #[arg(long = "compile-latexml-path", value_name = "PATH")]
    pub latexml_path: Option<PathBuf>,

    /// Override the pdflatex executable path.
    #[arg(long = "compile-pdflatex-path", value_name = "PATH")]
    pub pdflatex_path: Option<PathBuf>,

    /// Override the scratch directory holding per-request workspaces.
    #[arg(long = "compile-scratch-dir", value_name = "PATH")]
    pub scratch_dir: Option<PathBuf>,

    /// Override the per-invocation compiler time limit.
    #[arg(long = "compile-timeout-seconds", value_name = "SECONDS")]
    pub timeout_seconds: Option<u64>,

    /// Override the maximum number of concurrent compilations.
    #[arg(long = "compile-max-concurrent", value_name = "COUNT")]
    pub max_concurrent: Option<u32>,

    /// Override the overall per-request deadline.
    #[arg(long = "compile-deadline-seconds", value_name = "SECONDS")]
    pub deadline_seconds: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub compile: CompileOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

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

    /// Bearer key clients must present.
    #[arg(
        long = "api-key",
        env = "API_KEY",
        value_name = "KEY",
        hide_env_values = true
    )]
    pub api_key: Option<String>,

    /// Override the maximum accepted request body in bytes.
    #[arg(long = "max-body-bytes", value_name = "BYTES")]
    pub max_body_bytes: Option<u64>,

    /// Override the maximum number of concurrent asset downloads per request.
    #[arg(long = "assets-max-in-flight", value_name = "COUNT")]
    pub assets_max_in_flight: Option<u32>,

    /// Override the per-asset download timeout.
    #[arg(long = "assets-fetch-timeout-seconds", value_name = "SECONDS")]
    pub assets_fetch_timeout_seconds: Option<u64>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub auth: AuthSettings,
    pub compile: CompileSettings,
    pub assets: AssetSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
    pub max_body_bytes: NonZeroU64,
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

#[derive(Clone)]
pub struct AuthSettings {
    pub api_key: String,
}

impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CompileSettings {
    pub scratch_dir: PathBuf,
    pub latexml_path: PathBuf,
    pub pdflatex_path: PathBuf,
    pub timeout: Duration,
    pub max_concurrent: NonZeroU32,
    pub deadline: Duration,
}

#[derive(Debug, Clone)]
pub struct AssetSettings {
    pub fetch_timeout: Duration,
    pub max_in_flight: NonZeroU32,
    pub max_asset_bytes: NonZeroU64,
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

    builder = builder.add_source(Environment::with_prefix("TEXRENDER").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    auth: RawAuthSettings,
    compile: RawCompileSettings,
    assets: RawAssetSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(limit) = overrides.max_body_bytes {
            self.server.max_body_bytes = Some(limit);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(key) = overrides.api_key.as_ref() {
            self.auth.api_key = Some(key.clone());
        }
        if let Some(value) = overrides.assets_max_in_flight {
            self.assets.max_in_flight = Some(value);
        }
        if let Some(seconds) = overrides.assets_fetch_timeout_seconds {
            self.assets.fetch_timeout_seconds = Some(seconds);
        }

        self.apply_compile_overrides(&overrides.compile);
    }

    fn apply_compile_overrides(&mut self, overrides: &CompileOverrides) {
        if let Some(path) = overrides.latexml_path.as_ref() {
            self.compile.latexml_path = Some(path.clone());
        }
        if let Some(path) = overrides.pdflatex_path.as_ref() {
            self.compile.pdflatex_path = Some(path.clone());
        }
        if let Some(dir) = overrides.scratch_dir.as_ref() {
            self.compile.scratch_dir = Some(dir.clone());
        }
        if let Some(seconds) = overrides.timeout_seconds {
            self.compile.timeout_seconds = Some(seconds);
        }
        if let Some(value) = overrides.max_concurrent {
            self.compile.max_concurrent = Some(value);
        }
        if let Some(seconds) = overrides.deadline_seconds {
            self.compile.deadline_seconds = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            auth,
            compile,
            assets,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let auth = build_auth_settings(auth)?;
        let compile = build_compile_settings(compile)?;
        let assets = build_asset_settings(assets)?;

        Ok(Self {
            server,
            logging,
            auth,
            compile,
            assets,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    let max_body_value = server.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES);
    let max_body_bytes = NonZeroU64::new(max_body_value)
        .ok_or_else(|| LoadError::invalid("server.max_body_bytes", "must be greater than zero"))?;
    usize::try_from(max_body_value).map_err(|_| {
        LoadError::invalid(
            "server.max_body_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
        max_body_bytes,
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

fn build_auth_settings(auth: RawAuthSettings) -> Result<AuthSettings, LoadError> {
    let api_key = auth
        .api_key
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| LoadError::invalid("auth.api_key", "an API key is required"))?;

    Ok(AuthSettings { api_key })
}

fn build_compile_settings(compile: RawCompileSettings) -> Result<CompileSettings, LoadError> {
    let scratch_dir = compile
        .scratch_dir
        .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_SCRATCH_SUBDIR));
    if scratch_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "compile.scratch_dir",
            "path must not be empty",
        ));
    }

    let latexml_path = compile
        .latexml_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LATEXML_PATH));
    if latexml_path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "compile.latexml_path",
            "path must not be empty",
        ));
    }

    let pdflatex_path = compile
        .pdflatex_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PDFLATEX_PATH));
    if pdflatex_path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "compile.pdflatex_path",
            "path must not be empty",
        ));
    }

    let timeout = non_zero_secs(
        compile
            .timeout_seconds
            .unwrap_or(DEFAULT_COMPILE_TIMEOUT_SECS),
        "compile.timeout_seconds",
    )?;
    let deadline = non_zero_secs(
        compile
            .deadline_seconds
            .unwrap_or(DEFAULT_COMPILE_DEADLINE_SECS),
        "compile.deadline_seconds",
    )?;
    if deadline < timeout {
        return Err(LoadError::invalid(
            "compile.deadline_seconds",
            "must not be shorter than compile.timeout_seconds",
        ));
    }

    let max_concurrent = non_zero_u32(
        compile
            .max_concurrent
            .unwrap_or(DEFAULT_COMPILE_MAX_CONCURRENT)
            .into(),
        "compile.max_concurrent",
    )?;

    Ok(CompileSettings {
        scratch_dir,
        latexml_path,
        pdflatex_path,
        timeout,
        max_concurrent,
        deadline,
    })
}

fn build_asset_settings(assets: RawAssetSettings) -> Result<AssetSettings, LoadError> {
    let fetch_timeout = non_zero_secs(
        assets
            .fetch_timeout_seconds
            .unwrap_or(DEFAULT_ASSET_FETCH_TIMEOUT_SECS),
        "assets.fetch_timeout_seconds",
    )?;
    let max_in_flight = non_zero_u32(
        assets
            .max_in_flight
            .unwrap_or(DEFAULT_ASSET_MAX_IN_FLIGHT)
            .into(),
        "assets.max_in_flight",
    )?;
    let max_asset_bytes = NonZeroU64::new(assets.max_asset_bytes.unwrap_or(DEFAULT_ASSET_MAX_BYTES))
        .ok_or_else(|| LoadError::invalid("assets.max_asset_bytes", "must be greater than zero"))?;

    Ok(AssetSettings {
        fetch_timeout,
        max_in_flight,
        max_asset_bytes,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
    max_body_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Clone, Deserialize, Default)]
#[serde(default)]
struct RawAuthSettings {
    api_key: Option<String>,
}

impl std::fmt::Debug for RawAuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawAuthSettings")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCompileSettings {
    scratch_dir: Option<PathBuf>,
    latexml_path: Option<PathBuf>,
    pdflatex_path: Option<PathBuf>,
    timeout_seconds: Option<u64>,
    max_concurrent: Option<u32>,
    deadline_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAssetSettings {
    fetch_timeout_seconds: Option<u64>,
    max_in_flight: Option<u32>,
    max_asset_bytes: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_secs(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
