//! Configuration loading and constants.
//!
//! Loads the process manager configuration from TOML files and defines the
//! defaults for binding, worker management, logging, process settings and
//! trusted proxy headers. `ServerConfig` is the root configuration struct; it is
//! built once at startup and treated as immutable afterwards.

use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use const_format::formatcp;
use serde::{Deserialize, Serialize};

// =============================================================================
// Binding
// =============================================================================

/// Default interface the workers listen on
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default port the workers listen on
pub const DEFAULT_PORT: u16 = 8000;

pub const DEFAULT_BIND: &str = formatcp!("{}:{}", DEFAULT_HOST, DEFAULT_PORT);

/// Default listen backlog
pub const DEFAULT_BACKLOG: u32 = 2048;

// =============================================================================
// Worker Management
// =============================================================================

/// Maximum simultaneous requests per async worker
pub const DEFAULT_WORKER_CONNECTIONS: usize = 1000;

/// Seconds a request may stay in flight before its worker is killed
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Seconds a stopping worker gets to finish in-flight requests
pub const DEFAULT_GRACEFUL_TIMEOUT_SECS: u64 = 30;

/// Seconds an idle keep-alive connection is held open
pub const DEFAULT_KEEPALIVE_SECS: u64 = 5;

/// Requests served before a worker is recycled
pub const DEFAULT_MAX_REQUESTS: u64 = 1000;

/// Upper bound of the random amount added to `max_requests` per worker
pub const DEFAULT_MAX_REQUESTS_JITTER: u64 = 50;

// =============================================================================
// Development Server
// =============================================================================

pub const DEV_HOST: &str = "127.0.0.1";
pub const DEV_PORT: u16 = 5000;

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Default process name
pub const DEFAULT_PROC_NAME: &str = "storefront";

/// Log destination meaning "standard stream"
pub const LOG_TO_STD_STREAM: &str = "-";

/// Log filter used by the development server
pub const DEV_LOG_FILTER: &str = "storefront=debug,tower_http=debug";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

/// Environment variable carrying the serialized configuration to workers
pub const WORKER_CONFIG_ENV: &str = "STOREFRONT_WORKER_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Socket, worker and connection settings
    #[serde(default)]
    pub server: BindConfig,
    /// Access and error log settings
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Process naming and identity settings
    #[serde(default)]
    pub process: ProcessConfig,
    /// Optional TLS termination in the workers
    #[serde(default)]
    pub tls: TlsConfig,
    /// Trusted proxy headers
    #[serde(default)]
    pub proxy: ProxyConfig,
}

/// Concurrency model used inside each worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerClass {
    /// One request at a time per worker
    #[default]
    Sync,
    /// Event-driven, up to `worker_connections` requests at a time
    #[serde(alias = "gevent", alias = "eventlet", alias = "tornado", alias = "gthread")]
    Async,
}

impl std::fmt::Display for WorkerClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerClass::Sync => f.write_str("sync"),
            WorkerClass::Async => f.write_str("async"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BindConfig {
    /// host:port the workers listen on
    #[serde(default = "BindConfig::default_bind")]
    pub bind: String,
    /// Number of worker processes (default: 2 * CPUs + 1)
    pub workers: Option<usize>,
    #[serde(default)]
    pub worker_class: WorkerClass,
    #[serde(default = "BindConfig::default_worker_connections")]
    pub worker_connections: usize,
    /// Request deadline in seconds, 0 disables the watchdog
    #[serde(default = "BindConfig::default_timeout")]
    pub timeout: u64,
    #[serde(default = "BindConfig::default_graceful_timeout")]
    pub graceful_timeout: u64,
    /// Keep-alive idle window in seconds, 0 disables keep-alive
    #[serde(default = "BindConfig::default_keepalive")]
    pub keepalive: u64,
    /// Requests before recycling, 0 disables recycling
    #[serde(default = "BindConfig::default_max_requests")]
    pub max_requests: u64,
    #[serde(default = "BindConfig::default_max_requests_jitter")]
    pub max_requests_jitter: u64,
    #[serde(default = "BindConfig::default_backlog")]
    pub backlog: u32,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            bind: Self::default_bind(),
            workers: None,
            worker_class: WorkerClass::default(),
            worker_connections: Self::default_worker_connections(),
            timeout: Self::default_timeout(),
            graceful_timeout: Self::default_graceful_timeout(),
            keepalive: Self::default_keepalive(),
            max_requests: Self::default_max_requests(),
            max_requests_jitter: Self::default_max_requests_jitter(),
            backlog: Self::default_backlog(),
        }
    }
}

impl BindConfig {
    fn default_bind() -> String {
        DEFAULT_BIND.to_string()
    }
    fn default_worker_connections() -> usize {
        DEFAULT_WORKER_CONNECTIONS
    }
    fn default_timeout() -> u64 {
        DEFAULT_TIMEOUT_SECS
    }
    fn default_graceful_timeout() -> u64 {
        DEFAULT_GRACEFUL_TIMEOUT_SECS
    }
    fn default_keepalive() -> u64 {
        DEFAULT_KEEPALIVE_SECS
    }
    fn default_max_requests() -> u64 {
        DEFAULT_MAX_REQUESTS
    }
    fn default_max_requests_jitter() -> u64 {
        DEFAULT_MAX_REQUESTS_JITTER
    }
    fn default_backlog() -> u32 {
        DEFAULT_BACKLOG
    }

    /// Get worker count (default: 2 * available CPUs + 1)
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(default_worker_count)
    }

    /// Resolve `bind` to a socket address, looking up host names if needed.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .to_socket_addrs()
            .map_err(|e| ConfigError::Validation(format!("Invalid bind '{}': {}", self.bind, e)))?
            .next()
            .ok_or_else(|| {
                ConfigError::Validation(format!("Bind '{}' resolved to no address", self.bind))
            })
    }

    /// Maximum number of requests a worker serves at once
    pub fn concurrency_limit(&self) -> usize {
        match self.worker_class {
            WorkerClass::Sync => 1,
            WorkerClass::Async => self.worker_connections,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout)
    }

    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive > 0).then(|| Duration::from_secs(self.keepalive))
    }
}

/// `2 * CPUs + 1`, the usual sizing for blocking workers
pub fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus * 2 + 1
}

/// Diagnostic log level names accepted in the configuration file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    #[serde(alias = "warn")]
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Equivalent tracing level directive
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            // tracing has no level above error
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Access log destination: "-" for stdout, a file path, or absent to disable
    #[serde(default)]
    pub accesslog: Option<String>,
    /// Error log destination: "-" for stderr or a file path
    #[serde(default = "LoggingConfig::default_errorlog")]
    pub errorlog: String,
    #[serde(default)]
    pub loglevel: LogLevel,
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            accesslog: None,
            errorlog: Self::default_errorlog(),
            loglevel: LogLevel::default(),
            format: Self::default_format(),
        }
    }
}

impl LoggingConfig {
    fn default_errorlog() -> String {
        LOG_TO_STD_STREAM.to_string()
    }
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }

    /// Filter used when neither the command line nor RUST_LOG provides one
    pub fn default_filter(&self) -> String {
        let level = self.loglevel.as_directive();
        format!("storefront={level},tower_http={level}")
    }

    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

/// Process naming and identity
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProcessConfig {
    #[serde(default = "ProcessConfig::default_proc_name")]
    pub proc_name: String,
    /// Detach the supervisor from the controlling terminal
    #[serde(default)]
    pub daemon: bool,
    pub pidfile: Option<PathBuf>,
    /// Applied to the supervisor before spawning workers
    pub umask: Option<u32>,
    /// User name or numeric uid workers switch to after binding
    pub user: Option<String>,
    /// Group name or numeric gid workers switch to after binding
    pub group: Option<String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            proc_name: Self::default_proc_name(),
            daemon: false,
            pidfile: None,
            umask: None,
            user: None,
            group: None,
        }
    }
}

impl ProcessConfig {
    fn default_proc_name() -> String {
        DEFAULT_PROC_NAME.to_string()
    }
}

/// TLS termination inside the workers
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct TlsConfig {
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
}

impl TlsConfig {
    /// Certificate and key paths, if TLS is configured
    pub fn pem_files(&self) -> Option<(&Path, &Path)> {
        match (&self.certfile, &self.keyfile) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

/// Which forwarded-protocol headers are honoured, and from whom
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Header name -> value that marks the request as secure
    #[serde(default = "ProxyConfig::default_secure_scheme_headers")]
    pub secure_scheme_headers: BTreeMap<String, String>,
    /// Peer addresses allowed to set those headers ("*" trusts everyone)
    #[serde(default = "ProxyConfig::default_forwarded_allow_ips")]
    pub forwarded_allow_ips: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            secure_scheme_headers: Self::default_secure_scheme_headers(),
            forwarded_allow_ips: Self::default_forwarded_allow_ips(),
        }
    }
}

impl ProxyConfig {
    fn default_secure_scheme_headers() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("X-FORWARDED-PROTOCOL".to_string(), "ssl".to_string()),
            ("X-FORWARDED-PROTO".to_string(), "https".to_string()),
            ("X-FORWARDED-SSL".to_string(), "on".to_string()),
        ])
    }

    fn default_forwarded_allow_ips() -> Vec<String> {
        vec!["127.0.0.1".to_string(), "::1".to_string()]
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate a configuration document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the resolved configuration for hand-off to workers.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    /// Apply command line overrides, then re-validate.
    pub fn with_overrides(
        mut self,
        bind: Option<String>,
        workers: Option<usize>,
    ) -> Result<Self, ConfigError> {
        if let Some(bind) = bind {
            self.server.bind = bind;
        }
        if workers.is_some() {
            self.server.workers = workers;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.socket_addr()?;

        if self.server.workers == Some(0) {
            return Err(ConfigError::Validation(
                "server.workers must be at least 1".to_string(),
            ));
        }
        if self.server.worker_connections == 0 {
            return Err(ConfigError::Validation(
                "server.worker_connections must be at least 1".to_string(),
            ));
        }
        if self.tls.certfile.is_some() != self.tls.keyfile.is_some() {
            return Err(ConfigError::Validation(
                "tls.certfile and tls.keyfile must be set together".to_string(),
            ));
        }
        if self.process.proc_name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "process.proc_name must not be empty".to_string(),
            ));
        }

        // Parsing the trust list surfaces bad header names and addresses
        crate::proxy::ProxyTrust::from_config(&self.proxy)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_deployment_defaults() {
        let config = ServerConfig::from_toml_str("").unwrap();

        assert_eq!(config.server.bind, "0.0.0.0:8000");
        assert_eq!(config.server.worker_class, WorkerClass::Sync);
        assert_eq!(config.server.worker_connections, 1000);
        assert_eq!(config.server.timeout, 120);
        assert_eq!(config.server.keepalive, 5);
        assert_eq!(config.server.max_requests, 1000);
        assert_eq!(config.server.max_requests_jitter, 50);
        assert_eq!(config.logging.accesslog, None);
        assert_eq!(config.logging.errorlog, "-");
        assert_eq!(config.logging.loglevel, LogLevel::Info);
        assert!(!config.process.daemon);
        assert!(config.process.pidfile.is_none());
        assert_eq!(config.proxy.secure_scheme_headers.len(), 3);
        assert_eq!(
            config.proxy.secure_scheme_headers.get("X-FORWARDED-PROTO"),
            Some(&"https".to_string())
        );
    }

    #[test]
    fn test_default_worker_count_formula() {
        let config = ServerConfig::default();
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        assert_eq!(config.server.worker_count(), cpus * 2 + 1);
    }

    #[test]
    fn test_full_document() {
        let config = ServerConfig::from_toml_str(
            r#"
            [server]
            bind = "127.0.0.1:9000"
            workers = 3
            worker_class = "gevent"
            timeout = 0
            keepalive = 0

            [logging]
            accesslog = "/var/log/storefront/access.log"
            loglevel = "warning"
            format = "json"

            [process]
            proc_name = "flask_ecommerce"
            umask = 0o022

            [proxy]
            forwarded_allow_ips = ["*"]
            [proxy.secure_scheme_headers]
            X-Forwarded-Proto = "https"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.worker_count(), 3);
        assert_eq!(config.server.worker_class, WorkerClass::Async);
        assert_eq!(config.server.concurrency_limit(), 1000);
        assert_eq!(config.server.timeout(), None);
        assert_eq!(config.server.keepalive(), None);
        assert_eq!(config.logging.loglevel.as_directive(), "warn");
        assert!(config.logging.is_json());
        assert_eq!(config.process.umask, Some(0o022));
        assert_eq!(config.proxy.secure_scheme_headers.len(), 1);
    }

    #[test]
    fn test_sync_worker_serves_one_request_at_a_time() {
        let config = ServerConfig::default();
        assert_eq!(config.server.concurrency_limit(), 1);
    }

    #[test]
    fn test_default_filter_follows_loglevel() {
        let mut logging = LoggingConfig::default();
        assert_eq!(logging.default_filter(), "storefront=info,tower_http=info");
        logging.loglevel = LogLevel::Critical;
        assert_eq!(logging.default_filter(), "storefront=error,tower_http=error");
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = ServerConfig::from_toml_str("[server]\nworkers = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_unresolvable_bind_rejected() {
        let err = ServerConfig::from_toml_str("[server]\nbind = \"no-port-here\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_half_tls_rejected() {
        let err = ServerConfig::from_toml_str("[tls]\ncertfile = \"/etc/cert.pem\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_bad_header_name_rejected() {
        let err = ServerConfig::from_toml_str(
            "[proxy.secure_scheme_headers]\n\"X Forwarded\" = \"https\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_header_listed_twice_rejected() {
        let err = ServerConfig::from_toml_str(
            "[proxy.secure_scheme_headers]\nX-FORWARDED-PROTO = \"https\"\nx-forwarded-proto = \"on\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_bad_allow_ip_rejected() {
        let err = ServerConfig::from_toml_str("[proxy]\nforwarded_allow_ips = [\"10.0.0\"]\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_unknown_worker_class_rejected() {
        let err = ServerConfig::from_toml_str("[server]\nworker_class = \"threads\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::default()
            .with_overrides(Some("127.0.0.1:0".to_string()), Some(2))
            .unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:0");
        assert_eq!(config.server.worker_count(), 2);

        let err = ServerConfig::default()
            .with_overrides(None, Some(0))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_worker_handoff_preserves_config() {
        let mut config = ServerConfig::default();
        config.server.workers = Some(4);
        config.process.pidfile = Some(PathBuf::from("/run/storefront.pid"));
        config.logging.accesslog = Some("-".to_string());

        let serialized = config.to_toml_string().unwrap();
        let restored = ServerConfig::from_toml_str(&serialized).unwrap();

        assert_eq!(restored, config);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nbind = \"127.0.0.1:8080\"\nworkers = 2").unwrap();

        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.server.worker_count(), 2);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ServerConfig::load("/nonexistent/storefront.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
