use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Default config file looked up when no path is given on the command line
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// Global configuration for the front door
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Public listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Global default settings for backends
    #[serde(default)]
    pub defaults: BackendDefaults,

    /// Supervised backends keyed by name
    #[serde(default)]
    pub backends: BTreeMap<String, BackendConfig>,

    /// Chat completion settings for `POST /api/chat`
    #[serde(default)]
    pub chat: ChatConfig,
}

/// What the placeholder listener answers on non-health paths
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderMode {
    /// Plain "OK"
    Ok,
    /// Branded page with a meta refresh
    #[default]
    LoadingPage,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public port (default: 5000, overridden by `PORT`)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Path answered with 200 "OK" in every phase
    #[serde(default = "default_public_health_path")]
    pub health_path: String,

    /// Directory holding the built landing page
    #[serde(default = "default_static_dir")]
    pub static_dir: String,

    /// Document served for unknown paths (single-page-app fallback)
    #[serde(default = "default_index_file")]
    pub index_file: String,

    /// Placeholder behaviour while backends start
    #[serde(default)]
    pub placeholder: PlaceholderMode,

    /// Title shown on the loading page
    #[serde(default = "default_brand")]
    pub brand: String,

    /// Meta refresh interval of the loading page in seconds
    #[serde(default = "default_loading_refresh")]
    pub loading_refresh_secs: u64,

    /// Max time a proxied request may take in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Time allowed for listener tasks to finish on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            health_path: default_public_health_path(),
            static_dir: default_static_dir(),
            index_file: default_index_file(),
            placeholder: PlaceholderMode::default(),
            brand: default_brand(),
            loading_refresh_secs: default_loading_refresh(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendDefaults {
    /// Default health endpoint path
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Relaunches allowed after unexpected exits before a backend is left down
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Delay before relaunching a crashed backend in milliseconds
    #[serde(default = "default_restart_cooldown")]
    pub restart_cooldown_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Probe attempts while waiting for backends at startup
    #[serde(default = "default_startup_probe_attempts")]
    pub startup_probe_attempts: u32,

    /// First delay between startup probes in milliseconds
    #[serde(default = "default_startup_probe_delay")]
    pub startup_probe_delay_ms: u64,

    /// Probe attempts made while a request waits for its backend
    #[serde(default = "default_request_probe_attempts")]
    pub request_probe_attempts: u32,

    /// First delay between request-time probes in milliseconds
    #[serde(default = "default_request_probe_delay")]
    pub request_probe_delay_ms: u64,

    /// Ceiling for the probe backoff in milliseconds
    #[serde(default = "default_probe_max_delay")]
    pub probe_max_delay_ms: u64,

    /// Timeout of a single health request in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Interval of the keepalive probe once a backend is up, in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
}

impl BackendDefaults {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

impl Default for BackendDefaults {
    fn default() -> Self {
        Self {
            health_path: default_health_path(),
            max_restarts: default_max_restarts(),
            restart_cooldown_ms: default_restart_cooldown(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            startup_probe_attempts: default_startup_probe_attempts(),
            startup_probe_delay_ms: default_startup_probe_delay(),
            request_probe_attempts: default_request_probe_attempts(),
            request_probe_delay_ms: default_request_probe_delay(),
            probe_max_delay_ms: default_probe_max_delay(),
            probe_timeout_ms: default_probe_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
        }
    }
}

/// Configuration for a single backend
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the permissions of the
/// front door. Configuration files must only be writable by the service user.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Command that starts the backend. A single string is split with shell
    /// quoting rules when `args` is empty. Without a command the backend is
    /// treated as externally managed and only probed.
    pub command: Option<String>,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Environment overrides for the child process
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Port the backend listens on (always on 127.0.0.1)
    pub port: u16,

    /// Public path prefix routed to this backend, e.g. `/admin`
    pub base_path: String,

    /// Strip `base_path` before forwarding (default: true)
    #[serde(default = "default_strip_prefix")]
    pub strip_prefix: bool,

    /// Health check endpoint path (overrides default)
    pub health_path: Option<String>,

    /// Restart budget (overrides default)
    pub max_restarts: Option<u32>,

    /// Restart cooldown in milliseconds (overrides default)
    pub restart_cooldown_ms: Option<u64>,

    /// Grace period in seconds between SIGTERM and SIGKILL (overrides default)
    pub shutdown_grace_period_secs: Option<u64>,
}

impl BackendConfig {
    /// Create a supervised backend config with defaults
    pub fn local(command: &str, port: u16, base_path: &str) -> Self {
        Self {
            command: Some(command.to_string()),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            port,
            base_path: base_path.to_string(),
            strip_prefix: true,
            health_path: None,
            max_restarts: None,
            restart_cooldown_ms: None,
            shutdown_grace_period_secs: None,
        }
    }

    /// Create a backend that is reached and probed but never spawned
    pub fn external(port: u16, base_path: &str) -> Self {
        Self {
            command: None,
            ..Self::local("", port, base_path)
        }
    }

    /// Set arguments for this backend config (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Whether the front door spawns this backend itself
    pub fn is_supervised(&self) -> bool {
        self.command.is_some()
    }

    /// Resolve the program and its arguments
    pub fn argv(&self) -> anyhow::Result<(String, Vec<String>)> {
        let command = self
            .command
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Backend has no command"))?;

        if !self.args.is_empty() {
            return Ok((command.to_string(), self.args.clone()));
        }

        let mut words = shell_words::split(command)
            .map_err(|e| anyhow::anyhow!("Invalid command '{}': {}", command, e))?;
        if words.is_empty() {
            anyhow::bail!("Backend command is empty");
        }
        let program = words.remove(0);
        Ok((program, words))
    }

    pub fn health_path<'a>(&'a self, defaults: &'a BackendDefaults) -> &'a str {
        self.health_path
            .as_deref()
            .unwrap_or(&defaults.health_path)
    }

    pub fn max_restarts(&self, defaults: &BackendDefaults) -> u32 {
        self.max_restarts.unwrap_or(defaults.max_restarts)
    }

    pub fn restart_cooldown(&self, defaults: &BackendDefaults) -> Duration {
        Duration::from_millis(
            self.restart_cooldown_ms
                .unwrap_or(defaults.restart_cooldown_ms),
        )
    }

    pub fn shutdown_grace_period(&self, defaults: &BackendDefaults) -> Duration {
        Duration::from_secs(
            self.shutdown_grace_period_secs
                .unwrap_or(defaults.shutdown_grace_period_secs),
        )
    }

    /// Validate the backend configuration
    pub fn validate(&self, name: &str) -> Result<(), String> {
        if let Some(command) = &self.command {
            if command.trim().is_empty() {
                return Err(format!("Backend '{}': 'command' must not be empty", name));
            }
            if self.args.is_empty() {
                if let Err(e) = shell_words::split(command) {
                    return Err(format!("Backend '{}': invalid 'command': {}", name, e));
                }
            }
        }

        if self.port == 0 {
            return Err(format!(
                "Backend '{}': 'port' must be greater than 0",
                name
            ));
        }

        if !self.base_path.starts_with('/') || self.base_path.len() < 2 || self.base_path.ends_with('/') {
            return Err(format!(
                "Backend '{}': 'base_path' must look like '/name' (got '{}')",
                name, self.base_path
            ));
        }

        if !self.health_path.as_deref().map_or(true, |p| p.starts_with('/')) {
            return Err(format!(
                "Backend '{}': 'health_path' must start with '/'",
                name
            ));
        }

        Ok(())
    }
}

/// Settings for the chat completion forwarder
#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    /// OpenAI-compatible chat completions endpoint
    #[serde(default = "default_chat_api_url")]
    pub api_url: String,

    /// Model name sent with every request
    #[serde(default = "default_chat_model")]
    pub model: String,

    /// Bearer token; normally supplied through `CHAT_API_KEY`
    pub api_key: Option<String>,

    /// System prompt prepended to the conversation
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    #[serde(default = "default_chat_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_chat_temperature")]
    pub temperature: f32,

    /// Timeout of the outbound request in seconds
    #[serde(default = "default_chat_timeout")]
    pub timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_url: default_chat_api_url(),
            model: default_chat_model(),
            api_key: None,
            system_prompt: default_system_prompt(),
            max_tokens: default_chat_max_tokens(),
            temperature: default_chat_temperature(),
            timeout_secs: default_chat_timeout(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    5000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_public_health_path() -> String {
    "/health".to_string()
}

fn default_static_dir() -> String {
    "dist/public".to_string()
}

fn default_index_file() -> String {
    "index.html".to_string()
}

fn default_brand() -> String {
    "Enrollment".to_string()
}

fn default_loading_refresh() -> u64 {
    3
}

fn default_request_timeout() -> u64 {
    60 // backends can be slow on a cold start
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_cooldown() -> u64 {
    2000
}

fn default_shutdown_grace_period() -> u64 {
    10
}

fn default_startup_probe_attempts() -> u32 {
    40
}

fn default_startup_probe_delay() -> u64 {
    500
}

fn default_request_probe_attempts() -> u32 {
    6
}

fn default_request_probe_delay() -> u64 {
    250
}

fn default_probe_max_delay() -> u64 {
    2000
}

fn default_probe_timeout() -> u64 {
    3000
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_strip_prefix() -> bool {
    true
}

fn default_chat_api_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_system_prompt() -> String {
    "You are a helpful assistant for a vehicle program enrollment site. \
     Answer questions about enrolling, requirements and rates briefly and politely."
        .to_string()
}

fn default_chat_max_tokens() -> u32 {
    500
}

fn default_chat_temperature() -> f32 {
    0.7
}

fn default_chat_timeout() -> u64 {
    30
}

/// Environment shared by the canonical Streamlit backends
fn streamlit_env() -> HashMap<String, String> {
    [
        ("STREAMLIT_SERVER_HEADLESS", "true"),
        ("STREAMLIT_SERVER_ENABLE_CORS", "false"),
        ("STREAMLIT_SERVER_ENABLE_XSRF_PROTECTION", "false"),
        ("STREAMLIT_BROWSER_GATHER_USAGE_STATS", "false"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn streamlit_backend(script: &str, port: u16, base_path: &str) -> BackendConfig {
    let mut backend = BackendConfig::local(
        &format!("streamlit run {} --server.port {} --server.address 127.0.0.1", script, port),
        port,
        base_path,
    )
    .with_env(streamlit_env());
    backend.health_path = Some("/_stcore/health".to_string());
    backend
}

impl Default for Config {
    /// The production layout: enrollment wizard at `/enroll`, admin dashboard at `/admin`
    fn default() -> Self {
        let mut backends = BTreeMap::new();
        backends.insert(
            "enroll".to_string(),
            streamlit_backend("enrollment_app.py", 8000, "/enroll"),
        );
        backends.insert(
            "admin".to_string(),
            streamlit_backend("admin_app.py", 8001, "/admin"),
        );

        Self {
            server: ServerConfig::default(),
            defaults: BackendDefaults::default(),
            backends,
            chat: ChatConfig::default(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load an explicit path, or `config.toml` when present, or the built-in layout
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::load(DEFAULT_CONFIG_FILE),
            None => Ok(Self::default()),
        }
    }

    /// Apply `PORT`, `BIND`, `STATIC_DIR` and the `CHAT_*` variables
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid PORT '{}': {}", port, e))?;
        }
        if let Some(bind) = lookup("BIND") {
            self.server.bind = bind;
        }
        if let Some(dir) = lookup("STATIC_DIR") {
            self.server.static_dir = dir;
        }
        if let Some(key) = lookup("CHAT_API_KEY").filter(|k| !k.is_empty()) {
            self.chat.api_key = Some(key);
        }
        if let Some(url) = lookup("CHAT_API_URL") {
            self.chat.api_url = url;
        }
        if let Some(model) = lookup("CHAT_MODEL") {
            self.chat.model = model;
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for (name, backend) in &self.backends {
            if let Err(e) = backend.validate(name) {
                errors.push(e);
            }
        }

        let mut ports = HashSet::new();
        let mut prefixes = HashSet::new();
        for (name, backend) in &self.backends {
            if !ports.insert(backend.port) {
                errors.push(format!("Backend '{}': port {} is used twice", name, backend.port));
            }
            if !prefixes.insert(backend.base_path.as_str()) {
                errors.push(format!(
                    "Backend '{}': base_path '{}' is used twice",
                    name, backend.base_path
                ));
            }
            if backend.base_path == self.server.health_path || backend.base_path == "/api" {
                errors.push(format!(
                    "Backend '{}': base_path '{}' is reserved",
                    name, backend.base_path
                ));
            }
        }

        if !self.server.health_path.starts_with('/') {
            errors.push("server.health_path must start with '/'".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "127.0.0.1"
static_dir = "/srv/www"
placeholder = "ok"

[defaults]
max_restarts = 3
restart_cooldown_ms = 100
health_path = "/healthz"

[backends.enroll]
command = "streamlit run enrollment_app.py"
port = 8000
base_path = "/enroll"

[backends.admin]
command = "python"
args = ["-m", "http.server", "8001"]
port = 8001
base_path = "/admin"
max_restarts = 1
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.placeholder, PlaceholderMode::Ok);
        assert_eq!(config.defaults.max_restarts, 3);
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends["admin"].max_restarts(&config.defaults), 1);
        assert_eq!(config.backends["enroll"].max_restarts(&config.defaults), 3);
        assert_eq!(config.backends["enroll"].health_path(&config.defaults), "/healthz");
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 5000);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.health_path, "/health");
        assert_eq!(config.placeholder, PlaceholderMode::LoadingPage);
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_default_backend_defaults() {
        let defaults = BackendDefaults::default();
        assert_eq!(defaults.max_restarts, 5);
        assert_eq!(defaults.restart_cooldown_ms, 2000);
        assert_eq!(defaults.probe_max_delay_ms, 2000);
        assert_eq!(defaults.probe_timeout_ms, 3000);
        assert_eq!(defaults.keepalive_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_canonical_layout() {
        let config = Config::default();
        config.validate().unwrap();

        let enroll = &config.backends["enroll"];
        assert_eq!(enroll.port, 8000);
        assert_eq!(enroll.base_path, "/enroll");
        assert_eq!(enroll.health_path(&config.defaults), "/_stcore/health");
        assert_eq!(enroll.env["STREAMLIT_SERVER_HEADLESS"], "true");
        assert_eq!(enroll.env["STREAMLIT_SERVER_ENABLE_XSRF_PROTECTION"], "false");

        let admin = &config.backends["admin"];
        assert_eq!(admin.port, 8001);
        assert_eq!(admin.base_path, "/admin");
    }

    #[test]
    fn test_argv_splits_command_string() {
        let backend = BackendConfig::local("streamlit run 'my app.py' --server.port 8000", 8000, "/enroll");
        let (program, args) = backend.argv().unwrap();
        assert_eq!(program, "streamlit");
        assert_eq!(args, vec!["run", "my app.py", "--server.port", "8000"]);
    }

    #[test]
    fn test_argv_prefers_explicit_args() {
        let backend = BackendConfig::local("python3", 8000, "/enroll")
            .with_args(vec!["-m".to_string(), "http.server".to_string()]);
        let (program, args) = backend.argv().unwrap();
        assert_eq!(program, "python3");
        assert_eq!(args, vec!["-m", "http.server"]);
    }

    #[test]
    fn test_external_backend_is_not_supervised() {
        let backend = BackendConfig::external(9000, "/ext");
        assert!(!backend.is_supervised());
        assert!(backend.argv().is_err());
        backend.validate("ext").unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_base_paths() {
        for bad in ["admin", "/", "/admin/", ""] {
            let backend = BackendConfig::local("app", 8000, bad);
            assert!(backend.validate("x").is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_validate_rejects_duplicates_and_reserved_paths() {
        let mut config = Config::default();
        config.backends.insert(
            "dup".to_string(),
            BackendConfig::local("app", 8000, "/admin"),
        );
        config.backends.insert(
            "api".to_string(),
            BackendConfig::local("app", 9100, "/api"),
        );

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("port 8000 is used twice"));
        assert!(err.contains("base_path '/admin' is used twice"));
        assert!(err.contains("base_path '/api' is reserved"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        let env: HashMap<&str, &str> = [
            ("PORT", "3000"),
            ("STATIC_DIR", "/srv/site"),
            ("CHAT_API_KEY", "sk-test"),
            ("CHAT_MODEL", "small-model"),
        ]
        .into_iter()
        .collect();

        config
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.static_dir, "/srv/site");
        assert_eq!(config.chat.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.chat.model, "small-model");
        assert_eq!(config.server.bind, "0.0.0.0");
    }

    #[test]
    fn test_env_override_rejects_bad_port() {
        let mut config = Config::default();
        let result = config.apply_env_overrides(|key| (key == "PORT").then(|| "eighty".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_or_default_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frontdoor.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 7000

[backends.solo]
command = "sleep 60"
port = 8500
base_path = "/streamlit"
"#,
        )
        .unwrap();

        let config = Config::load_or_default(Some(&path)).unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.backends["solo"].base_path, "/streamlit");
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let result = Config::load_or_default(Some(Path::new("/nonexistent/frontdoor.toml")));
        assert!(result.is_err());
    }
}
