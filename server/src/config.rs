//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `TUNNELFORGE_API_KEY`, `TUNNELFORGE_LISTEN`,
//!    `TUNNELFORGE_CONTROL_ROOT`, `TUNNELFORGE_ALLOWED_ORIGINS`
//! 2. **Config file** — path via `--config <path>`, or `tunnelforge.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:4020"
//! max_connections = 64
//! max_sessions = 64
//! session_buffer_size = 4096
//! control_root = "/var/lib/tunnelforge/sessions"
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [shell]
//! default_shell = "/bin/sh"
//! default_working_dir = "~"
//!
//! [ipc]
//! socket_mode = 0o600
//!
//! [logging]
//! level = "info"
//!
//! [cors]
//! allowed_origins = ["https://localhost:3000"]
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub ipc: IpcConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cors: CorsConfig,
}

/// HTTP server and resource-limit settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:4020`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent TCP connections. **Not currently enforced.**
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum concurrent sessions (default 64).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Maximum output entries kept per session's in-memory replay buffer.
    #[serde(default = "default_session_buffer_size")]
    pub session_buffer_size: usize,
    /// Directory holding one subdirectory per session. Default
    /// `/var/lib/tunnelforge/sessions`.
    #[serde(default = "default_control_root")]
    pub control_root: String,
}

/// Authentication settings: a pre-shared bearer token guarding every HTTP
/// route except `/health`.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `TUNNELFORGE_API_KEY`.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Shell defaults used when a session-create request omits `command` or
/// `workingDir`.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    /// Shell binary spawned when a create request omits `command`.
    #[serde(default = "default_shell")]
    pub default_shell: String,
    /// Working directory fallback when a create request omits one.
    #[serde(default = "default_working_dir")]
    pub default_working_dir: String,
}

/// Local IPC socket server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct IpcConfig {
    /// Unix file mode applied to each session's `ipc.sock` (default
    /// `0o600`, same-user clients only).
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// CORS / WebSocket origin allow-list.
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    /// Empty means allow any origin. Non-empty means only listed origins may
    /// complete the `/ws` handshake or receive credentialed CORS responses.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_listen() -> String {
    "0.0.0.0:4020".to_string()
}
fn default_max_connections() -> usize {
    64
}
fn default_max_sessions() -> usize {
    64
}
fn default_session_buffer_size() -> usize {
    4096
}
fn default_control_root() -> String {
    "/var/lib/tunnelforge/sessions".to_string()
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_shell() -> String {
    "/bin/sh".to_string()
}
fn default_working_dir() -> String {
    "~".to_string()
}
fn default_socket_mode() -> u32 {
    0o600
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            max_sessions: default_max_sessions(),
            session_buffer_size: default_session_buffer_size(),
            control_root: default_control_root(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            default_working_dir: default_working_dir(),
        }
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_mode: default_socket_mode(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `tunnelforge.toml` in the current directory, falling back
    /// to compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("tunnelforge.toml").exists() {
            let content =
                std::fs::read_to_string("tunnelforge.toml").expect("Failed to read tunnelforge.toml");
            toml::from_str(&content).expect("Failed to parse tunnelforge.toml")
        } else {
            Config {
                server: ServerConfig::default(),
                auth: AuthConfig::default(),
                shell: ShellConfig::default(),
                ipc: IpcConfig::default(),
                logging: LoggingConfig::default(),
                cors: CorsConfig::default(),
            }
        };

        // Env var overrides
        if let Ok(key) = std::env::var("TUNNELFORGE_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("TUNNELFORGE_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(root) = std::env::var("TUNNELFORGE_CONTROL_ROOT") {
            config.server.control_root = root;
        }
        if let Ok(origins) = std::env::var("TUNNELFORGE_ALLOWED_ORIGINS") {
            config.cors.allowed_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            shell: ShellConfig::default(),
            ipc: IpcConfig::default(),
            logging: LoggingConfig::default(),
            cors: CorsConfig::default(),
        };
        assert_eq!(config.server.listen, "0.0.0.0:4020");
        assert_eq!(config.server.max_sessions, 64);
        assert_eq!(config.ipc.socket_mode, 0o600);
        assert!(config.cors.allowed_origins.is_empty());
    }

    #[test]
    fn parses_minimal_toml() {
        let toml = r#"
            [auth]
            api_key = "secret"

            [cors]
            allowed_origins = ["https://example.com"]
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.auth.api_key, "secret");
        assert_eq!(config.cors.allowed_origins, vec!["https://example.com"]);
        assert_eq!(config.server.listen, "0.0.0.0:4020");
    }
}
