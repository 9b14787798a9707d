//! Configuration loading for `vt`.
//!
//! Resolved entirely from environment variables, mirroring the names the
//! server itself uses (`TUNNELFORGE_*`) so the two binaries agree on a
//! deployment without extra plumbing. CLI flags (when present) win over
//! the environment.

/// Resolved settings needed to reach a tunnelforge server and its
/// session directories.
pub struct ResolvedConfig {
    pub base_url: String,
    pub api_key: String,
    pub control_root: std::path::PathBuf,
}

/// Load configuration from CLI overrides, falling back to environment
/// variables and finally to defaults matching the server's own.
pub fn load_config(
    url_override: Option<String>,
    control_root_override: Option<String>,
) -> Result<ResolvedConfig, String> {
    let base_url = url_override
        .or_else(|| std::env::var("TUNNELFORGE_URL").ok())
        .unwrap_or_else(|| "http://127.0.0.1:4020".to_string());

    let api_key = std::env::var("TUNNELFORGE_API_KEY")
        .map_err(|_| "TUNNELFORGE_API_KEY not set".to_string())?;
    if api_key.is_empty() {
        return Err("TUNNELFORGE_API_KEY is empty".into());
    }

    let control_root = control_root_override
        .or_else(|| std::env::var("TUNNELFORGE_CONTROL_ROOT").ok())
        .unwrap_or_else(|| "/var/lib/tunnelforge/sessions".to_string());

    Ok(ResolvedConfig {
        base_url,
        api_key,
        control_root: std::path::PathBuf::from(control_root),
    })
}
