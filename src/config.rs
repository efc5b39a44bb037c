use std::{env, fs, net::SocketAddr};

use anyhow::{bail, Result};
use uuid::Uuid;

pub const DEFAULT_BASE_URL: &str = "https://api.crowdstrike.com";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub api_key: String,
    pub api_key_is_fallback: bool,
    pub falcon_client_id: String,
    pub falcon_client_secret: String,
    pub falcon_base_url: String,
    pub dev_log_payloads: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let falcon_client_id = env::var("FALCON_CLIENT_ID")
            .unwrap_or_default()
            .trim()
            .to_string();
        let falcon_client_secret = env::var("FALCON_CLIENT_SECRET")
            .unwrap_or_default()
            .trim()
            .to_string();
        if falcon_client_id.is_empty() || falcon_client_secret.is_empty() {
            bail!("FALCON_CLIENT_ID and FALCON_CLIENT_SECRET environment variables must be set");
        }

        let falcon_base_url = env::var("FALCON_BASE_URL")
            .ok()
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let bind_raw =
            env::var("FALCON_MCP_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_normalized = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        let bind_addr = bind_normalized
            .parse::<SocketAddr>()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let (api_key, api_key_is_fallback) = resolve_api_key();

        let dev_log_payloads = env::var("FALCON_MCP_DEV_LOG_PAYLOADS")
            .ok()
            .map(|v| {
                matches!(
                    v.trim().to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            })
            .unwrap_or(false);

        Ok(Self {
            bind_addr,
            api_key,
            api_key_is_fallback,
            falcon_client_id,
            falcon_client_secret,
            falcon_base_url,
            dev_log_payloads,
        })
    }
}

fn resolve_api_key() -> (String, bool) {
    if let Ok(value) = env::var("FALCON_MCP_API_KEY") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return (trimmed.to_string(), false);
        }
    }

    if let Ok(key_file) = env::var("FALCON_MCP_API_KEY_FILE") {
        match fs::read_to_string(&key_file) {
            Ok(raw) => {
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    return (trimmed.to_string(), false);
                }
                eprintln!(
                    "[falcon-intel-mcp] FALCON_MCP_API_KEY_FILE is empty: {}. Falling back to generated key.",
                    key_file
                );
            }
            Err(err) => {
                eprintln!(
                    "[falcon-intel-mcp] Failed reading FALCON_MCP_API_KEY_FILE at {}: {}. Falling back to generated key.",
                    key_file, err
                );
            }
        }
    } else {
        eprintln!(
            "[falcon-intel-mcp] FALCON_MCP_API_KEY not set. Falling back to generated key."
        );
    }

    let generated = format!("fallback-{}", Uuid::new_v4());
    (generated, true)
}
