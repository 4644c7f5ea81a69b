use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

/// File extensions accepted for upload.
pub const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp"];

/// Maximum request body size in bytes (16 MiB).
pub const MAX_CONTENT_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub model_name: String,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub max_output_tokens: i32,
    pub upload_dir: PathBuf,
    pub port: u16,
    pub debug: bool,
}

impl Config {
    /// Load configuration from the process environment and make sure the
    /// upload directory exists.
    pub fn from_env() -> Result<Self> {
        let config = Self::from_vars(&std::env::vars().collect())?;
        std::fs::create_dir_all(&config.upload_dir).with_context(|| {
            format!(
                "failed to create upload directory {}",
                config.upload_dir.display()
            )
        })?;
        Ok(config)
    }

    fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let api_key = vars
            .get("GEMINI_API_KEY")
            .map(|value| value.trim().to_string())
            .unwrap_or_default();
        if api_key.is_empty() {
            bail!("GEMINI_API_KEY not set. Please set it in your .env file or environment variables.");
        }

        // Production disables debug unless APP_DEBUG explicitly overrides.
        let environment = var_string(vars, "APP_ENV", "development");
        let debug = var_bool(vars, "APP_DEBUG", environment != "production");

        Ok(Self {
            api_key,
            model_name: var_string(vars, "MODEL_NAME", "gemini-2.0-flash"),
            temperature: var_f32(vars, "MODEL_TEMPERATURE", 1.0),
            top_p: var_f32(vars, "MODEL_TOP_P", 0.95),
            top_k: var_i32(vars, "MODEL_TOP_K", 64),
            max_output_tokens: var_i32(vars, "MODEL_MAX_TOKENS", 8192),
            upload_dir: PathBuf::from(var_string(vars, "UPLOAD_DIR", "temp")),
            port: var_u16(vars, "PORT", 5656),
            debug,
        })
    }
}

fn var_string(vars: &HashMap<String, String>, name: &str, default: &str) -> String {
    vars.get(name)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| default.to_string())
}

fn var_bool(vars: &HashMap<String, String>, name: &str, default: bool) -> bool {
    vars.get(name)
        .map(|value| matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn var_f32(vars: &HashMap<String, String>, name: &str, default: f32) -> f32 {
    vars.get(name)
        .and_then(|value| value.trim().parse::<f32>().ok())
        .unwrap_or(default)
}

fn var_i32(vars: &HashMap<String, String>, name: &str, default: i32) -> i32 {
    vars.get(name)
        .and_then(|value| value.trim().parse::<i32>().ok())
        .unwrap_or(default)
}

fn var_u16(vars: &HashMap<String, String>, name: &str, default: u16) -> u16 {
    vars.get(name)
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(default)
}
