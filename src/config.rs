#![forbid(unsafe_code)]

//! Runtime configuration for the TubeStance binaries.
//!
//! Values are resolved from explicit overrides first, then the process
//! environment, then a `.env` file, so a deployment can pin everything in the
//! file while local runs override single values ad hoc. Only the two API keys
//! are mandatory; everything else has a sensible default.

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

use crate::analysis::{DEFAULT_CLASSIFY_CONCURRENCY, DEFAULT_COMMENT_FETCH_LIMIT};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_DB_PATH: &str = "analyses.db";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-pro";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub youtube_api_key: String,
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub db_path: PathBuf,
    pub port: u16,
    pub host: String,
    pub comment_fetch_limit: usize,
    pub classify_concurrency: usize,
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    resolve_runtime_config(RuntimeOverrides::default())
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub db_path: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeConfig> {
    build_runtime_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let youtube_api_key = lookup_value("YOUTUBE_API_KEY", file_vars, &env_lookup)
        .ok_or_else(|| anyhow!("YOUTUBE_API_KEY not set"))?;
    let gemini_api_key = lookup_value("GEMINI_API_KEY", file_vars, &env_lookup)
        .ok_or_else(|| anyhow!("GEMINI_API_KEY not set"))?;
    let gemini_model = lookup_value("GEMINI_MODEL", file_vars, &env_lookup)
        .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string());
    let db_path = overrides
        .db_path
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("TUBESTANCE_DB", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("TUBESTANCE_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() { None } else { Some(trimmed) }
        })
        .or_else(|| lookup_value("TUBESTANCE_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let comment_fetch_limit = lookup_value("COMMENT_FETCH_LIMIT", file_vars, &env_lookup)
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|limit| *limit > 0)
        .unwrap_or(DEFAULT_COMMENT_FETCH_LIMIT);
    let classify_concurrency = lookup_value("CLASSIFY_CONCURRENCY", file_vars, &env_lookup)
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|bound| *bound > 0)
        .unwrap_or(DEFAULT_CLASSIFY_CONCURRENCY);

    Ok(RuntimeConfig {
        youtube_api_key,
        gemini_api_key,
        gemini_model,
        db_path: PathBuf::from(db_path),
        port,
        host,
        comment_fetch_limit,
        classify_concurrency,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
