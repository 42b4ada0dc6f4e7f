use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::router::PIVOT_LANGUAGE;

pub const CONFIG_FILE_NAME: &str = "bergamot-host.toml";
pub const CONFIG_ENV_VAR: &str = "BERGAMOT_HOST_CONFIG";

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct EngineSection {
    /// Directory holding one `<src><trg>` folder per model leg.
    #[serde(default)]
    pub models_dir: Option<PathBuf>,
    /// Inference-unit binary; an optional `<file>.sha256` next to it is verified on load.
    #[serde(default)]
    pub inference_unit: Option<PathBuf>,
    #[serde(default)]
    pub pivot_language: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct LoggingSection {
    #[serde(default)]
    pub filter: Option<String>,
}

/// Configuration with defaults applied and relative paths resolved against the config file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostConfig {
    pub config_path: PathBuf,
    pub models_dir: PathBuf,
    pub inference_unit: PathBuf,
    pub pivot_language: String,
    pub log_filter: String,
}

impl HostConfig {
    /// Explicit path, then `BERGAMOT_HOST_CONFIG`, then an upward search. An explicit path must
    /// exist; when the search finds nothing, defaults apply relative to `workdir`.
    pub fn resolve(config_path: Option<PathBuf>, workdir: &Path) -> anyhow::Result<Self> {
        let explicit = config_path.or_else(|| std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from));
        if let Some(p) = explicit.as_ref() {
            if !p.exists() {
                anyhow::bail!("config file not found: {}", p.display());
            }
        }
        let cfg_file = explicit.or_else(|| find_default_config(workdir, CONFIG_FILE_NAME));

        let mut file_cfg = AppConfig::default();
        if let Some(p) = cfg_file.as_ref() {
            file_cfg = load_config(p)?;
        }
        let cfg_path = cfg_file.unwrap_or_else(|| workdir.join(CONFIG_FILE_NAME));
        Ok(Self::from_app_config(file_cfg, cfg_path))
    }

    pub fn from_app_config(cfg: AppConfig, config_path: PathBuf) -> Self {
        let base = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let resolve = |p: Option<PathBuf>, default: &str| {
            let p = p.unwrap_or_else(|| PathBuf::from(default));
            if p.is_relative() {
                base.join(p)
            } else {
                p
            }
        };
        let pivot_language = cfg
            .engine
            .pivot_language
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| PIVOT_LANGUAGE.to_string());
        let log_filter = cfg
            .logging
            .filter
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "info".to_string());

        Self {
            models_dir: resolve(cfg.engine.models_dir, "models"),
            inference_unit: resolve(
                cfg.engine.inference_unit,
                "generated/bergamot-translator.wasm",
            ),
            pivot_language,
            log_filter,
            config_path,
        }
    }
}

pub fn find_file_upwards(start_dir: &Path, filename: &str, max_levels: usize) -> Option<PathBuf> {
    let mut dir = start_dir;
    for _ in 0..=max_levels {
        let candidate = dir.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
    None
}

pub fn find_default_config(workdir: &Path, filename: &str) -> Option<PathBuf> {
    if let Some(p) = find_file_upwards(workdir, filename, 8) {
        return Some(p);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Some(p) = find_file_upwards(dir, filename, 8) {
                return Some(p);
            }
        }
    }
    None
}

pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: AppConfig = toml::from_str(&text).context("parse config toml")?;
    Ok(cfg)
}

pub const DEFAULT_CONFIG_TOML: &str = r#"[engine]
# One directory per model leg, e.g. models/esen/model.esen.intgemm.alphas.bin
models_dir = "models"
# A bergamot-translator.wasm.sha256 file next to the binary is verified when present.
inference_unit = "generated/bergamot-translator.wasm"
pivot_language = "en"

[logging]
# Overridden by RUST_LOG.
filter = "info"
"#;

/// Writes the default config into `dir`. Existing files are kept unless `force` is set.
pub fn init_default_config(dir: &Path, force: bool) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create config dir: {}", dir.display()))?;
    let cfg_path = dir.join(CONFIG_FILE_NAME);
    if cfg_path.exists() && !force {
        anyhow::bail!(
            "config already exists: {} (use --force to overwrite)",
            cfg_path.display()
        );
    }
    std::fs::write(&cfg_path, DEFAULT_CONFIG_TOML)
        .with_context(|| format!("write config: {}", cfg_path.display()))?;
    Ok(cfg_path)
}
