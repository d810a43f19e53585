use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::storage::DEFAULT_POOL_SIZE;

const DEFAULT_DB_PATH: &str = "outdata/pose_detections.db";
const DEFAULT_OUTPUT_DIR: &str = "outdata";
const DEFAULT_API_HOST: &str = "127.0.0.1";
const DEFAULT_API_PORT: u16 = 8000;
const DEFAULT_FPS: u32 = 1;
const DEFAULT_MAX_BACKOFF_SECS: u64 = 30;
const DEFAULT_MODEL_INPUT: u32 = 640;
const LEGACY_CAMERA_NAME: &str = "camera_1";

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    db_path: Option<String>,
    pool_size: Option<usize>,
    cameras: Option<Vec<CameraFile>>,
    fps: Option<u32>,
    persist_detections: Option<bool>,
    show_original: Option<bool>,
    max_backoff_secs: Option<u64>,
    output_dir: Option<PathBuf>,
    backend: Option<String>,
    model_path: Option<PathBuf>,
    model_input: Option<u32>,
    api: Option<ApiConfigFile>,
}

#[derive(Debug, Deserialize)]
struct CameraFile {
    name: String,
    url: String,
    output: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSettings {
    pub name: String,
    pub url: String,
    /// Output file or `rtsp://` URL. Defaults to `<output_dir>/<name>.mp4`.
    pub output: Option<String>,
}

impl CameraSettings {
    pub fn output_target(&self, output_dir: &Path) -> String {
        match &self.output {
            Some(output) => output.clone(),
            None => output_dir
                .join(format!("{}.mp4", self.name))
                .to_string_lossy()
                .into_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Stub,
    Tract,
}

impl BackendKind {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stub" => Ok(BackendKind::Stub),
            "tract" => Ok(BackendKind::Tract),
            other => Err(anyhow!("unknown backend {:?} (expected stub or tract)", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub model_path: Option<PathBuf>,
    pub model_input: u32,
}

/// Settings for the camera daemon.
#[derive(Debug, Clone)]
pub struct PosewatchdConfig {
    pub db_path: String,
    pub pool_size: usize,
    pub cameras: Vec<CameraSettings>,
    pub fps: u32,
    pub persist_detections: bool,
    pub show_original: bool,
    pub max_backoff: Duration,
    pub output_dir: PathBuf,
    pub backend: BackendSettings,
    pub api_addr: String,
}

/// Settings for the standalone query API.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub db_path: String,
    pub pool_size: usize,
    pub addr: String,
}

impl PosewatchdConfig {
    /// Defaults, then the file named by `POSEWATCH_CONFIG`, then environment
    /// overrides, then validation.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Like [`load`](Self::load) but reads `path` instead of
    /// `POSEWATCH_CONFIG` when given.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut cfg = Self::from_file(load_config_file(path)?)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ConfigFile) -> Result<Self> {
        let backend = BackendSettings {
            kind: match file.backend.as_deref() {
                Some(raw) => BackendKind::parse(raw)?,
                None => BackendKind::Stub,
            },
            model_path: file.model_path,
            model_input: file.model_input.unwrap_or(DEFAULT_MODEL_INPUT),
        };
        let cameras = file
            .cameras
            .unwrap_or_default()
            .into_iter()
            .map(|camera| CameraSettings {
                name: camera.name,
                url: camera.url,
                output: camera.output,
            })
            .collect();
        Ok(Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            pool_size: file.pool_size.unwrap_or(DEFAULT_POOL_SIZE),
            cameras,
            fps: file.fps.unwrap_or(DEFAULT_FPS),
            persist_detections: file.persist_detections.unwrap_or(true),
            show_original: file.show_original.unwrap_or(false),
            max_backoff: Duration::from_secs(
                file.max_backoff_secs.unwrap_or(DEFAULT_MAX_BACKOFF_SECS),
            ),
            output_dir: file
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            backend,
            api_addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(default_api_addr),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_nonempty("POSEWATCH_DB_PATH") {
            self.db_path = path;
        }
        if let Some(size) = env_nonempty("POSEWATCH_POOL_SIZE") {
            self.pool_size = parse_env("POSEWATCH_POOL_SIZE", &size)?;
        }
        if let Some(cameras) = env_nonempty("POSEWATCH_CAMERAS") {
            self.cameras = parse_camera_list(&cameras)?;
        }
        if let Some(url) = env_nonempty("UNIFI_RTSPS_URL") {
            if self.cameras.is_empty() {
                self.cameras.push(CameraSettings {
                    name: LEGACY_CAMERA_NAME.to_string(),
                    url,
                    output: None,
                });
            } else {
                log::warn!("config: UNIFI_RTSPS_URL ignored because cameras are configured");
            }
        }
        for key in ["FPS", "POSEWATCH_FPS"] {
            if let Some(fps) = env_nonempty(key) {
                self.fps = parse_env(key, &fps)?;
            }
        }
        if let Some(persist) = env_nonempty("POSEWATCH_PERSIST") {
            self.persist_detections = parse_bool("POSEWATCH_PERSIST", &persist)?;
        }
        if let Some(show) = env_nonempty("SHOW_ORIGINAL") {
            self.show_original = parse_bool("SHOW_ORIGINAL", &show)?;
        }
        if let Some(secs) = env_nonempty("POSEWATCH_MAX_BACKOFF_SECS") {
            self.max_backoff =
                Duration::from_secs(parse_env("POSEWATCH_MAX_BACKOFF_SECS", &secs)?);
        }
        if let Some(dir) = env_nonempty("POSEWATCH_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(backend) = env_nonempty("POSEWATCH_BACKEND") {
            self.backend.kind = BackendKind::parse(&backend)?;
        }
        if let Some(path) = env_nonempty("POSEWATCH_MODEL_PATH") {
            self.backend.model_path = Some(PathBuf::from(path));
        }
        if let Some(addr) = api_addr_from_env()? {
            self.api_addr = addr;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(anyhow!(
                "no cameras configured (set cameras in POSEWATCH_CONFIG, POSEWATCH_CAMERAS or UNIFI_RTSPS_URL)"
            ));
        }
        let mut seen = HashSet::new();
        for camera in &self.cameras {
            validate_camera_name(&camera.name)?;
            if camera.url.trim().is_empty() {
                return Err(anyhow!("camera {} has an empty url", camera.name));
            }
            if !seen.insert(camera.name.as_str()) {
                return Err(anyhow!("duplicate camera name {}", camera.name));
            }
        }
        if self.fps == 0 {
            return Err(anyhow!("fps must be greater than zero"));
        }
        if self.pool_size == 0 {
            return Err(anyhow!("pool_size must be greater than zero"));
        }
        if self.max_backoff < Duration::from_secs(1) {
            return Err(anyhow!("max_backoff_secs must be at least 1"));
        }
        if self.backend.model_input == 0 || self.backend.model_input % 32 != 0 {
            return Err(anyhow!("model_input must be a positive multiple of 32"));
        }
        if self.backend.kind == BackendKind::Tract && self.backend.model_path.is_none() {
            return Err(anyhow!("the tract backend requires model_path"));
        }
        Ok(())
    }
}

impl ApiConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file = load_config_file(path)?;
        let mut cfg = Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            pool_size: file.pool_size.unwrap_or(DEFAULT_POOL_SIZE),
            addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(default_api_addr),
        };
        if let Some(path) = env_nonempty("POSEWATCH_DB_PATH") {
            cfg.db_path = path;
        }
        if let Some(size) = env_nonempty("POSEWATCH_POOL_SIZE") {
            cfg.pool_size = parse_env("POSEWATCH_POOL_SIZE", &size)?;
        }
        if let Some(addr) = api_addr_from_env()? {
            cfg.addr = addr;
        }
        if cfg.pool_size == 0 {
            return Err(anyhow!("pool_size must be greater than zero"));
        }
        Ok(cfg)
    }
}

fn load_config_file(path: Option<&Path>) -> Result<ConfigFile> {
    if let Some(path) = path {
        return read_config_file(path);
    }
    match std::env::var("POSEWATCH_CONFIG").ok() {
        Some(path) if !path.trim().is_empty() => read_config_file(Path::new(&path)),
        _ => Ok(ConfigFile::default()),
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn default_api_addr() -> String {
    format!("{}:{}", DEFAULT_API_HOST, DEFAULT_API_PORT)
}

/// `POSEWATCH_API_ADDR` wins; otherwise `WEB_HOST` / `WEB_PORT` fill in
/// whichever half is given.
fn api_addr_from_env() -> Result<Option<String>> {
    if let Some(addr) = env_nonempty("POSEWATCH_API_ADDR") {
        return Ok(Some(addr));
    }
    let host = env_nonempty("WEB_HOST");
    let port = env_nonempty("WEB_PORT");
    if host.is_none() && port.is_none() {
        return Ok(None);
    }
    let port: u16 = match port {
        Some(port) => parse_env("WEB_PORT", &port)?,
        None => DEFAULT_API_PORT,
    };
    let host = host.unwrap_or_else(|| DEFAULT_API_HOST.to_string());
    Ok(Some(format!("{}:{}", host, port)))
}

/// Parse `name=url,name=url`.
fn parse_camera_list(value: &str) -> Result<Vec<CameraSettings>> {
    split_csv(value)
        .into_iter()
        .map(|entry| {
            let (name, url) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("POSEWATCH_CAMERAS entry {:?} is not name=url", entry))?;
            Ok(CameraSettings {
                name: name.trim().to_string(),
                url: url.trim().to_string(),
                output: None,
            })
        })
        .collect()
}

fn validate_camera_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(anyhow!("camera name must be 1-64 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(anyhow!(
            "camera name {:?} may only contain letters, digits, '_' and '-'",
            name
        ));
    }
    Ok(())
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("{} has an invalid value {:?}", key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("{} must be a boolean, got {:?}", key, value)),
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
