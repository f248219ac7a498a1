//! Configuration.
//!
//! Two layers:
//! - `RuntimeConfig`: the reconfigurable part (line, target labels, relay host).
//!   Held in a `SharedConfig` and replaced whole on every change, so the
//!   detection loop can take one consistent snapshot per iteration.
//! - `SentryConfig`: daemon settings loaded once at startup from an optional
//!   JSON/TOML file (`SPRAY_CONFIG`) plus `SPRAY_*` environment overrides.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::actuate::{ActuationTiming, RelayEndpoint};
use crate::geometry::{Line, DEFAULT_THRESHOLD_PX};

const DEFAULT_API_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_SOURCE_URL: &str = "stub://camera";
const DEFAULT_SOURCE_FPS: u32 = 10;
const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 480;
const DEFAULT_COOLDOWN_SECS: f64 = 10.0;
const DEFAULT_HOLD_SECS: f64 = 5.0;
const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_MODEL_INPUT: u32 = 640;
pub const DEFAULT_DETECT_OBJECTS: [&str; 2] = ["cat", "person"];

// ----------------------------------------------------------------------------
// Runtime configuration
// ----------------------------------------------------------------------------

/// Reconfigurable settings consumed by the detection loop.
///
/// Immutable once built; changes produce a new value.
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeConfig {
    line: Option<Line>,
    detect_objects: BTreeSet<String>,
    esp32_ip: Option<String>,
    endpoint: Option<RelayEndpoint>,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self {
            line: None,
            detect_objects: BTreeSet::new(),
            esp32_ip: None,
            endpoint: None,
        }
    }

    pub fn with_line(mut self, line: Option<Line>) -> Self {
        self.line = line;
        self
    }

    pub fn with_detect_objects<I, S>(mut self, objects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.detect_objects = objects
            .into_iter()
            .map(|label| {
                let label: String = label.into();
                label.trim().to_string()
            })
            .filter(|label| !label.is_empty())
            .collect();
        self
    }

    /// Set the relay host. Blank or unparsable hosts leave no endpoint.
    pub fn with_esp32_ip(mut self, ip: Option<String>) -> Self {
        let ip = ip.filter(|ip| !ip.trim().is_empty());
        self.endpoint = ip.as_deref().and_then(|raw| match RelayEndpoint::parse(raw) {
            Ok(endpoint) => Some(endpoint),
            Err(err) => {
                log::warn!("ignoring actuator endpoint: {:#}", err);
                None
            }
        });
        self.esp32_ip = ip;
        self
    }

    /// Active line, if one is configured and well-formed.
    pub fn line(&self) -> Option<Line> {
        self.line
    }

    pub fn detect_objects(&self) -> &BTreeSet<String> {
        &self.detect_objects
    }

    pub fn is_target(&self, label: &str) -> bool {
        self.detect_objects.contains(label)
    }

    /// Raw relay host as configured.
    pub fn esp32_ip(&self) -> Option<&str> {
        self.esp32_ip.as_deref()
    }

    /// Parsed relay endpoint; `None` when absent or malformed.
    pub fn endpoint(&self) -> Option<&RelayEndpoint> {
        self.endpoint.as_ref()
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new().with_detect_objects(DEFAULT_DETECT_OBJECTS)
    }
}

impl Serialize for RuntimeConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            line: Vec<f32>,
            detect_objects: &'a BTreeSet<String>,
            esp32_ip: Option<&'a str>,
        }
        Wire {
            line: self
                .line
                .map(|line| <[f32; 4]>::from(line).to_vec())
                .unwrap_or_default(),
            detect_objects: &self.detect_objects,
            esp32_ip: self.esp32_ip.as_deref(),
        }
        .serialize(serializer)
    }
}

/// Parse a line from loosely-typed input.
///
/// Anything other than an array of exactly four finite numbers means "no line".
pub fn parse_line_value(value: &serde_json::Value) -> Option<Line> {
    let items = value.as_array()?;
    let numbers: Option<Vec<f32>> = items.iter().map(|v| v.as_f64().map(|n| n as f32)).collect();
    Line::from_slice(&numbers?)
}

/// Runtime configuration shared between the control surface and the loop.
///
/// Writers replace the whole value; readers clone an `Arc`.
#[derive(Default)]
pub struct SharedConfig {
    current: RwLock<Arc<RuntimeConfig>>,
}

impl SharedConfig {
    pub fn new(initial: RuntimeConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// Consistent view for one loop iteration.
    pub fn snapshot(&self) -> Arc<RuntimeConfig> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    /// Apply a change atomically with respect to other writers.
    pub fn update<F>(&self, change: F) -> Result<Arc<RuntimeConfig>>
    where
        F: FnOnce(RuntimeConfig) -> RuntimeConfig,
    {
        let mut guard = self
            .current
            .write()
            .map_err(|_| anyhow!("runtime config lock poisoned"))?;
        let next = Arc::new(change((**guard).clone()));
        *guard = Arc::clone(&next);
        Ok(next)
    }

    pub fn set_line(&self, line: Option<Line>) -> Result<Arc<RuntimeConfig>> {
        self.update(|cfg| cfg.with_line(line))
    }

    pub fn set_detect_objects(&self, objects: Vec<String>) -> Result<Arc<RuntimeConfig>> {
        self.update(|cfg| cfg.with_detect_objects(objects))
    }

    pub fn set_esp32_ip(&self, ip: Option<String>) -> Result<Arc<RuntimeConfig>> {
        self.update(|cfg| cfg.with_esp32_ip(ip))
    }
}

// ----------------------------------------------------------------------------
// Daemon configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct SentryConfigFile {
    line: Option<serde_json::Value>,
    detect_objects: Option<Vec<String>>,
    esp32_ip: Option<String>,
    api: Option<ApiConfigFile>,
    source: Option<SourceConfigFile>,
    actuation: Option<ActuationConfigFile>,
    detector: Option<DetectorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ActuationConfigFile {
    cooldown_secs: Option<f64>,
    hold_secs: Option<f64>,
    threshold_px: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct SentryConfig {
    pub api_addr: String,
    pub source: SourceSettings,
    pub actuation: ActuationTiming,
    pub threshold_px: f32,
    pub detector: DetectorSettings,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub url: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
}

impl SentryConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SPRAY_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from an explicit file path, still honoring environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SentryConfigFile) -> Result<Self> {
        let line = file.line.as_ref().and_then(|value| {
            let parsed = parse_line_value(value);
            if parsed.is_none() && !is_empty_array(value) {
                log::warn!("config line {} is malformed; line crossing disabled", value);
            }
            parsed
        });
        let runtime = RuntimeConfig::new()
            .with_line(line)
            .with_detect_objects(file.detect_objects.unwrap_or_else(|| {
                DEFAULT_DETECT_OBJECTS.iter().map(|s| s.to_string()).collect()
            }))
            .with_esp32_ip(file.esp32_ip);

        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());

        let source = file.source.unwrap_or_default();
        let source = SourceSettings {
            url: source.url.unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
            target_fps: source.target_fps.unwrap_or(DEFAULT_SOURCE_FPS),
            width: source.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
            height: source.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
        };

        let actuation = file.actuation.unwrap_or_default();
        let timing = ActuationTiming {
            cooldown: secs(
                actuation.cooldown_secs.unwrap_or(DEFAULT_COOLDOWN_SECS),
                "cooldown_secs",
            )?,
            hold: secs(
                actuation.hold_secs.unwrap_or(DEFAULT_HOLD_SECS),
                "hold_secs",
            )?,
        };

        let detector = file.detector.unwrap_or_default();
        let detector = DetectorSettings {
            backend: detector.backend.unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
            model_path: detector.model_path,
            input_size: detector.input_size.unwrap_or(DEFAULT_MODEL_INPUT),
        };

        Ok(Self {
            api_addr,
            source,
            actuation: timing,
            threshold_px: actuation.threshold_px.unwrap_or(DEFAULT_THRESHOLD_PX),
            detector,
            runtime,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("SPRAY_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(url) = non_empty_env("SPRAY_SOURCE_URL") {
            self.source.url = url;
        }
        if let Some(ip) = non_empty_env("SPRAY_ESP32_IP") {
            self.runtime = self.runtime.clone().with_esp32_ip(Some(ip));
        }
        if let Some(objects) = non_empty_env("SPRAY_DETECT_OBJECTS") {
            let parsed = split_csv(&objects);
            if !parsed.is_empty() {
                self.runtime = self.runtime.clone().with_detect_objects(parsed);
            }
        }
        if let Some(value) = non_empty_env("SPRAY_COOLDOWN_SECS") {
            let seconds: f64 = value
                .parse()
                .map_err(|_| anyhow!("SPRAY_COOLDOWN_SECS must be a number of seconds"))?;
            self.actuation.cooldown = secs(seconds, "SPRAY_COOLDOWN_SECS")?;
        }
        if let Some(value) = non_empty_env("SPRAY_HOLD_SECS") {
            let seconds: f64 = value
                .parse()
                .map_err(|_| anyhow!("SPRAY_HOLD_SECS must be a number of seconds"))?;
            self.actuation.hold = secs(seconds, "SPRAY_HOLD_SECS")?;
        }
        if let Some(value) = non_empty_env("SPRAY_THRESHOLD_PX") {
            self.threshold_px = value
                .parse()
                .map_err(|_| anyhow!("SPRAY_THRESHOLD_PX must be a number of pixels"))?;
        }
        if let Some(backend) = non_empty_env("SPRAY_BACKEND") {
            self.detector.backend = backend;
        }
        if let Some(path) = non_empty_env("SPRAY_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.actuation.hold.is_zero() {
            return Err(anyhow!("hold duration must be greater than zero"));
        }
        if !(self.threshold_px.is_finite() && self.threshold_px > 0.0) {
            return Err(anyhow!("crossing threshold must be a positive number of pixels"));
        }
        if self.source.target_fps == 0 {
            return Err(anyhow!("source target_fps must be >= 1"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!("source dimensions must be non-zero"));
        }
        self.detector.backend = self.detector.backend.trim().to_lowercase();
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<SentryConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let value: serde_json::Value = if is_toml {
        let table: toml::Value = toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
        serde_json::to_value(table)?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    let cfg = serde_json::from_value(value)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn secs(value: f64, name: &str) -> Result<Duration> {
    if !value.is_finite() || value < 0.0 {
        return Err(anyhow!("{} must be a non-negative number of seconds", name));
    }
    Ok(Duration::from_secs_f64(value))
}

fn is_empty_array(value: &serde_json::Value) -> bool {
    value.as_array().is_some_and(|items| items.is_empty())
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
