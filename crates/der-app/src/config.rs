use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use bus_client::BusConfig;
use device_publisher::DeviceConfig;
use discovery::SubscriptionConfig;
use resource_controller::LoopConfig;

const DEFAULT_SERVER_INTERFACE: &str = "org.ems.Server";
const DEFAULT_DEVICE_INTERFACE: &str = "org.der.Device";
const DEFAULT_DEVICE_PATH: &str = "/der";
const DEFAULT_DEVICE_NAME: &str = "der";
const MAX_INTERFACE_LEN: usize = 255;

#[derive(Clone, Debug)]
pub struct DerConfig {
    pub bus: BusConfig,
    pub subscription: SubscriptionConfig,
    pub device: DeviceConfig,
    pub control: LoopConfig,
    /// Setpoints applied at startup.
    pub import_watts: u32,
    pub export_watts: u32,
    pub metrics_listen: Option<String>,
}

impl DerConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config);
        }

        apply_env_overrides(&mut config);
        config.share_call_timeout();
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bus.app_name.trim().is_empty() {
            anyhow::bail!("bus.app_name must be non-empty");
        }
        if self.bus.call_timeout_ms == 0 {
            anyhow::bail!("bus.call_timeout_ms must be >= 1");
        }
        if self.bus.event_capacity == 0 {
            anyhow::bail!("bus.event_capacity must be >= 1");
        }
        if self.control.tick_interval.as_millis() == 0 {
            anyhow::bail!("control.tick_interval_ms must be >= 1");
        }
        validate_interface_name(
            "subscription.server_interface",
            &self.subscription.server_interface,
        )?;
        validate_interface_name("device.interface", &self.device.interface)?;
        validate_object_path(&self.device.path)?;
        if self.device.name.trim().is_empty() {
            anyhow::bail!("device.name must be non-empty");
        }
        if let Some(ref listen) = self.metrics_listen {
            listen.parse::<SocketAddr>().map_err(|_| {
                anyhow::anyhow!("metrics.listen must be a socket address (e.g. 0.0.0.0:9100)")
            })?;
        }

        Ok(())
    }

    fn share_call_timeout(&mut self) {
        self.subscription.call_timeout_ms = self.bus.call_timeout_ms;
        self.device.call_timeout_ms = self.bus.call_timeout_ms;
    }
}

impl Default for DerConfig {
    fn default() -> Self {
        let bus = BusConfig::default();
        Self {
            subscription: SubscriptionConfig {
                server_interface: DEFAULT_SERVER_INTERFACE.to_string(),
                call_timeout_ms: bus.call_timeout_ms,
                unsubscribe_on_loss: false,
            },
            device: DeviceConfig {
                name: DEFAULT_DEVICE_NAME.to_string(),
                path: DEFAULT_DEVICE_PATH.to_string(),
                interface: DEFAULT_DEVICE_INTERFACE.to_string(),
                call_timeout_ms: bus.call_timeout_ms,
            },
            bus,
            control: LoopConfig::default(),
            import_watts: 0,
            export_watts: 0,
            metrics_listen: None,
        }
    }
}

fn apply_env_overrides(config: &mut DerConfig) {
    if let Ok(value) = env::var("DER_APP_NAME") {
        config.bus.app_name = value;
    }

    if let Some(timeout_ms) = parse_env_u64("DER_CALL_TIMEOUT_MS") {
        config.bus.call_timeout_ms = timeout_ms;
    }

    if let Some(capacity) = parse_env_usize("DER_EVENT_CAPACITY") {
        config.bus.event_capacity = capacity;
    }

    if let Ok(value) = env::var("DER_SERVER_INTERFACE") {
        config.subscription.server_interface = value;
    }

    if let Some(flag) = parse_env_bool("DER_UNSUBSCRIBE_ON_LOSS") {
        config.subscription.unsubscribe_on_loss = flag;
    }

    if let Ok(value) = env::var("DER_DEVICE_NAME") {
        config.device.name = value;
    }

    if let Ok(value) = env::var("DER_DEVICE_INTERFACE") {
        config.device.interface = value;
    }

    if let Ok(value) = env::var("DER_DEVICE_PATH") {
        config.device.path = value;
    }

    if let Some(interval_ms) = parse_env_u64("DER_TICK_INTERVAL_MS") {
        config.control.tick_interval = Duration::from_millis(interval_ms);
    }

    config.import_watts = parse_env_u32("DER_IMPORT_WATTS").unwrap_or(config.import_watts);
    config.export_watts = parse_env_u32("DER_EXPORT_WATTS").unwrap_or(config.export_watts);
    config.metrics_listen = env::var("DER_METRICS_LISTEN")
        .ok()
        .or(config.metrics_listen.take());
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    bus: Option<FileBusConfig>,
    subscription: Option<FileSubscriptionConfig>,
    device: Option<FileDeviceConfig>,
    control: Option<FileControlConfig>,
    metrics: Option<FileMetricsConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileBusConfig {
    app_name: Option<String>,
    call_timeout_ms: Option<u64>,
    event_capacity: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSubscriptionConfig {
    server_interface: Option<String>,
    unsubscribe_on_loss: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileDeviceConfig {
    name: Option<String>,
    interface: Option<String>,
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileControlConfig {
    tick_interval_ms: Option<u64>,
    import_watts: Option<u32>,
    export_watts: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileMetricsConfig {
    listen: Option<String>,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var("DER_CONFIG") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

fn apply_file_config(config: &mut DerConfig, file: FileConfig) {
    if let Some(bus) = file.bus {
        if let Some(app_name) = bus.app_name {
            config.bus.app_name = app_name;
        }
        if let Some(timeout_ms) = bus.call_timeout_ms {
            config.bus.call_timeout_ms = timeout_ms;
        }
        if let Some(capacity) = bus.event_capacity {
            config.bus.event_capacity = capacity;
        }
    }

    if let Some(subscription) = file.subscription {
        if let Some(interface) = subscription.server_interface {
            config.subscription.server_interface = interface;
        }
        if let Some(flag) = subscription.unsubscribe_on_loss {
            config.subscription.unsubscribe_on_loss = flag;
        }
    }

    if let Some(device) = file.device {
        if let Some(name) = device.name {
            config.device.name = name;
        }
        if let Some(interface) = device.interface {
            config.device.interface = interface;
        }
        if let Some(path) = device.path {
            config.device.path = path;
        }
    }

    if let Some(control) = file.control {
        if let Some(interval_ms) = control.tick_interval_ms {
            config.control.tick_interval = Duration::from_millis(interval_ms);
        }
        if let Some(watts) = control.import_watts {
            config.import_watts = watts;
        }
        if let Some(watts) = control.export_watts {
            config.export_watts = watts;
        }
    }

    if let Some(metrics) = file.metrics {
        config.metrics_listen = metrics.listen.or(config.metrics_listen.take());
    }
}

fn parse_env_u32(key: &str) -> Option<u32> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

/// Bus interface names: two or more dot-separated elements, each starting with a letter
/// or underscore and containing only `[A-Za-z0-9_]`.
fn validate_interface_name(field: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_INTERFACE_LEN {
        anyhow::bail!("{field} must be between 1 and {MAX_INTERFACE_LEN} characters");
    }
    let elements: Vec<&str> = name.split('.').collect();
    if elements.len() < 2 {
        anyhow::bail!("{field} must contain at least two dot-separated elements");
    }
    for element in elements {
        let mut chars = element.chars();
        let valid_start = chars
            .next()
            .map(|ch| ch.is_ascii_alphabetic() || ch == '_')
            .unwrap_or(false);
        if !valid_start || !chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
            anyhow::bail!("{field} element '{element}' is not a valid interface element");
        }
    }
    Ok(())
}

fn validate_object_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        anyhow::bail!("device.path must start with '/'");
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        anyhow::bail!("device.path must not end with '/'");
    }
    let invalid = path[1..].split('/').any(|element| {
        element.is_empty()
            || !element
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    });
    if invalid {
        anyhow::bail!("device.path elements must be non-empty and contain only [A-Za-z0-9_]");
    }
    Ok(())
}
