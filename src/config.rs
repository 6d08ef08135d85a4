// config.rs — device selection from a JSON config file.
//
// {
//   "backend":   "auto",          // "auto" | "gpu" | "host"
//   "profile":   "raspberry_pi",  // "native" | "raspberry_pi"
//   "max_bytes": "512MB"          // integer, or string with KB/MB/GB suffix
// }
//
// Every field is optional. `DEVMAT_MAX_BYTES` in the environment overrides
// `max_bytes`.
//
// Backend choice is made once, here, from configuration. Operations never
// fall back from GPU to host on their own.

use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};
use crate::gpu::{acceleration_available, DeviceProfile, GpuDevice};
use crate::host::HostDevice;

pub const MAX_BYTES_ENV: &str = "DEVMAT_MAX_BYTES";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendPreference {
    /// GPU when an adapter is available, host otherwise.
    #[default]
    Auto,
    /// GPU or an error.
    Gpu,
    Host,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: BackendPreference,
    pub profile: DeviceProfile,
    /// Ceiling on live buffer bytes per device. `None` is unlimited.
    #[serde(deserialize_with = "deserialize_byte_size")]
    pub max_bytes: Option<usize>,
}

impl DeviceConfig {
    /// Apply `DEVMAT_MAX_BYTES`, if set.
    ///
    /// # Errors
    /// `Config` when the variable is set but not a positive byte size.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        let raw = match env::var(MAX_BYTES_ENV) {
            Ok(v) => Some(v),
            Err(env::VarError::NotPresent) => None,
            Err(e) => return Err(Error::Config(format!("failed to read {MAX_BYTES_ENV}: {e}"))),
        };
        if let Some(limit) = max_bytes_override(raw.as_deref())? {
            self.max_bytes = Some(limit);
        }
        Ok(self)
    }
}

pub fn load_config(path: &Path) -> Result<DeviceConfig> {
    let data = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read config {}: {e}", path.display())))?;
    serde_json::from_str(&data)
        .map_err(|e| Error::Config(format!("failed to parse config {}: {e}", path.display())))
}

/// A device chosen at runtime. Matrices are generic over the backend, so
/// callers match once and continue with the concrete device.
#[derive(Clone)]
pub enum Device {
    Gpu(Arc<GpuDevice>),
    Host(Arc<HostDevice>),
}

impl Device {
    pub fn name(&self) -> String {
        match self {
            Device::Gpu(gpu) => gpu.to_string(),
            Device::Host(_) => "host".to_string(),
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::Gpu(_))
    }
}

/// Open the device `config` asks for.
///
/// # Errors
/// `Device` when `backend` is `gpu` and no adapter can be opened.
pub fn open_device(config: &DeviceConfig) -> Result<Device> {
    let host = || Device::Host(Arc::new(HostDevice::with_budget(config.max_bytes)));
    let gpu = || -> Result<Device> {
        let device = GpuDevice::with_options(config.profile, config.max_bytes)?;
        Ok(Device::Gpu(Arc::new(device)))
    };

    let device = match config.backend {
        BackendPreference::Host => host(),
        BackendPreference::Gpu => gpu()?,
        BackendPreference::Auto if acceleration_available() => gpu()?,
        BackendPreference::Auto => {
            warn!("no GPU adapter available, using the host backend");
            host()
        }
    };
    info!("device: {}", device.name());
    Ok(device)
}

// ---------------------------------------------------------------------------
// Byte sizes
// ---------------------------------------------------------------------------

fn max_bytes_override(raw: Option<&str>) -> Result<Option<usize>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let parsed = parse_bytes_with_suffix(raw)?;
    if parsed == 0 {
        return Err(Error::Config(format!("{MAX_BYTES_ENV} must be >= 1")));
    }
    Ok(Some(parsed))
}

/// Parse a byte size: `1024`, `512KB`, `256MB`, `2GB`, `64B`. Case is
/// ignored and underscores may separate digits.
pub fn parse_bytes_with_suffix(raw: &str) -> Result<usize> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(Error::Config("byte size cannot be empty".to_string()));
    }

    let upper = s.to_ascii_uppercase().replace('_', "");
    let (number_part, multiplier): (&str, usize) = if let Some(v) = upper.strip_suffix("KB") {
        (v, 1 << 10)
    } else if let Some(v) = upper.strip_suffix("MB") {
        (v, 1 << 20)
    } else if let Some(v) = upper.strip_suffix("GB") {
        (v, 1 << 30)
    } else if let Some(v) = upper.strip_suffix('B') {
        (v, 1)
    } else {
        (upper.as_str(), 1)
    };

    let base: usize = number_part.trim().parse().map_err(|_| {
        Error::Config(format!("byte size must be like '134217728', '512MB' or '2GB'; got '{raw}'"))
    })?;
    base.checked_mul(multiplier)
        .ok_or_else(|| Error::Config(format!("byte size '{raw}' overflows")))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ByteSize {
    Count(usize),
    Text(String),
}

fn deserialize_byte_size<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<usize>, D::Error> {
    match Option::<ByteSize>::deserialize(d)? {
        None => Ok(None),
        Some(ByteSize::Count(n)) => Ok(Some(n)),
        Some(ByteSize::Text(s)) => parse_bytes_with_suffix(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bytes_with_suffix() {
        assert_eq!(parse_bytes_with_suffix("1024").unwrap(), 1024);
        assert_eq!(parse_bytes_with_suffix("512kb").unwrap(), 512 << 10);
        assert_eq!(parse_bytes_with_suffix(" 2GB ").unwrap(), 2 << 30);
        assert_eq!(parse_bytes_with_suffix("1_000B").unwrap(), 1000);
        assert!(matches!(parse_bytes_with_suffix(""), Err(Error::Config(_))));
        assert!(matches!(parse_bytes_with_suffix("lots"), Err(Error::Config(_))));
        assert!(parse_bytes_with_suffix(&format!("{}GB", usize::MAX)).is_err());
    }

    #[test]
    fn test_override_rejects_zero() {
        assert_eq!(max_bytes_override(None).unwrap(), None);
        assert_eq!(max_bytes_override(Some("4MB")).unwrap(), Some(4 << 20));
        assert!(max_bytes_override(Some("0")).is_err());
    }

    #[test]
    fn test_config_defaults() {
        let cfg: DeviceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, DeviceConfig::default());
        assert_eq!(cfg.backend, BackendPreference::Auto);
        assert_eq!(cfg.max_bytes, None);
    }

    #[test]
    fn test_config_fields() {
        let cfg: DeviceConfig = serde_json::from_str(
            r#"{ "backend": "host", "profile": "raspberry_pi", "max_bytes": "1MB" }"#,
        )
        .unwrap();
        assert_eq!(cfg.backend, BackendPreference::Host);
        assert_eq!(cfg.profile, DeviceProfile::RaspberryPi);
        assert_eq!(cfg.max_bytes, Some(1 << 20));

        let cfg: DeviceConfig = serde_json::from_str(r#"{ "max_bytes": 4096 }"#).unwrap();
        assert_eq!(cfg.max_bytes, Some(4096));
        assert!(serde_json::from_str::<DeviceConfig>(r#"{ "backend": "tpu" }"#).is_err());
    }

    #[test]
    fn test_open_host_device_with_budget() {
        let cfg = DeviceConfig {
            backend: BackendPreference::Host,
            max_bytes: Some(64),
            ..DeviceConfig::default()
        };
        match open_device(&cfg).unwrap() {
            Device::Host(dev) => assert_eq!(dev.budget().limit(), Some(64)),
            Device::Gpu(_) => panic!("host backend requested"),
        }
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Path::new("/nonexistent/devmat.json")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
