//! Kernel configuration
//!
//! A [`KernelConfig`] is an explicit value handed to
//! [`Kernel::initialize`](crate::Kernel::initialize). It is normally read
//! from TOML:
//!
//! ```toml
//! default_reap_interval = 1
//! snapshot_initial = 3
//! snapshot_interval = 200
//! bootstrap = "bootstrap"
//!
//! [bundles]
//! bootstrap = "bundles/bootstrap.json"
//!
//! [vats.bootstrap]
//! bundle = "bootstrap"
//! critical = true
//! devices = ["bridge"]
//! parameters = { greeting = "hello" }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::KernelError;

/// Bundle bytes by configuration name.
pub type NamedBundles = BTreeMap<String, Vec<u8>>;

/// Kernel-wide settings plus the static vat table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Deliveries between `bringOutYourDead` for vats without their own
    /// interval.
    #[serde(default = "default_reap_interval")]
    pub default_reap_interval: u64,

    /// Deliveries before a vat's first heap snapshot.
    #[serde(default = "default_snapshot_initial")]
    pub snapshot_initial: u64,

    /// Deliveries between later heap snapshots.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u64,

    /// Pipelining default for vats that do not say.
    #[serde(default)]
    pub default_enable_pipelining: bool,

    /// Vat whose root receives `bootstrap(vats, devices)` after every
    /// static vat has started.
    #[serde(default)]
    pub bootstrap: Option<String>,

    /// Bundle files by name, relative to the configuration file.
    #[serde(default)]
    pub bundles: BTreeMap<String, PathBuf>,

    /// Vats created at initialization, by name.
    #[serde(default)]
    pub vats: BTreeMap<String, StaticVatConfig>,
}

/// One static vat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticVatConfig {
    /// Name of the bundle the vat runs.
    pub bundle: String,

    /// JSON parameters for `startVat`.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub parameters: Value,

    /// Devices granted to the vat, by name. They appear in the
    /// parameters under `devices`.
    #[serde(default)]
    pub devices: Vec<String>,

    /// Terminating this vat panics the kernel.
    #[serde(default)]
    pub critical: bool,

    /// Overrides the kernel's pipelining default.
    #[serde(default)]
    pub enable_pipelining: Option<bool>,

    /// Overrides the kernel's reap interval.
    #[serde(default)]
    pub reap_interval: Option<u64>,
}

impl StaticVatConfig {
    /// A vat running `bundle` with no parameters.
    pub fn new(bundle: impl Into<String>) -> Self {
        Self {
            bundle: bundle.into(),
            parameters: Value::Null,
            devices: Vec::new(),
            critical: false,
            enable_pipelining: None,
            reap_interval: None,
        }
    }
}

fn default_reap_interval() -> u64 {
    1
}

fn default_snapshot_initial() -> u64 {
    3
}

fn default_snapshot_interval() -> u64 {
    200
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            default_reap_interval: default_reap_interval(),
            snapshot_initial: default_snapshot_initial(),
            snapshot_interval: default_snapshot_interval(),
            default_enable_pipelining: false,
            bootstrap: None,
            bundles: BTreeMap::new(),
            vats: BTreeMap::new(),
        }
    }
}

impl KernelConfig {
    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, KernelError> {
        let config: KernelConfig =
            toml::from_str(content).map_err(|e| KernelError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, KernelError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Serialize configuration to TOML.
    pub fn to_toml(&self) -> Result<String, KernelError> {
        toml::to_string_pretty(self).map_err(|e| KernelError::config(e.to_string()))
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.snapshot_interval == 0 {
            return Err(KernelError::config("snapshot_interval must be positive"));
        }
        if self.default_reap_interval == 0 {
            return Err(KernelError::config("default_reap_interval must be positive"));
        }
        if let Some(name) = &self.bootstrap {
            if !self.vats.contains_key(name) {
                return Err(KernelError::config(format!(
                    "bootstrap vat {name:?} is not configured"
                )));
            }
        }
        for (name, vat) in &self.vats {
            if vat.reap_interval == Some(0) {
                return Err(KernelError::config(format!("vat {name:?}: reap_interval must be positive")));
            }
            if !vat.devices.is_empty() && !matches!(vat.parameters, Value::Null | Value::Object(_)) {
                return Err(KernelError::config(format!(
                    "vat {name:?}: parameters must be a table when devices are granted"
                )));
            }
        }
        Ok(())
    }

    /// Read every file in `[bundles]`, resolving paths against `base`.
    pub fn load_bundles(&self, base: &Path) -> Result<NamedBundles, KernelError> {
        let mut bundles = NamedBundles::new();
        for (name, path) in &self.bundles {
            let bytes = std::fs::read(base.join(path))?;
            bundles.insert(name.clone(), bytes);
        }
        Ok(bundles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply() {
        let config = KernelConfig::from_toml("").unwrap();
        assert_eq!(config, KernelConfig::default());
        assert_eq!(config.snapshot_initial, 3);
        assert_eq!(config.snapshot_interval, 200);
    }

    #[test]
    fn test_static_vats_parse() {
        let config = KernelConfig::from_toml(
            r#"
            bootstrap = "boot"

            [vats.boot]
            bundle = "boot"
            critical = true
            devices = ["bridge"]
            parameters = { greeting = "hi" }

            [vats.alice]
            bundle = "alice"
            enable_pipelining = true
            reap_interval = 5
            "#,
        )
        .unwrap();
        let boot = &config.vats["boot"];
        assert!(boot.critical);
        assert_eq!(boot.devices, vec!["bridge".to_string()]);
        assert_eq!(boot.parameters["greeting"], "hi");
        assert_eq!(config.vats["alice"].enable_pipelining, Some(true));
        assert_eq!(config.vats["alice"].reap_interval, Some(5));
    }

    #[test]
    fn test_bootstrap_must_name_a_vat() {
        let err = KernelConfig::from_toml("bootstrap = \"ghost\"").unwrap_err();
        assert!(matches!(err, KernelError::Config(_)));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = KernelConfig::default();
        config.vats.insert("a".into(), StaticVatConfig::new("a"));
        let text = config.to_toml().unwrap();
        assert_eq!(KernelConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_load_bundles_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), b"{}").unwrap();
        let mut config = KernelConfig::default();
        config.bundles.insert("a".into(), PathBuf::from("a.json"));
        let bundles = config.load_bundles(dir.path()).unwrap();
        assert_eq!(bundles["a"], b"{}".to_vec());
    }
}
