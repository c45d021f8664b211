//! Chain configuration
//!
//! ```toml
//! [params.beansPerUnit]
//! blockComputeLimit = 8000000000
//! vatCreation = 30000000
//! xsnapComputron = 100
//!
//! [bridge]
//! bank = "bank"
//! wallet = "walletFactory"
//! ```
//!
//! `[bridge]` routes each inbound action kind to the vat whose root
//! receives `inbound(kind, body)`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::BlockError;

/// Bean key: per-block compute ceiling.
pub const BLOCK_COMPUTE_LIMIT: &str = "blockComputeLimit";
/// Bean key: cost of creating a vat.
pub const VAT_CREATION: &str = "vatCreation";
/// Bean key: cost of one computron.
pub const XSNAP_COMPUTRON: &str = "xsnapComputron";

/// Metering parameters, in beans per unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainParams {
    /// Beans charged per unit of each resource.
    pub beans_per_unit: BTreeMap<String, u64>,
}

impl Default for ChainParams {
    fn default() -> Self {
        let beans_per_unit = [
            (BLOCK_COMPUTE_LIMIT, 8_000_000_000),
            (VAT_CREATION, 30_000_000),
            (XSNAP_COMPUTRON, 100),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self { beans_per_unit }
    }
}

impl ChainParams {
    /// Beans for `key`, falling back to the default table.
    pub fn beans(&self, key: &str) -> u64 {
        match self.beans_per_unit.get(key) {
            Some(beans) => *beans,
            None => ChainParams::default()
                .beans_per_unit
                .get(key)
                .copied()
                .unwrap_or(0),
        }
    }

    /// Same table with one entry replaced.
    pub fn with_beans(mut self, key: &str, beans: u64) -> Self {
        self.beans_per_unit.insert(key.to_string(), beans);
        self
    }
}

/// Block manager settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Parameters used when a block does not bring its own.
    #[serde(default)]
    pub params: ChainParams,

    /// Handler vat name by inbound action kind.
    #[serde(default)]
    pub bridge: BTreeMap<String, String>,
}

impl ChainConfig {
    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, BlockError> {
        let config: ChainConfig =
            toml::from_str(content).map_err(|e| BlockError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, BlockError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Add a bridge route.
    pub fn route(mut self, kind: impl Into<String>, vat_name: impl Into<String>) -> Self {
        self.bridge.insert(kind.into(), vat_name.into());
        self
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), BlockError> {
        if self.params.beans(XSNAP_COMPUTRON) == 0 {
            return Err(BlockError::config("xsnapComputron must be positive"));
        }
        for (kind, vat) in &self.bridge {
            if vat.is_empty() {
                return Err(BlockError::config(format!("bridge route {kind:?} has no vat")));
            }
        }
        Ok(())
    }

    /// Handler vat for an inbound action kind.
    pub fn handler(&self, kind: &str) -> Option<&str> {
        self.bridge.get(kind).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_default_params() {
        let config = ChainConfig::from_toml("").unwrap();
        assert_eq!(config.params, ChainParams::default());
        assert!(config.bridge.is_empty());
    }

    #[test]
    fn test_parse_params_and_routes() {
        let config = ChainConfig::from_toml(
            r#"
            [params.beansPerUnit]
            blockComputeLimit = 500
            xsnapComputron = 2

            [bridge]
            bank = "bank"
            "#,
        )
        .unwrap();
        assert_eq!(config.params.beans(BLOCK_COMPUTE_LIMIT), 500);
        assert_eq!(config.params.beans(XSNAP_COMPUTRON), 2);
        // missing keys fall back to the defaults
        assert_eq!(config.params.beans(VAT_CREATION), 30_000_000);
        assert_eq!(config.handler("bank"), Some("bank"));
        assert_eq!(config.handler("wallet"), None);
    }

    #[test]
    fn test_zero_computron_price_rejected() {
        let err = ChainConfig::from_toml(
            r#"
            [params.beansPerUnit]
            xsnapComputron = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, BlockError::Config(_)));
    }
}
