//! Officer registry.
//!
//! An explicit mapping supplied by the caller, built once from
//! configuration and passed by reference to whatever needs it. It answers
//! two questions: which officer carries a given device, and which
//! identifier is canonical for a given alias.

use crate::config::RegistryConfig;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfficerRegistry {
    devices: BTreeMap<String, String>,
    aliases: BTreeMap<String, String>,
}

impl From<&RegistryConfig> for OfficerRegistry {
    fn from(config: &RegistryConfig) -> Self {
        let mut registry = Self::default();
        for (alias, canonical) in &config.aliases {
            registry = registry.with_alias(alias, canonical);
        }
        for (device, officer) in &config.devices {
            registry = registry.with_device(device, officer);
        }
        registry
    }
}

impl OfficerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device (by source id) as carried by `officer`.
    pub fn with_device(mut self, device: impl Into<String>, officer: impl Into<String>) -> Self {
        self.devices
            .insert(normalize_device(&device.into()), officer.into());
        self
    }

    /// Register `alias` as another name for `canonical`.
    pub fn with_alias(mut self, alias: impl Into<String>, canonical: impl Into<String>) -> Self {
        self.aliases.insert(alias.into(), canonical.into());
        self
    }

    /// Canonical identifier for `identifier`; unknown identifiers map to themselves.
    pub fn canonical<'a>(&'a self, identifier: &'a str) -> &'a str {
        self.aliases
            .get(identifier)
            .map(String::as_str)
            .unwrap_or(identifier)
    }

    /// Canonical officer carrying `device`, if registered.
    pub fn officer_for_device(&self, device: &str) -> Option<&str> {
        self.devices
            .get(&normalize_device(device))
            .map(|officer| self.canonical(officer))
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

/// MAC addresses arrive in mixed case and with either separator.
fn normalize_device(device: &str) -> String {
    device.trim().to_ascii_uppercase().replace('-', ":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_resolution() {
        let registry = OfficerRegistry::new().with_alias("Unit 123", "123");
        assert_eq!(registry.canonical("Unit 123"), "123");
        assert_eq!(registry.canonical("123"), "123");
        assert_eq!(registry.canonical("456"), "456");
    }

    #[test]
    fn test_device_lookup_is_normalized() {
        let registry = OfficerRegistry::new()
            .with_device("00:1a:2b:3c:4d:5e", "Unit 123")
            .with_alias("Unit 123", "123");

        assert_eq!(registry.officer_for_device("00-1A-2B-3C-4D-5E"), Some("123"));
        assert_eq!(registry.officer_for_device("AA:BB:CC:DD:EE:FF"), None);
    }

    #[test]
    fn test_devices_share_an_officer() {
        let registry = OfficerRegistry::new()
            .with_device("00:1A:2B:3C:4D:5E", "123")
            .with_device("AA:BB:CC:DD:EE:FF", "Unit 123")
            .with_device("11:22:33:44:55:66", "456")
            .with_alias("Unit 123", "123");

        assert_eq!(registry.officer_for_device("AA:BB:CC:DD:EE:FF"), Some("123"));
        assert_eq!(registry.officer_for_device("11:22:33:44:55:66"), Some("456"));
        assert_eq!(registry.device_count(), 3);
    }

    #[test]
    fn test_from_config() {
        let mut config = RegistryConfig::default();
        config
            .devices
            .insert("00:1A:2B:3C:4D:5E".to_string(), "123".to_string());
        config
            .aliases
            .insert("Unit 123".to_string(), "123".to_string());

        let registry = OfficerRegistry::from(&config);
        assert_eq!(registry.officer_for_device("00:1a:2b:3c:4d:5e"), Some("123"));
        assert_eq!(registry.canonical("Unit 123"), "123");
    }
}
