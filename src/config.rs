use serde::{Deserialize, Serialize};

use crate::{
    error::{FtmsError, Result},
    types::ConnectionParams,
};

/// Configuration for one FTMS device link
///
/// Values come from the host's configuration store. The crate never persists
/// them itself.
///
/// # Examples
///
/// ```
/// use ftms_link::FtmsConfig;
///
/// let config = FtmsConfig::from_toml_str(
///     r#"
///     address = "AA:BB:CC:DD:EE:FF"
///     sensors = ["power_output", "cadence"]
///
///     [connection]
///     poll_interval_ms = 2000
///     "#,
/// )?;
///
/// assert_eq!(config.sensors.len(), 2);
/// assert_eq!(config.connection.connect_timeout_ms, 10_000);
/// # Ok::<(), ftms_link::FtmsError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtmsConfig {
    /// Device address
    pub address: String,
    /// Selected sensor keys, in display order
    #[serde(default)]
    pub sensors: Vec<String>,
    /// Connection timing
    #[serde(default)]
    pub connection: ConnectionParams,
}

impl FtmsConfig {
    /// Create a configuration with default timing
    #[must_use]
    pub fn new<I, S>(address: impl Into<String>, sensors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            address: address.into(),
            sensors: sensors.into_iter().map(Into::into).collect(),
            connection: ConnectionParams::default(),
        }
    }

    /// Parse and validate a TOML document
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::ConfigParse`] for malformed TOML and
    /// [`FtmsError::InvalidConfig`] for out-of-range values.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration can drive a link
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::InvalidConfig`] when the address is blank or any
    /// timing value is zero.
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(FtmsError::InvalidConfig(
                "device address must not be empty".to_string(),
            ));
        }
        let params = &self.connection;
        if params.connect_timeout_ms == 0 {
            return Err(FtmsError::InvalidConfig(
                "connect_timeout_ms must be > 0".to_string(),
            ));
        }
        if params.poll_interval_ms == 0 {
            return Err(FtmsError::InvalidConfig(
                "poll_interval_ms must be > 0".to_string(),
            ));
        }
        if params.reconnect_delay_ms == 0 {
            return Err(FtmsError::InvalidConfig(
                "reconnect_delay_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Check whether switching to `other` needs a full teardown and setup
    ///
    /// The sensor selection is fixed at setup, so any change to it (or to the
    /// address or timing) is applied by reloading rather than patching a live
    /// session.
    #[must_use]
    pub fn requires_reload(&self, other: &Self) -> bool {
        self != other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config = FtmsConfig::from_toml_str(r#"address = "AA:BB:CC:DD:EE:FF""#).unwrap();
        assert_eq!(config.address, "AA:BB:CC:DD:EE:FF");
        assert!(config.sensors.is_empty());
        assert_eq!(config.connection, ConnectionParams::default());
    }

    #[test]
    fn test_parse_rejects_zero_timing() {
        let result = FtmsConfig::from_toml_str(
            r#"
            address = "AA:BB:CC:DD:EE:FF"
            [connection]
            reconnect_delay_ms = 0
            "#,
        );
        assert!(matches!(result, Err(FtmsError::InvalidConfig(_))));
    }

    #[test]
    fn test_parse_rejects_malformed_toml() {
        let result = FtmsConfig::from_toml_str("address = ");
        assert!(matches!(result, Err(FtmsError::ConfigParse(_))));
    }

    #[test]
    fn test_blank_address_is_invalid() {
        let config = FtmsConfig::new("  ", ["power_output"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sensor_change_requires_reload() {
        let current = FtmsConfig::new("AA:BB:CC:DD:EE:FF", ["power_output", "cadence"]);
        let same = current.clone();
        let changed = FtmsConfig::new("AA:BB:CC:DD:EE:FF", ["power_output"]);

        assert!(!current.requires_reload(&same));
        assert!(current.requires_reload(&changed));
    }
}
