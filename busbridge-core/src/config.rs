use crate::error::ProxyError;

/// Which message bus instance a connection targets.
///
/// Anything that is not literally `"session"` parses as the system bus,
/// mirroring the lenient behaviour services have come to depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusType {
    #[default]
    System,
    Session,
}

impl BusType {
    pub fn parse(s: &str) -> Self {
        match s {
            "session" => BusType::Session,
            _ => BusType::System,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BusType::System => "system",
            BusType::Session => "session",
        }
    }
}

impl std::fmt::Display for BusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable proxy configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Well-known name of the real service on the source bus.
    pub source_bus_name: String,
    /// Root object path to mirror.
    pub source_object_path: String,
    /// Well-known name the proxy owns on the target bus.
    pub target_bus_name: String,
    pub source_bus_type: BusType,
    pub target_bus_type: BusType,
}

impl ProxyConfig {
    /// All three name/path fields must be non-empty; the two bus types may
    /// be equal (proxying between two names on the same bus is legitimate).
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.source_bus_name.is_empty() {
            return Err(ProxyError::InvalidConfig("source bus name is required"));
        }
        if self.source_object_path.is_empty() {
            return Err(ProxyError::InvalidConfig("source object path is required"));
        }
        if !self.source_object_path.starts_with('/') {
            return Err(ProxyError::InvalidConfig(
                "source object path must be absolute",
            ));
        }
        if self.target_bus_name.is_empty() {
            return Err(ProxyError::InvalidConfig("proxy bus name is required"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProxyConfig {
        ProxyConfig {
            source_bus_name: "org.freedesktop.NetworkManager".to_string(),
            source_object_path: "/org/freedesktop".to_string(),
            target_bus_name: "org.freedesktop.NetworkManager".to_string(),
            source_bus_type: BusType::System,
            target_bus_type: BusType::Session,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn empty_source_name_rejected() {
        let mut config = sample();
        config.source_bus_name.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_object_path_rejected() {
        let mut config = sample();
        config.source_object_path.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn relative_object_path_rejected() {
        let mut config = sample();
        config.source_object_path = "org/freedesktop".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_target_name_rejected() {
        let mut config = sample();
        config.target_bus_name.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn same_bus_type_on_both_sides_allowed() {
        let mut config = sample();
        config.target_bus_type = BusType::System;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bus_type_parsing_defaults_to_system() {
        assert_eq!(BusType::parse("session"), BusType::Session);
        assert_eq!(BusType::parse("system"), BusType::System);
        assert_eq!(BusType::parse("SESSION"), BusType::System);
        assert_eq!(BusType::parse("starter"), BusType::System);
        assert_eq!(BusType::parse(""), BusType::System);
    }
}
