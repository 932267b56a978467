pub mod config;
pub mod error;
pub mod paths;
pub mod rules;

pub use config::{BusType, ProxyConfig};
pub use error::ProxyError;
pub use rules::AgentRule;

/// The three interfaces every D-Bus object carries implicitly. The mirror
/// never registers these; the engine answers them by forwarding instead.
pub const STANDARD_INTERFACES: &[&str] = &[
    "org.freedesktop.DBus.Introspectable",
    "org.freedesktop.DBus.Peer",
    "org.freedesktop.DBus.Properties",
];

/// Well-known name, interface and object path of the message bus itself.
pub const DBUS_SERVICE: &str = "org.freedesktop.DBus";
pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";

pub const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";
pub const INTERFACES_ADDED: &str = "InterfacesAdded";
pub const INTERFACES_REMOVED: &str = "InterfacesRemoved";

pub fn is_standard_interface(name: &str) -> bool {
    STANDARD_INTERFACES.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_interfaces_are_recognised() {
        assert!(is_standard_interface("org.freedesktop.DBus.Introspectable"));
        assert!(is_standard_interface("org.freedesktop.DBus.Peer"));
        assert!(is_standard_interface("org.freedesktop.DBus.Properties"));
    }

    #[test]
    fn object_manager_is_not_standard() {
        // ObjectManager is mirrored like any service interface; only the
        // three implicit interfaces are skipped.
        assert!(!is_standard_interface(OBJECT_MANAGER_INTERFACE));
        assert!(!is_standard_interface("org.example.App"));
    }
}
