//! Error taxonomy for the proxy.
//!
//! Only connection and name-ownership failures abort the process; everything
//! else stays local to the node, interface or agent it concerns and is
//! reported through logging or as a D-Bus error reply to the caller.

/// D-Bus error names the proxy emits itself (forwarded replies keep whatever
/// name the peer produced).
pub mod dbus_error {
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("failed to connect to {bus} bus: {source}")]
    ConnectFailed {
        bus: &'static str,
        #[source]
        source: zbus::Error,
    },

    #[error("could not acquire name '{name}' on target bus: {reason}")]
    NameOwnFailed { name: String, reason: String },

    #[error("introspection of {path} failed: {reason}")]
    IntrospectFailed { path: String, reason: String },

    #[error("interface {interface} on {path} could not be registered: {reason}")]
    RegistrationFailed {
        path: String,
        interface: String,
        reason: String,
    },

    #[error("{0}")]
    Bus(#[from] zbus::Error),
}

impl ProxyError {
    /// Whether this error should take the whole process down. Anything that
    /// is scoped to a single object or interface is survivable; a partially
    /// mirrored tree beats refusing to start.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProxyError::InvalidConfig(_)
                | ProxyError::ConnectFailed { .. }
                | ProxyError::NameOwnFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_and_name_failures_are_fatal() {
        let err = ProxyError::ConnectFailed {
            bus: "source",
            source: zbus::Error::Failure("connection refused".to_string()),
        };
        assert!(err.is_fatal());

        let err = ProxyError::NameOwnFailed {
            name: "org.example.Proxy".to_string(),
            reason: "name already taken".to_string(),
        };
        assert!(err.is_fatal());

        assert!(ProxyError::InvalidConfig("x").is_fatal());
    }

    #[test]
    fn per_node_failures_are_survivable() {
        let err = ProxyError::IntrospectFailed {
            path: "/org/example/A".to_string(),
            reason: "parse error".to_string(),
        };
        assert!(!err.is_fatal());

        let err = ProxyError::RegistrationFailed {
            path: "/org/example/A".to_string(),
            interface: "org.example.Item".to_string(),
            reason: "duplicate".to_string(),
        };
        assert!(!err.is_fatal());
    }
}
