//! Introspection of source-bus objects.
//!
//! A [`NodeDescription`] is the parsed `Introspect` result for one object
//! path: its interfaces and the names of its child nodes. Parsed descriptions
//! are cached by `(path, interface)` in the proxy tables and shared via `Arc`;
//! registrations reference the shared description rather than re-parsing.

use std::time::Duration;

use busbridge_core::{ProxyError, is_standard_interface};
use tracing::debug;
use zbus::Connection;

/// Per-node timeout for the initial tree walk.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
/// Tighter timeout for incremental interface additions, which run while the
/// proxy is already serving traffic.
pub const INCREMENTAL_TIMEOUT: Duration = Duration::from_secs(5);

const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";

/// Parsed introspection data for one object path.
#[derive(Debug)]
pub struct NodeDescription {
    node: zbus_xml::Node<'static>,
}

impl NodeDescription {
    pub fn parse(xml: &str) -> Result<Self, zbus_xml::Error> {
        let node = zbus_xml::Node::from_reader(xml.as_bytes())?;
        Ok(Self { node })
    }

    /// Names of all interfaces the node declares.
    pub fn interface_names(&self) -> impl Iterator<Item = String> + '_ {
        self.node.interfaces().iter().map(|i| i.name().as_str().to_string())
    }

    /// Interfaces the mirror registers: everything except the three the bus
    /// library answers implicitly.
    pub fn custom_interface_names(&self) -> Vec<String> {
        self.interface_names()
            .filter(|name| !is_standard_interface(name))
            .collect()
    }

    pub fn has_interface(&self, name: &str) -> bool {
        self.interface_names().any(|n| n == name)
    }

    pub fn lookup_interface(&self, name: &str) -> Option<&zbus_xml::Interface<'static>> {
        self.node.interfaces().iter().find(|i| i.name().as_str() == name)
    }

    /// Relative names of child nodes; unnamed children are dropped here so
    /// discovery does not have to care.
    pub fn child_names(&self) -> Vec<&str> {
        self.node
            .nodes()
            .iter()
            .filter_map(|n| n.name())
            .filter(|n| !n.is_empty())
            .collect()
    }
}

/// Result of introspecting one path.
#[derive(Debug)]
pub enum Introspection {
    Node(NodeDescription),
    /// The object does not exist (or the whole service is gone). Expected
    /// during tree walks and never treated as an error.
    NotFound,
    /// The service answered with XML we could not parse.
    ParseError(String),
}

/// Call `Introspect` on `path` at `service` and parse the reply.
///
/// Transport-level failures (timeout, disconnected bus) surface as `Err`;
/// callers abort only the subtree they were working on.
pub async fn introspect(
    conn: &Connection,
    service: &str,
    path: &str,
    deadline: Duration,
) -> Result<Introspection, ProxyError> {
    let call = conn.call_method(
        Some(service),
        path,
        Some("org.freedesktop.DBus.Introspectable"),
        "Introspect",
        &(),
    );

    let reply = match tokio::time::timeout(deadline, call).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(zbus::Error::MethodError(name, _, _)))
            if name.as_str() == UNKNOWN_OBJECT || name.as_str() == SERVICE_UNKNOWN =>
        {
            debug!(path, "object does not exist, skipping");
            return Ok(Introspection::NotFound);
        }
        Ok(Err(err)) => {
            return Err(ProxyError::IntrospectFailed {
                path: path.to_string(),
                reason: err.to_string(),
            });
        }
        Err(_) => {
            return Err(ProxyError::IntrospectFailed {
                path: path.to_string(),
                reason: format!("no reply within {}s", deadline.as_secs()),
            });
        }
    };

    let xml: String = reply.body().deserialize().map_err(|err| {
        ProxyError::IntrospectFailed {
            path: path.to_string(),
            reason: err.to_string(),
        }
    })?;

    debug!(path, bytes = xml.len(), "introspection XML received");

    match NodeDescription::parse(&xml) {
        Ok(node) => Ok(Introspection::Node(node)),
        Err(err) => Ok(Introspection::ParseError(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP_XML: &str = r#"
        <node>
          <interface name="org.freedesktop.DBus.Introspectable">
            <method name="Introspect"><arg type="s" direction="out"/></method>
          </interface>
          <interface name="org.freedesktop.DBus.Properties"/>
          <interface name="org.freedesktop.DBus.Peer"/>
          <interface name="org.example.App">
            <method name="Ping"><arg type="s" direction="out"/></method>
            <signal name="Pinged"><arg type="u"/></signal>
            <property name="Version" type="s" access="read"/>
          </interface>
          <node name="Settings"/>
          <node name="Status"/>
          <node/>
        </node>"#;

    #[test]
    fn parses_interfaces_and_children() {
        let node = NodeDescription::parse(APP_XML).expect("parse");
        assert!(node.has_interface("org.example.App"));
        assert!(node.has_interface("org.freedesktop.DBus.Peer"));
        assert_eq!(node.child_names(), vec!["Settings", "Status"]);
    }

    #[test]
    fn custom_interfaces_exclude_standard_ones() {
        let node = NodeDescription::parse(APP_XML).expect("parse");
        assert_eq!(node.custom_interface_names(), vec!["org.example.App".to_string()]);
    }

    #[test]
    fn lookup_interface_finds_members() {
        let node = NodeDescription::parse(APP_XML).expect("parse");
        let iface = node.lookup_interface("org.example.App").expect("interface");
        assert_eq!(iface.methods().len(), 1);
        assert_eq!(iface.signals().len(), 1);
        assert_eq!(iface.properties().len(), 1);
        assert!(node.lookup_interface("org.example.Missing").is_none());
    }

    #[test]
    fn node_without_custom_interfaces_yields_empty_set() {
        let xml = r#"
            <node>
              <interface name="org.freedesktop.DBus.Introspectable"/>
              <node name="child"/>
            </node>"#;
        let node = NodeDescription::parse(xml).expect("parse");
        assert!(node.custom_interface_names().is_empty());
        assert_eq!(node.child_names(), vec!["child"]);
    }

    #[test]
    fn garbage_xml_is_a_parse_error() {
        assert!(NodeDescription::parse("<node><interface></node>").is_err());
        assert!(NodeDescription::parse("not xml at all").is_err());
    }
}
