//! The object mirror: which source objects the proxy answers for on the
//! target bus, and with which interfaces.
//!
//! Registration failures are reported but never fatal; a partially mirrored
//! tree is preferable to refusing to start.

use std::sync::Arc;

use busbridge_core::{ProxyError, is_standard_interface};
use tracing::{debug, info, warn};
use zbus::names::InterfaceName;

use crate::introspect::{self, Introspection, NodeDescription};
use crate::state::{ProxiedObject, ProxyState, RegistrationId, Tables};

#[derive(Debug, PartialEq, Eq)]
pub enum MirrorOutcome {
    /// The object is now mirrored with this many interfaces.
    Registered(usize),
    AlreadyMirrored,
    /// Only standard interfaces (or none at all); nothing to do.
    NoCustomInterfaces,
    /// Every custom interface failed to register.
    NothingRegistered,
}

/// Result of dropping interfaces from a mirrored object.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DropOutcome {
    pub dropped: Vec<String>,
    /// True when the last interface went away and the object was removed.
    pub object_removed: bool,
}

fn validate_interface(path: &str, name: &str) -> Result<(), ProxyError> {
    InterfaceName::try_from(name)
        .map(|_| ())
        .map_err(|err| ProxyError::RegistrationFailed {
            path: path.to_string(),
            interface: name.to_string(),
            reason: err.to_string(),
        })
}

/// Mirror one object: register every custom interface of `node` at `path`.
///
/// Per-interface failures are logged and skipped; the object is entered into
/// the tables as long as at least one interface registered.
pub fn mirror_object(tables: &mut Tables, path: &str, node: Arc<NodeDescription>) -> MirrorOutcome {
    let custom = node.custom_interface_names();
    if custom.is_empty() {
        debug!(path, "object has only standard interfaces, skipping");
        return MirrorOutcome::NoCustomInterfaces;
    }
    if tables.is_mirrored(path) {
        debug!(path, "object is already mirrored");
        return MirrorOutcome::AlreadyMirrored;
    }

    let mut object = ProxiedObject {
        path: path.to_string(),
        node: Arc::clone(&node),
        registrations: Default::default(),
    };

    for interface in custom {
        if let Err(err) = validate_interface(path, &interface) {
            warn!(path, interface, %err, "failed to register interface");
            continue;
        }
        let id = tables.allocate_registration();
        debug!(path, interface, ?id, "interface registered");
        object.registrations.insert(interface, id);
    }

    if object.registrations.is_empty() {
        warn!(path, "no custom interfaces could be registered");
        return MirrorOutcome::NothingRegistered;
    }

    let count = object.registrations.len();
    for interface in object.registrations.keys() {
        tables
            .interface_cache
            .insert((path.to_string(), interface.clone()), Arc::clone(&node));
    }
    tables.proxied_objects.insert(path.to_string(), object);
    info!(path, interfaces = count, "object mirrored");
    MirrorOutcome::Registered(count)
}

/// Register one freshly parsed interface on an already mirrored object.
pub fn register_parsed(
    tables: &mut Tables,
    path: &str,
    interface: &str,
    node: Arc<NodeDescription>,
) -> Result<RegistrationId, ProxyError> {
    validate_interface(path, interface)?;

    if !tables.is_mirrored(path) {
        return Err(ProxyError::RegistrationFailed {
            path: path.to_string(),
            interface: interface.to_string(),
            reason: "object is not mirrored".to_string(),
        });
    }
    if tables.has_registration(path, interface) {
        return Err(ProxyError::RegistrationFailed {
            path: path.to_string(),
            interface: interface.to_string(),
            reason: "interface already registered".to_string(),
        });
    }

    let id = tables.allocate_registration();
    let object = tables
        .proxied_objects
        .get_mut(path)
        .expect("presence checked above");
    object.registrations.insert(interface.to_string(), id);
    tables
        .interface_cache
        .insert((path.to_string(), interface.to_string()), node);
    info!(path, interface, ?id, "interface registered");
    Ok(id)
}

/// Add one interface to a mirrored object, introspecting the source for its
/// description first. Used by the ObjectManager tracker for incremental
/// `InterfacesAdded` updates.
pub async fn add_interface(
    state: &ProxyState,
    path: &str,
    interface: &str,
) -> Result<(), ProxyError> {
    if is_standard_interface(interface) {
        return Ok(());
    }
    if state.tables().has_registration(path, interface) {
        debug!(path, interface, "interface already registered");
        return Ok(());
    }

    let node = match introspect::introspect(
        &state.source,
        &state.config.source_bus_name,
        path,
        introspect::INCREMENTAL_TIMEOUT,
    )
    .await?
    {
        Introspection::Node(node) => Arc::new(node),
        Introspection::NotFound => {
            return Err(ProxyError::RegistrationFailed {
                path: path.to_string(),
                interface: interface.to_string(),
                reason: "object vanished before it could be introspected".to_string(),
            });
        }
        Introspection::ParseError(reason) => {
            return Err(ProxyError::IntrospectFailed {
                path: path.to_string(),
                reason,
            });
        }
    };

    if node.lookup_interface(interface).is_none() {
        return Err(ProxyError::RegistrationFailed {
            path: path.to_string(),
            interface: interface.to_string(),
            reason: "interface not present in introspection data".to_string(),
        });
    }

    // Re-validate under the write lock: the object may have been dropped
    // while the introspection was in flight.
    let mut tables = state.tables_mut();
    if tables.has_registration(path, interface) {
        return Ok(());
    }
    register_parsed(&mut tables, path, interface, node).map(|_| ())
}

/// Release the named interfaces at `path`; removes the object once the last
/// registration is gone. Unknown paths and unknown interfaces are no-ops.
pub fn drop_interfaces(tables: &mut Tables, path: &str, interfaces: &[String]) -> DropOutcome {
    let mut outcome = DropOutcome::default();
    let Some(object) = tables.proxied_objects.get_mut(path) else {
        debug!(path, "object not in mirror, ignoring removal");
        return outcome;
    };

    for interface in interfaces {
        if object.registrations.remove(interface).is_none() {
            debug!(path, interface, "interface was not registered, skipping");
            continue;
        }
        tables
            .interface_cache
            .remove(&(path.to_string(), interface.clone()));
        debug!(path, interface, "interface unregistered");
        outcome.dropped.push(interface.clone());
    }

    if object.registrations.is_empty() {
        tables.proxied_objects.remove(path);
        info!(path, "all interfaces removed, object dropped from mirror");
        outcome.object_removed = true;
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(xml: &str) -> Arc<NodeDescription> {
        Arc::new(NodeDescription::parse(xml).expect("parse"))
    }

    fn app_node() -> Arc<NodeDescription> {
        node(r#"
            <node>
              <interface name="org.freedesktop.DBus.Introspectable"/>
              <interface name="org.freedesktop.DBus.Properties"/>
              <interface name="org.example.App"/>
              <interface name="org.example.Extra"/>
            </node>"#)
    }

    #[test]
    fn mirror_registers_custom_interfaces_only() {
        let mut tables = Tables::default();
        let outcome = mirror_object(&mut tables, "/org/example/App", app_node());
        assert_eq!(outcome, MirrorOutcome::Registered(2));

        let object = tables.proxied_objects.get("/org/example/App").expect("object");
        assert!(object.registrations.contains_key("org.example.App"));
        assert!(object.registrations.contains_key("org.example.Extra"));
        assert!(!object.registrations.contains_key("org.freedesktop.DBus.Properties"));
    }

    #[test]
    fn mirror_populates_interface_cache() {
        let mut tables = Tables::default();
        mirror_object(&mut tables, "/org/example/App", app_node());
        // cache and registrations correspond both ways
        for (path, interface) in tables.interface_cache.keys() {
            assert!(tables.has_registration(path, interface));
        }
        let object = &tables.proxied_objects["/org/example/App"];
        for interface in object.registrations.keys() {
            assert!(tables
                .interface_cache
                .contains_key(&("/org/example/App".to_string(), interface.clone())));
        }
    }

    #[test]
    fn standard_only_object_is_skipped() {
        let mut tables = Tables::default();
        let outcome = mirror_object(
            &mut tables,
            "/org/example/Empty",
            node(r#"
                <node>
                  <interface name="org.freedesktop.DBus.Introspectable"/>
                  <interface name="org.freedesktop.DBus.Peer"/>
                </node>"#),
        );
        assert_eq!(outcome, MirrorOutcome::NoCustomInterfaces);
        assert!(!tables.is_mirrored("/org/example/Empty"));
    }

    #[test]
    fn second_mirror_of_same_path_is_a_noop() {
        let mut tables = Tables::default();
        mirror_object(&mut tables, "/org/example/App", app_node());
        let outcome = mirror_object(&mut tables, "/org/example/App", app_node());
        assert_eq!(outcome, MirrorOutcome::AlreadyMirrored);
        assert_eq!(tables.proxied_objects.len(), 1);
    }

    #[test]
    fn invalid_interface_name_is_skipped_but_others_register() {
        let mut tables = Tables::default();
        let outcome = mirror_object(
            &mut tables,
            "/org/example/App",
            node(r#"
                <node>
                  <interface name="not-a-valid-interface"/>
                  <interface name="org.example.App"/>
                </node>"#),
        );
        assert_eq!(outcome, MirrorOutcome::Registered(1));
        let object = &tables.proxied_objects["/org/example/App"];
        assert!(object.registrations.contains_key("org.example.App"));
    }

    #[test]
    fn all_invalid_interfaces_leaves_object_unmirrored() {
        let mut tables = Tables::default();
        let outcome = mirror_object(
            &mut tables,
            "/org/example/App",
            node(r#"<node><interface name="bogus"/></node>"#),
        );
        assert_eq!(outcome, MirrorOutcome::NothingRegistered);
        assert!(!tables.is_mirrored("/org/example/App"));
        assert!(tables.interface_cache.is_empty());
    }

    #[test]
    fn register_parsed_requires_mirrored_object() {
        let mut tables = Tables::default();
        let err = register_parsed(&mut tables, "/org/example/App", "org.example.App", app_node());
        assert!(err.is_err());
    }

    #[test]
    fn register_parsed_rejects_duplicates() {
        let mut tables = Tables::default();
        mirror_object(&mut tables, "/org/example/App", app_node());
        let err = register_parsed(&mut tables, "/org/example/App", "org.example.App", app_node());
        assert!(err.is_err());
    }

    #[test]
    fn register_parsed_adds_interface_and_cache_entry() {
        let mut tables = Tables::default();
        mirror_object(&mut tables, "/org/example/App", app_node());
        let fresh = node(r#"<node><interface name="org.example.New"/></node>"#);
        register_parsed(&mut tables, "/org/example/App", "org.example.New", fresh).expect("register");
        assert!(tables.has_registration("/org/example/App", "org.example.New"));
        assert!(tables
            .interface_cache
            .contains_key(&("/org/example/App".to_string(), "org.example.New".to_string())));
    }

    #[test]
    fn drop_subset_keeps_object() {
        let mut tables = Tables::default();
        mirror_object(&mut tables, "/org/example/App", app_node());
        let outcome = drop_interfaces(
            &mut tables,
            "/org/example/App",
            &["org.example.Extra".to_string()],
        );
        assert_eq!(outcome.dropped, vec!["org.example.Extra".to_string()]);
        assert!(!outcome.object_removed);
        assert!(tables.is_mirrored("/org/example/App"));
        assert!(!tables
            .interface_cache
            .contains_key(&("/org/example/App".to_string(), "org.example.Extra".to_string())));
    }

    #[test]
    fn drop_last_interface_removes_object() {
        let mut tables = Tables::default();
        mirror_object(&mut tables, "/org/example/App", app_node());
        let outcome = drop_interfaces(
            &mut tables,
            "/org/example/App",
            &["org.example.App".to_string(), "org.example.Extra".to_string()],
        );
        assert!(outcome.object_removed);
        assert!(!tables.is_mirrored("/org/example/App"));
        assert!(tables.interface_cache.is_empty());
    }

    #[test]
    fn add_then_remove_round_trips_to_original_state() {
        let mut tables = Tables::default();
        mirror_object(&mut tables, "/org/example/App", app_node());
        let before: Vec<String> = {
            let mut names: Vec<String> = tables.proxied_objects["/org/example/App"]
                .registrations
                .keys()
                .cloned()
                .collect();
            names.sort();
            names
        };

        let fresh = node(r#"<node><interface name="org.example.Transient"/></node>"#);
        register_parsed(&mut tables, "/org/example/App", "org.example.Transient", fresh)
            .expect("register");
        drop_interfaces(
            &mut tables,
            "/org/example/App",
            &["org.example.Transient".to_string()],
        );

        let after: Vec<String> = {
            let mut names: Vec<String> = tables.proxied_objects["/org/example/App"]
                .registrations
                .keys()
                .cloned()
                .collect();
            names.sort();
            names
        };
        assert_eq!(before, after);
    }

    #[test]
    fn drop_on_unknown_path_is_a_noop() {
        let mut tables = Tables::default();
        let outcome = drop_interfaces(&mut tables, "/org/missing", &["org.example.App".to_string()]);
        assert_eq!(outcome, DropOutcome::default());
    }
}
