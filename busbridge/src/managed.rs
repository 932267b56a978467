//! ObjectManager tracking: the initial `GetManagedObjects` sweep and the
//! incremental `InterfacesAdded` / `InterfacesRemoved` updates, which keep
//! the mirror in sync without re-walking the tree.

use std::collections::HashMap;
use std::sync::Arc;

use busbridge_core::{OBJECT_MANAGER_INTERFACE, ProxyError};
use tracing::{debug, info, warn};
use zvariant::{OwnedObjectPath, OwnedValue};

use crate::discovery;
use crate::introspect::{self, DISCOVERY_TIMEOUT, Introspection};
use crate::mirror;
use crate::state::ProxyState;

type ManagedObjects = HashMap<OwnedObjectPath, HashMap<String, HashMap<String, OwnedValue>>>;

/// Enumerate a manager's objects and mirror each of them.
///
/// Every returned path is introspected individually; the properties in the
/// reply are not trusted as a substitute for the real interface descriptions.
pub async fn bootstrap(state: &Arc<ProxyState>, manager_path: &str) -> Result<(), ProxyError> {
    let reply = state
        .source
        .call_method(
            Some(state.config.source_bus_name.as_str()),
            manager_path,
            Some(OBJECT_MANAGER_INTERFACE),
            "GetManagedObjects",
            &(),
        )
        .await?;
    let objects: ManagedObjects = reply.body().deserialize()?;

    info!(manager_path, count = objects.len(), "enumerating managed objects");

    for (path, _interfaces) in objects {
        let path = path.as_str();
        match introspect::introspect(
            &state.source,
            &state.config.source_bus_name,
            path,
            DISCOVERY_TIMEOUT,
        )
        .await
        {
            Ok(Introspection::Node(node)) => {
                let mut tables = state.tables_mut();
                mirror::mirror_object(&mut tables, path, Arc::new(node));
            }
            Ok(Introspection::NotFound) => {
                debug!(path, "managed object vanished before introspection");
            }
            Ok(Introspection::ParseError(reason)) => {
                warn!(path, reason, "could not parse managed object, skipping");
            }
            Err(err) => {
                warn!(path, %err, "failed to introspect managed object, skipping");
            }
        }
    }

    Ok(())
}

/// Handle `InterfacesAdded` for `path`.
///
/// An unknown path gets a scoped discovery pass (without ObjectManager
/// handoff at this depth); a known one gains only the interfaces it is
/// missing.
pub async fn on_interfaces_added(state: &Arc<ProxyState>, path: &str, interfaces: &[String]) {
    let mirrored = state.tables().is_mirrored(path);

    if !mirrored {
        info!(path, "new object announced, mirroring");
        if let Err(err) = discovery::discover(Arc::clone(state), path.to_string(), false).await {
            warn!(path, %err, "failed to mirror announced object");
        }
        return;
    }

    for interface in interfaces {
        if state.tables().has_registration(path, interface) {
            debug!(path, interface, "interface already registered");
            continue;
        }
        info!(path, interface, "adding interface to mirrored object");
        if let Err(err) = mirror::add_interface(state, path, interface).await {
            warn!(path, interface, %err, "failed to add interface");
        }
    }
}

/// Handle `InterfacesRemoved` for `path`. Unknown paths are a no-op.
pub fn on_interfaces_removed(state: &ProxyState, path: &str, interfaces: &[String]) {
    let mut tables = state.tables_mut();
    let outcome = mirror::drop_interfaces(&mut tables, path, interfaces);
    if !outcome.dropped.is_empty() {
        info!(
            path,
            dropped = outcome.dropped.len(),
            object_removed = outcome.object_removed,
            "interfaces removed"
        );
    }
}
