//! Depth-first discovery of the source object tree.
//!
//! Each node is introspected, mirrored, and its children walked. A node that
//! declares `org.freedesktop.DBus.ObjectManager` ends the manual walk for its
//! subtree: the manager is authoritative there and the ObjectManager tracker
//! takes over.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use busbridge_core::{OBJECT_MANAGER_INTERFACE, ProxyError, paths};
use tracing::{debug, info, warn};

use crate::introspect::{self, DISCOVERY_TIMEOUT, Introspection};
use crate::managed;
use crate::mirror;
use crate::state::ProxyState;

/// Walk the tree under `path`, mirroring every node.
///
/// `follow_manager` controls the ObjectManager short-circuit. The initial
/// walk follows it; the scoped re-discovery run for `InterfacesAdded` on an
/// unknown path does not, so a nested manager cannot hijack an incremental
/// update.
///
/// Missing nodes are skipped silently and parse failures are logged and
/// skipped; an `Err` from deeper I/O aborts only the subtree it came from.
pub fn discover(
    state: Arc<ProxyState>,
    path: String,
    follow_manager: bool,
) -> Pin<Box<dyn Future<Output = Result<(), ProxyError>> + Send>> {
    Box::pin(async move {
        debug!(path, "discovering object tree");

        let node = match introspect::introspect(
            &state.source,
            &state.config.source_bus_name,
            &path,
            DISCOVERY_TIMEOUT,
        )
        .await?
        {
            Introspection::Node(node) => Arc::new(node),
            Introspection::NotFound => return Ok(()),
            Introspection::ParseError(reason) => {
                warn!(path, reason, "could not parse introspection XML, skipping subtree");
                return Ok(());
            }
        };

        if follow_manager && node.has_interface(OBJECT_MANAGER_INTERFACE) {
            info!(path, "ObjectManager found, handing subtree over");
            {
                let mut tables = state.tables_mut();
                mirror::mirror_object(&mut tables, &path, Arc::clone(&node));
            }
            return managed::bootstrap(&state, &path).await;
        }

        {
            let mut tables = state.tables_mut();
            mirror::mirror_object(&mut tables, &path, Arc::clone(&node));
        }

        for child in node.child_names() {
            let child_path = paths::child_path(&path, child);
            if let Err(err) = discover(Arc::clone(&state), child_path.clone(), follow_manager).await
            {
                warn!(path = child_path, %err, "discovery of subtree failed");
            }
        }

        Ok(())
    })
}
