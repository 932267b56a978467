//! Shared proxy state.
//!
//! All mutable bookkeeping lives in [`Tables`] behind a single reader/writer
//! lock. Guards are confined to synchronous scopes: handlers snapshot what
//! they need, release the lock, perform bus I/O, then re-acquire and look up
//! by key again. No guard ever lives across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use busbridge_core::ProxyConfig;
use zbus::{Connection, OwnedMatchRule, fdo::DBusProxy};

use crate::agent::AgentData;
use crate::introspect::NodeDescription;

/// Handle for one interface registered on behalf of a mirrored object or an
/// agent. Owning the bus name is what routes calls to the proxy; a
/// registration is the dispatch-table entry that decides whether a call is
/// served or refused, so the handle is valid exactly as long as its table
/// entry exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

/// One mirrored source object.
#[derive(Debug)]
pub struct ProxiedObject {
    pub path: String,
    /// Parsed introspection this object was mirrored from.
    pub node: Arc<NodeDescription>,
    /// interface name → registration. Never contains a standard interface.
    pub registrations: HashMap<String, RegistrationId>,
}

/// The mutable tables, guarded together by one lock.
#[derive(Debug, Default)]
pub struct Tables {
    /// path → mirrored object.
    pub proxied_objects: HashMap<String, ProxiedObject>,
    /// (path, interface) → parsed description backing that registration.
    /// Entries exist iff the corresponding registration exists.
    pub interface_cache: HashMap<(String, String), Arc<NodeDescription>>,
    /// Active agent registrations, newest last. Small by nature; linear scans
    /// are how the registry is queried.
    pub agents: Vec<AgentData>,
    /// Source-bus signal match rules, removed again at shutdown.
    pub signal_rules: Vec<OwnedMatchRule>,
    next_registration: u64,
}

impl Tables {
    pub fn allocate_registration(&mut self) -> RegistrationId {
        self.next_registration += 1;
        RegistrationId(self.next_registration)
    }

    pub fn is_mirrored(&self, path: &str) -> bool {
        self.proxied_objects.contains_key(path)
    }

    pub fn has_registration(&self, path: &str, interface: &str) -> bool {
        self.proxied_objects
            .get(path)
            .is_some_and(|obj| obj.registrations.contains_key(interface))
    }
}

/// Everything the engine shares between tasks: the two connections, their
/// bus-daemon proxies and the tables.
pub struct ProxyState {
    pub config: ProxyConfig,
    pub source: Connection,
    pub target: Connection,
    pub source_dbus: DBusProxy<'static>,
    pub target_dbus: DBusProxy<'static>,
    tables: RwLock<Tables>,
}

impl ProxyState {
    pub fn new(
        config: ProxyConfig,
        source: Connection,
        target: Connection,
        source_dbus: DBusProxy<'static>,
        target_dbus: DBusProxy<'static>,
    ) -> Self {
        Self {
            config,
            source,
            target,
            source_dbus,
            target_dbus,
            tables: RwLock::new(Tables::default()),
        }
    }

    /// A poisoned lock only means some reader panicked mid-read; every write
    /// path leaves the tables consistent, so recover the guard.
    pub fn tables(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tables_mut(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables();
        f.debug_struct("ProxyState")
            .field("source", &self.config.source_bus_name)
            .field("target", &self.config.target_bus_name)
            .field("proxied_objects", &tables.proxied_objects.len())
            .field("agents", &tables.agents.len())
            .finish()
    }
}
