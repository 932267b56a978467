//! The callback-agent registry.
//!
//! Clients on the target bus register callback objects (agents) with a
//! manager interface of the source service; the service later calls back
//! into them. The proxy intercepts the `Register*`/`Unregister*` calls,
//! exposes a per-client object on the source bus, and routes the service's
//! callbacks to the client that owns the registration.
//!
//! The first registration for a `unique_path` is *primary* and owns the
//! source-side exposure. Further registrations of the same path by other
//! clients are *secondary*: recorded, but without an exposure of their own.
//! When the primary goes away its exposure is torn down; secondaries are not
//! promoted, and callbacks to that path answer with an error while they
//! linger.

use std::sync::Arc;

use busbridge_core::rules::AgentRule;
use busbridge_core::{DBUS_INTERFACE, DBUS_PATH, DBUS_SERVICE, error::dbus_error, paths};
use tracing::{debug, info, warn};
use zbus::message::{Body, Type};
use zbus::{MatchRule, Message, OwnedMatchRule};
use zvariant::Value;

use crate::forward;
use crate::state::{ProxyState, RegistrationId, Tables};

/// Lifecycle of one registration. `Pending` entries have their exposure in
/// place but the service has not yet acknowledged the forwarded `Register*`;
/// `Releasing` entries are detached from the tables and mid-teardown. A
/// removed entry is gone, there is no state for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentLifecycle {
    Pending,
    Registered,
    Releasing,
}

/// One active agent registration.
#[derive(Debug)]
pub struct AgentData {
    /// Unique bus name of the registering client on the target bus.
    pub owner: String,
    /// The path the client asked to register (or the rule's fixed path).
    pub logical_path: String,
    /// The path actually exposed on the source bus for this registration.
    pub unique_path: String,
    pub rule: &'static AgentRule,
    /// Source-side exposure; `None` marks a secondary registration.
    pub source_registration: Option<RegistrationId>,
    /// `NameOwnerChanged` match rule watching the owner, removed on cleanup.
    pub name_watch: OwnedMatchRule,
    pub lifecycle: AgentLifecycle,
}

impl AgentData {
    pub fn is_primary(&self) -> bool {
        self.source_registration.is_some()
    }
}

/// Outcome of recording a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterDecision {
    /// Same client, same path: nothing new, reply success and do not forward.
    Duplicate,
    /// Path already exposed for another client: recorded without a new
    /// exposure, reply success and do not forward.
    Secondary,
    /// Fresh exposure created; the `Register*` call must reach the service.
    Primary,
}

/// Record a registration. Pure table mutation; the caller handles the bus
/// side (name watch, forwarding).
pub fn register(
    tables: &mut Tables,
    rule: &'static AgentRule,
    sender: &str,
    logical_path: String,
    unique_path: String,
    name_watch: OwnedMatchRule,
) -> RegisterDecision {
    let same_owner = tables
        .agents
        .iter()
        .any(|a| a.unique_path == unique_path && a.owner == sender);
    if same_owner {
        return RegisterDecision::Duplicate;
    }

    let path_taken = tables.agents.iter().any(|a| a.unique_path == unique_path);
    if path_taken {
        tables.agents.push(AgentData {
            owner: sender.to_string(),
            logical_path,
            unique_path,
            rule,
            source_registration: None,
            name_watch,
            lifecycle: AgentLifecycle::Registered,
        });
        return RegisterDecision::Secondary;
    }

    let id = tables.allocate_registration();
    tables.agents.push(AgentData {
        owner: sender.to_string(),
        logical_path,
        unique_path,
        rule,
        source_registration: Some(id),
        name_watch,
        lifecycle: AgentLifecycle::Pending,
    });
    RegisterDecision::Primary
}

/// Flip a pending entry to `Registered` once the forwarded `Register*`
/// succeeded. The entry may have been removed while the call was in flight;
/// that is fine.
pub fn confirm_registered(tables: &mut Tables, unique_path: &str, owner: &str) {
    if let Some(entry) = tables
        .agents
        .iter_mut()
        .find(|a| a.unique_path == unique_path && a.owner == owner)
    {
        entry.lifecycle = AgentLifecycle::Registered;
    }
}

/// Remove the entry matching an `Unregister*` call, if any.
pub fn unregister(
    tables: &mut Tables,
    sender: &str,
    manager_path: &str,
    manager_interface: &str,
    member: &str,
) -> Option<AgentData> {
    let index = tables.agents.iter().position(|a| {
        a.owner == sender
            && a.rule.manager_path == manager_path
            && a.rule.manager_interface == manager_interface
            && a.rule.unregister_method == member
    })?;
    let mut entry = tables.agents.remove(index);
    entry.lifecycle = AgentLifecycle::Releasing;
    Some(entry)
}

/// Resolve the client a source-side callback should be routed to: the owner
/// of the *primary* registration at `unique_path`, provided the call is on
/// the rule's client interface and one of its allowed members.
///
/// Secondary entries never receive callbacks: the exposure at the path
/// belongs to the primary, and once the primary is gone the path no longer
/// routes anywhere even while secondaries linger in the table.
pub fn lookup_owner(tables: &Tables, unique_path: &str, interface: &str, member: &str) -> Option<String> {
    let entry = tables
        .agents
        .iter()
        .find(|a| a.unique_path == unique_path && a.is_primary())?;
    if entry.rule.client_interface == interface && entry.rule.is_client_method(member) {
        Some(entry.owner.clone())
    } else {
        None
    }
}

/// Remove every entry owned by `old_owner`, marking them `Releasing`.
pub fn take_vanished(tables: &mut Tables, old_owner: &str) -> Vec<AgentData> {
    let mut kept = Vec::with_capacity(tables.agents.len());
    let mut removed = Vec::new();
    for mut entry in tables.agents.drain(..) {
        if entry.owner == old_owner {
            entry.lifecycle = AgentLifecycle::Releasing;
            removed.push(entry);
        } else {
            kept.push(entry);
        }
    }
    tables.agents = kept;
    removed
}

/// Introspection XML for an exposed agent object, synthesized from its rule.
/// Method argument signatures are unknown to the proxy; callers of the
/// service call the methods directly rather than generating bindings.
pub fn agent_introspection_xml(rule: &AgentRule) -> String {
    let mut xml = String::from("<node>\n");
    xml.push_str(&format!("  <interface name=\"{}\">\n", rule.client_interface));
    for method in rule.client_methods {
        xml.push_str(&format!("    <method name=\"{method}\"/>\n"));
    }
    xml.push_str("  </interface>\n");
    xml.push_str("  <interface name=\"org.freedesktop.DBus.Introspectable\">\n");
    xml.push_str("    <method name=\"Introspect\">\n");
    xml.push_str("      <arg type=\"s\" direction=\"out\"/>\n");
    xml.push_str("    </method>\n");
    xml.push_str("  </interface>\n");
    xml.push_str("  <interface name=\"org.freedesktop.DBus.Peer\">\n");
    xml.push_str("    <method name=\"Ping\"/>\n");
    xml.push_str("  </interface>\n");
    xml.push_str("</node>\n");
    xml
}

fn name_watch_rule(owner: &str) -> zbus::Result<OwnedMatchRule> {
    let rule: MatchRule<'_> = MatchRule::builder()
        .msg_type(Type::Signal)
        .sender(DBUS_SERVICE)?
        .path(DBUS_PATH)?
        .interface(DBUS_INTERFACE)?
        .member("NameOwnerChanged")?
        .arg(0, owner)?
        .build();
    Ok(rule.into())
}

fn first_object_path_arg(body: &Body) -> Option<String> {
    let args: zvariant::Structure<'_> = body.deserialize().ok()?;
    match args.fields().first() {
        Some(Value::ObjectPath(path)) => Some(path.to_string()),
        _ => None,
    }
}

/// Handle an intercepted `Register*` call from a target-bus client.
pub async fn handle_register_call(
    state: &Arc<ProxyState>,
    msg: &Message,
    rule: &'static AgentRule,
    sender: Option<String>,
    path: &str,
    interface: &str,
    member: &str,
) {
    let Some(sender) = sender else {
        let _ = forward::send_error(&state.target, msg, dbus_error::FAILED, "no sender").await;
        return;
    };

    let (logical_path, unique_path) = if rule.path_customizable {
        match first_object_path_arg(&msg.body()) {
            Some(agent_path) => {
                let unique = paths::unique_agent_path(&agent_path, &sender);
                (agent_path, unique)
            }
            None => {
                // Can't derive a path; let the service answer the malformed
                // call itself.
                warn!(sender, member, "could not extract agent path from parameters");
                forward::forward_target_call(state, msg, path, interface, member).await;
                return;
            }
        }
    } else {
        (
            rule.client_object_path.to_string(),
            rule.client_object_path.to_string(),
        )
    };

    let watch = match name_watch_rule(&sender) {
        Ok(watch) => watch,
        Err(err) => {
            warn!(sender, %err, "could not build name watch");
            let _ = forward::send_error(&state.target, msg, dbus_error::FAILED, &err.to_string())
                .await;
            return;
        }
    };

    // Subscribe before recording; the duplicate path gives its instance back.
    if let Err(err) = state.target_dbus.add_match_rule(watch.inner().clone()).await {
        warn!(sender, %err, "failed to subscribe to NameOwnerChanged");
    }

    let decision = {
        let mut tables = state.tables_mut();
        register(
            &mut tables,
            rule,
            &sender,
            logical_path,
            unique_path.clone(),
            watch.clone(),
        )
    };

    match decision {
        RegisterDecision::Duplicate => {
            info!(sender, unique_path, "client already registered at this path");
            let _ = state
                .target_dbus
                .remove_match_rule(watch.inner().clone())
                .await;
            forward::send_reply(&state.target, msg, &()).await;
        }
        RegisterDecision::Secondary => {
            info!(sender, unique_path, "secondary registration recorded");
            forward::send_reply(&state.target, msg, &()).await;
        }
        RegisterDecision::Primary => {
            info!(sender, unique_path, "agent exposed on source bus");
            let result = forward::call_passthrough(
                &state.source,
                &state.config.source_bus_name,
                path,
                interface,
                member,
                &msg.body(),
            )
            .await;
            if result.is_ok() {
                // Re-acquire and re-validate: the entry may have been
                // released while the forward was in flight.
                let mut tables = state.tables_mut();
                confirm_registered(&mut tables, &unique_path, &sender);
            }
            forward::deliver_reply(&state.target, msg, result).await;
        }
    }
}

/// Handle an intercepted `Unregister*` call from a target-bus client.
pub async fn handle_unregister_call(
    state: &Arc<ProxyState>,
    msg: &Message,
    sender: Option<String>,
    path: &str,
    interface: &str,
    member: &str,
) {
    let Some(sender) = sender else {
        let _ = forward::send_error(&state.target, msg, dbus_error::FAILED, "no sender").await;
        return;
    };

    let removed = {
        let mut tables = state.tables_mut();
        unregister(&mut tables, &sender, path, interface, member)
    };

    match removed {
        None => {
            // Nothing of ours; the service decides what an unknown
            // unregistration means.
            forward::forward_target_call(state, msg, path, interface, member).await;
        }
        Some(entry) => {
            let _ = state
                .target_dbus
                .remove_match_rule(entry.name_watch.inner().clone())
                .await;
            if entry.is_primary() {
                info!(sender, unique_path = entry.unique_path, "agent unregistered");
                forward::forward_target_call(state, msg, path, interface, member).await;
            } else {
                info!(
                    sender,
                    unique_path = entry.unique_path,
                    "secondary registration removed, service not involved"
                );
                forward::send_reply(&state.target, msg, &()).await;
            }
        }
    }
}

/// Answer standard-interface calls on an exposed agent object from the rule
/// it was synthesized from.
pub async fn handle_agent_standard_call(
    state: &Arc<ProxyState>,
    msg: &Message,
    path: &str,
    interface: &str,
    member: &str,
) {
    let rule = {
        let tables = state.tables();
        tables
            .agents
            .iter()
            .find(|a| a.unique_path == path && a.is_primary())
            .map(|a| a.rule)
    };
    let Some(rule) = rule else {
        let _ = forward::send_error(
            &state.source,
            msg,
            dbus_error::UNKNOWN_OBJECT,
            &format!("no such object path '{path}'"),
        )
        .await;
        return;
    };

    match (interface, member) {
        ("org.freedesktop.DBus.Introspectable", "Introspect") => {
            forward::send_reply(&state.source, msg, &agent_introspection_xml(rule)).await;
        }
        ("org.freedesktop.DBus.Peer", "Ping") => {
            forward::send_reply(&state.source, msg, &()).await;
        }
        ("org.freedesktop.DBus.Properties", "GetAll") => {
            let empty: std::collections::HashMap<String, Value<'_>> = Default::default();
            forward::send_reply(&state.source, msg, &empty).await;
        }
        _ => {
            let _ = forward::send_error(
                &state.source,
                msg,
                dbus_error::UNKNOWN_METHOD,
                &format!("method {interface}.{member} not available here"),
            )
            .await;
        }
    }
}

/// React to `NameOwnerChanged` on the target bus.
///
/// Name acquisitions are ignored; renames are unsupported and keep the old
/// mapping. A vanished owner releases all its registrations, telling the
/// service to forget each primary first.
pub async fn handle_name_owner_changed(
    state: &Arc<ProxyState>,
    name: &str,
    old_owner: Option<&str>,
    new_owner: Option<&str>,
) {
    let Some(old_owner) = old_owner.filter(|o| !o.is_empty()) else {
        return;
    };
    if let Some(new_owner) = new_owner.filter(|n| !n.is_empty()) {
        warn!(name, old_owner, new_owner, "client renamed, unsupported, keeping old mapping");
        return;
    }

    let removed = {
        let mut tables = state.tables_mut();
        take_vanished(&mut tables, old_owner)
    };
    if removed.is_empty() {
        return;
    }
    info!(owner = old_owner, count = removed.len(), "client vanished, releasing its agents");

    for entry in removed {
        if entry.is_primary() {
            // The service must forget the agent, or it will keep calling a
            // path that no longer routes anywhere.
            let result = state
                .source
                .call_method(
                    Some(state.config.source_bus_name.as_str()),
                    entry.rule.manager_path,
                    Some(entry.rule.manager_interface),
                    entry.rule.unregister_method,
                    &(),
                )
                .await;
            match result {
                Ok(_) => debug!(owner = entry.owner, "service unregister call succeeded"),
                Err(err) => {
                    warn!(owner = entry.owner, %err, "service unregister call failed, continuing cleanup");
                }
            }
        }
        let _ = state
            .target_dbus
            .remove_match_rule(entry.name_watch.inner().clone())
            .await;
    }
}

/// Drop every registration at shutdown. Local teardown only; the proxy is
/// exiting and the source service will observe its connection go away.
pub async fn shutdown(state: &Arc<ProxyState>) {
    let entries = {
        let mut tables = state.tables_mut();
        std::mem::take(&mut tables.agents)
    };
    if entries.is_empty() {
        return;
    }
    info!(count = entries.len(), "releasing agent registrations");
    for entry in entries {
        let _ = state
            .target_dbus
            .remove_match_rule(entry.name_watch.inner().clone())
            .await;
    }
}
