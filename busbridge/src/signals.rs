//! Signal forwarding from the source bus to the target bus.
//!
//! Three daemon-side subscriptions, all scoped to the source service:
//! a catch-all, `InterfacesAdded` and `InterfacesRemoved`. The pump sees
//! each matching signal once and dispatches here.

use std::collections::HashMap;
use std::sync::Arc;

use busbridge_core::{
    DBUS_INTERFACE, DBUS_PATH, INTERFACES_ADDED, INTERFACES_REMOVED, OBJECT_MANAGER_INTERFACE,
    ProxyConfig, paths,
};
use tracing::{debug, info, warn};
use zbus::message::Type;
use zbus::{MatchRule, Message, OwnedMatchRule};
use zvariant::{OwnedObjectPath, OwnedValue};

use crate::forward;
use crate::managed;
use crate::state::{ProxyState, Tables};

fn signal_rules(source_bus_name: &str) -> zbus::Result<Vec<OwnedMatchRule>> {
    let catch_all: MatchRule<'_> = MatchRule::builder()
        .msg_type(Type::Signal)
        .sender(source_bus_name)?
        .build();
    let added: MatchRule<'_> = MatchRule::builder()
        .msg_type(Type::Signal)
        .sender(source_bus_name)?
        .interface(OBJECT_MANAGER_INTERFACE)?
        .member(INTERFACES_ADDED)?
        .build();
    let removed: MatchRule<'_> = MatchRule::builder()
        .msg_type(Type::Signal)
        .sender(source_bus_name)?
        .interface(OBJECT_MANAGER_INTERFACE)?
        .member(INTERFACES_REMOVED)?
        .build();
    Ok(vec![catch_all.into(), added.into(), removed.into()])
}

/// Install the source-bus subscriptions and remember them for removal at
/// shutdown.
pub async fn subscribe(state: &Arc<ProxyState>) -> zbus::Result<()> {
    info!("setting up signal forwarding");
    let rules = signal_rules(&state.config.source_bus_name)?;
    for rule in rules {
        state.source_dbus.add_match_rule(rule.inner().clone()).await?;
        debug!(rule = %rule.inner(), "signal subscription established");
        state.tables_mut().signal_rules.push(rule);
    }
    Ok(())
}

/// Remove the subscriptions installed by [`subscribe`]. Best effort; the
/// daemon drops them with the connection anyway.
pub async fn unsubscribe(state: &Arc<ProxyState>) {
    let rules = std::mem::take(&mut state.tables_mut().signal_rules);
    for rule in rules {
        if let Err(err) = state.source_dbus.remove_match_rule(rule.inner().clone()).await {
            debug!(%err, "failed to remove match rule");
        }
    }
}

/// Whether a catch-all signal at `path` may be re-emitted on the target:
/// only for mirrored objects, the subtree being mirrored, and the bus
/// daemon itself.
pub fn should_forward(tables: &Tables, config: &ProxyConfig, path: &str) -> bool {
    tables.is_mirrored(path)
        || paths::is_descendant_or_equal(path, &config.source_object_path)
        || path == DBUS_PATH
}

/// Dispatch one signal that arrived on the source connection.
pub async fn handle_source_signal(state: &Arc<ProxyState>, msg: &Message) {
    let (path, interface, member) = {
        let header = msg.header();
        let (Some(path), Some(interface), Some(member)) =
            (header.path(), header.interface(), header.member())
        else {
            return;
        };
        (path.to_string(), interface.to_string(), member.to_string())
    };

    // The daemon's own signals (NameAcquired and friends) are bookkeeping,
    // handled by the dedicated watchers, never forwarded.
    if interface == DBUS_INTERFACE {
        return;
    }

    debug!(path, interface, member, "signal received");

    if interface == OBJECT_MANAGER_INTERFACE && member == INTERFACES_ADDED {
        handle_interfaces_added(state, msg, &path, &interface, &member).await;
        return;
    }
    if interface == OBJECT_MANAGER_INTERFACE && member == INTERFACES_REMOVED {
        handle_interfaces_removed(state, msg, &path, &interface, &member).await;
        return;
    }

    let forwardable = {
        let tables = state.tables();
        should_forward(&tables, &state.config, &path)
    };
    if !forwardable {
        debug!(path, interface, member, "signal ignored (not proxied)");
        return;
    }
    if let Err(err) =
        forward::emit_signal_passthrough(&state.target, &path, &interface, &member, &msg.body())
            .await
    {
        warn!(path, interface, member, %err, "failed to forward signal");
    }
}

async fn handle_interfaces_added(
    state: &Arc<ProxyState>,
    msg: &Message,
    path: &str,
    interface: &str,
    member: &str,
) {
    type AddedArgs = (OwnedObjectPath, HashMap<String, HashMap<String, OwnedValue>>);
    let (added_path, interfaces): AddedArgs = match msg.body().deserialize() {
        Ok(args) => args,
        Err(err) => {
            warn!(%err, "malformed InterfacesAdded signal");
            return;
        }
    };
    let names: Vec<String> = interfaces.into_keys().collect();

    info!(path = added_path.as_str(), "InterfacesAdded");
    managed::on_interfaces_added(state, added_path.as_str(), &names).await;

    // Re-emitted only after the dual exists, so target-side subscribers can
    // immediately act on the announcement.
    if let Err(err) =
        forward::emit_signal_passthrough(&state.target, path, interface, member, &msg.body()).await
    {
        warn!(%err, "failed to forward InterfacesAdded");
    }
}

async fn handle_interfaces_removed(
    state: &Arc<ProxyState>,
    msg: &Message,
    path: &str,
    interface: &str,
    member: &str,
) {
    let (removed_path, names): (OwnedObjectPath, Vec<String>) = match msg.body().deserialize() {
        Ok(args) => args,
        Err(err) => {
            warn!(%err, "malformed InterfacesRemoved signal");
            return;
        }
    };

    // Forward before the local teardown: subscribers on the target see the
    // removal while the dual still exists.
    let forwardable = {
        let tables = state.tables();
        should_forward(&tables, &state.config, path)
    };
    if forwardable
        && let Err(err) = forward::emit_signal_passthrough(
            &state.target,
            path,
            interface,
            member,
            &msg.body(),
        )
        .await
    {
        warn!(%err, "failed to forward InterfacesRemoved");
    }

    if names.is_empty() {
        info!(path = removed_path.as_str(), "InterfacesRemoved with no interfaces");
        return;
    }
    info!(path = removed_path.as_str(), count = names.len(), "InterfacesRemoved");
    managed::on_interfaces_removed(state, removed_path.as_str(), &names);
}
