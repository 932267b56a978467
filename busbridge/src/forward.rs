//! Method forwarding between the buses.
//!
//! Calls arriving on the target bus are relayed to the source service; calls
//! arriving on the source bus are agent callbacks and are routed to the
//! client that registered the agent. Bodies are never interpreted: they are
//! carried between connections as opaque structures, and remote error names
//! survive the round trip.

use std::sync::Arc;

use busbridge_core::rules::{self, AgentRule};
use busbridge_core::{ProxyConfig, error::dbus_error, is_standard_interface, paths};
use tracing::{debug, warn};
use zbus::message::{Body, Flags};
use zbus::{Connection, Message};
use zvariant::Structure;

use crate::agent;
use crate::state::{ProxyState, Tables};

/// Where a target-bus method call goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetRoute {
    /// Relay to the source service at the same path/interface/member.
    Forward,
    /// Intercept as an agent registration before (maybe) forwarding.
    AgentRegister(&'static AgentRule),
    AgentUnregister(&'static AgentRule),
    UnknownObject,
    UnknownInterface,
}

/// Routing decision for one call on the target bus. Pure over the tables so
/// the whole decision table is testable without a bus.
pub fn route_target_call(
    tables: &Tables,
    config: &ProxyConfig,
    path: &str,
    interface: &str,
    member: &str,
) -> TargetRoute {
    // The bus library would answer these natively for its own objects; the
    // transparent equivalent is asking the real service.
    if is_standard_interface(interface) {
        return if tables.is_mirrored(path)
            || paths::is_descendant_or_equal(path, &config.source_object_path)
        {
            TargetRoute::Forward
        } else {
            TargetRoute::UnknownObject
        };
    }

    let Some(object) = tables.proxied_objects.get(path) else {
        return TargetRoute::UnknownObject;
    };
    if !object.registrations.contains_key(interface) {
        return TargetRoute::UnknownInterface;
    }

    if member.starts_with("Register") {
        if let Some(rule) = rules::rule_for(&config.source_bus_name, interface, member)
            && rule.is_register_method(member)
        {
            return TargetRoute::AgentRegister(rule);
        }
    } else if member.starts_with("Unregister")
        && let Some(rule) = rules::rule_for(&config.source_bus_name, interface, member)
        && rule.unregister_method == member
    {
        return TargetRoute::AgentUnregister(rule);
    }

    TargetRoute::Forward
}

fn body_is_empty(body: &Body) -> bool {
    body.signature().is_none_or(|s| s.as_str().is_empty())
}

fn no_reply_expected(msg: &Message) -> bool {
    msg.primary_header().flags().contains(Flags::NoReplyExpected)
}

/// Issue the same call on the peer connection, carrying the body through as
/// an opaque structure.
pub async fn call_passthrough(
    conn: &Connection,
    destination: &str,
    path: &str,
    interface: &str,
    member: &str,
    body: &Body,
) -> zbus::Result<Message> {
    if body_is_empty(body) {
        conn.call_method(Some(destination), path, Some(interface), member, &())
            .await
    } else {
        let args: Structure<'_> = body.deserialize()?;
        conn.call_method(Some(destination), path, Some(interface), member, &args)
            .await
    }
}

async fn send_reply_body(conn: &Connection, call: &Message, reply: &Message) -> zbus::Result<()> {
    let body = reply.body();
    let out = if body_is_empty(&body) {
        Message::method_reply(call)?.build(&())?
    } else {
        let args: Structure<'_> = body.deserialize()?;
        Message::method_reply(call)?.build(&args)?
    };
    conn.send(&out).await
}

pub async fn send_error(
    conn: &Connection,
    call: &Message,
    name: &str,
    text: &str,
) -> zbus::Result<()> {
    let reply = match Message::method_error(call, name) {
        Ok(builder) => builder.build(&text)?,
        // An unusable error name falls back to the generic one.
        Err(_) => Message::method_error(call, dbus_error::FAILED)?.build(&text)?,
    };
    conn.send(&reply).await
}

/// Reply to `call` with a locally produced body.
pub async fn send_reply<B>(conn: &Connection, call: &Message, body: &B)
where
    B: serde::ser::Serialize + zvariant::DynamicType,
{
    if no_reply_expected(call) {
        return;
    }
    let outcome = async { conn.send(&Message::method_reply(call)?.build(body)?).await };
    if let Err(err) = outcome.await {
        warn!(%err, "failed to send reply");
    }
}

/// Complete the original invocation with whatever the peer produced: the
/// reply tuple verbatim, the remote error under its original name, or a
/// generic failure for transport errors.
pub async fn deliver_reply(conn: &Connection, call: &Message, result: zbus::Result<Message>) {
    if no_reply_expected(call) {
        if let Err(err) = result {
            debug!(%err, "forwarded call failed (caller expects no reply)");
        }
        return;
    }

    let outcome = match result {
        Ok(reply) => send_reply_body(conn, call, &reply).await,
        Err(zbus::Error::MethodError(name, text, _)) => {
            debug!(error = name.as_str(), "forwarded call returned an error");
            send_error(conn, call, name.as_str(), text.as_deref().unwrap_or("")).await
        }
        Err(err) => {
            warn!(%err, "forwarded call failed");
            send_error(conn, call, dbus_error::FAILED, &err.to_string()).await
        }
    };
    if let Err(err) = outcome {
        warn!(%err, "failed to deliver reply to caller");
    }
}

/// Re-emit a signal on `conn` with the original path, interface, member and
/// argument tuple.
pub async fn emit_signal_passthrough(
    conn: &Connection,
    path: &str,
    interface: &str,
    member: &str,
    body: &Body,
) -> zbus::Result<()> {
    let msg = if body_is_empty(body) {
        Message::signal(path, interface, member)?.build(&())?
    } else {
        let args: Structure<'_> = body.deserialize()?;
        Message::signal(path, interface, member)?.build(&args)?
    };
    conn.send(&msg).await
}

/// Relay one target-bus call to the source service and complete the original
/// invocation with the outcome.
pub async fn forward_target_call(
    state: &ProxyState,
    msg: &Message,
    path: &str,
    interface: &str,
    member: &str,
) {
    let result = call_passthrough(
        &state.source,
        &state.config.source_bus_name,
        path,
        interface,
        member,
        &msg.body(),
    )
    .await;
    deliver_reply(&state.target, msg, result).await;
}

/// Dispatch one method call that arrived on the target bus.
pub async fn handle_target_call(state: Arc<ProxyState>, msg: Message) {
    let (path, interface, member, sender) = {
        let header = msg.header();
        let (Some(path), Some(interface), Some(member)) =
            (header.path(), header.interface(), header.member())
        else {
            return;
        };
        (
            path.to_string(),
            interface.to_string(),
            member.to_string(),
            header.sender().map(|s| s.to_string()),
        )
    };

    debug!(path, interface, member, sender, "method call from target bus");

    let route = {
        let tables = state.tables();
        route_target_call(&tables, &state.config, &path, &interface, &member)
    };

    match route {
        TargetRoute::Forward => {
            forward_target_call(&state, &msg, &path, &interface, &member).await;
        }
        TargetRoute::AgentRegister(rule) => {
            agent::handle_register_call(&state, &msg, rule, sender, &path, &interface, &member)
                .await;
        }
        TargetRoute::AgentUnregister(_) => {
            agent::handle_unregister_call(&state, &msg, sender, &path, &interface, &member).await;
        }
        TargetRoute::UnknownObject => {
            let _ = send_error(
                &state.target,
                &msg,
                dbus_error::UNKNOWN_OBJECT,
                &format!("no such object path '{path}'"),
            )
            .await;
        }
        TargetRoute::UnknownInterface => {
            let _ = send_error(
                &state.target,
                &msg,
                dbus_error::UNKNOWN_INTERFACE,
                &format!("object at '{path}' does not implement '{interface}'"),
            )
            .await;
        }
    }
}

/// Dispatch one method call that arrived on the source bus: the service is
/// calling back into a registered agent.
pub async fn handle_source_call(state: Arc<ProxyState>, msg: Message) {
    let (path, interface, member) = {
        let header = msg.header();
        let (Some(path), Some(interface), Some(member)) =
            (header.path(), header.interface(), header.member())
        else {
            return;
        };
        (path.to_string(), interface.to_string(), member.to_string())
    };

    debug!(path, interface, member, "method call from source bus");

    // Standard-interface queries on an exposed agent object are answered
    // locally from the rule, the way a bus library would answer them from
    // its registered interface info.
    if is_standard_interface(&interface) {
        agent::handle_agent_standard_call(&state, &msg, &path, &interface, &member).await;
        return;
    }

    let owner = {
        let tables = state.tables();
        agent::lookup_owner(&tables, &path, &interface, &member)
    };

    match owner {
        Some(owner) => {
            debug!(path, owner, "routing agent callback to client");
            let result =
                call_passthrough(&state.target, &owner, &path, &interface, &member, &msg.body())
                    .await;
            deliver_reply(&state.source, &msg, result).await;
        }
        None => {
            warn!(path, interface, member, "no agent registration for callback");
            let _ = send_error(
                &state.source,
                &msg,
                dbus_error::FAILED,
                "agent callback registration not found for this method call",
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspect::NodeDescription;
    use crate::mirror;
    use busbridge_core::BusType;

    const NM: &str = "org.freedesktop.NetworkManager";
    const AGENT_MANAGER_PATH: &str = "/org/freedesktop/NetworkManager/AgentManager";
    const AGENT_MANAGER_IFACE: &str = "org.freedesktop.NetworkManager.AgentManager";

    fn config() -> ProxyConfig {
        ProxyConfig {
            source_bus_name: NM.to_string(),
            source_object_path: "/org/freedesktop/NetworkManager".to_string(),
            target_bus_name: NM.to_string(),
            source_bus_type: BusType::System,
            target_bus_type: BusType::Session,
        }
    }

    fn tables_with_manager() -> Tables {
        let mut tables = Tables::default();
        let node = Arc::new(
            NodeDescription::parse(&format!(
                r#"<node><interface name="{AGENT_MANAGER_IFACE}"/></node>"#
            ))
            .expect("parse"),
        );
        mirror::mirror_object(&mut tables, AGENT_MANAGER_PATH, node);
        let app = Arc::new(
            NodeDescription::parse(r#"<node><interface name="org.example.App"/></node>"#)
                .expect("parse"),
        );
        mirror::mirror_object(&mut tables, "/org/example/App", app);
        tables
    }

    #[test]
    fn mirrored_interface_forwards() {
        let tables = tables_with_manager();
        let route =
            route_target_call(&tables, &config(), "/org/example/App", "org.example.App", "Ping");
        assert_eq!(route, TargetRoute::Forward);
    }

    #[test]
    fn unknown_path_is_refused() {
        let tables = tables_with_manager();
        let route =
            route_target_call(&tables, &config(), "/org/missing", "org.example.App", "Ping");
        assert_eq!(route, TargetRoute::UnknownObject);
    }

    #[test]
    fn unknown_interface_on_known_path_is_refused() {
        let tables = tables_with_manager();
        let route =
            route_target_call(&tables, &config(), "/org/example/App", "org.example.Other", "Ping");
        assert_eq!(route, TargetRoute::UnknownInterface);
    }

    #[test]
    fn standard_interface_forwards_for_mirrored_path() {
        let tables = tables_with_manager();
        for interface in [
            "org.freedesktop.DBus.Properties",
            "org.freedesktop.DBus.Introspectable",
            "org.freedesktop.DBus.Peer",
        ] {
            let route =
                route_target_call(&tables, &config(), "/org/example/App", interface, "Get");
            assert_eq!(route, TargetRoute::Forward, "{interface}");
        }
    }

    #[test]
    fn standard_interface_forwards_under_source_root() {
        let tables = tables_with_manager();
        // Not mirrored, but a descendant of the configured root: Introspect
        // must still reach the source so clients can walk the tree.
        let route = route_target_call(
            &tables,
            &config(),
            "/org/freedesktop/NetworkManager/Devices",
            "org.freedesktop.DBus.Introspectable",
            "Introspect",
        );
        assert_eq!(route, TargetRoute::Forward);
    }

    #[test]
    fn standard_interface_outside_root_is_refused() {
        let tables = tables_with_manager();
        let route = route_target_call(
            &tables,
            &config(),
            "/org/elsewhere",
            "org.freedesktop.DBus.Properties",
            "Get",
        );
        assert_eq!(route, TargetRoute::UnknownObject);
    }

    #[test]
    fn register_on_manager_interface_is_intercepted() {
        let tables = tables_with_manager();
        for member in ["Register", "RegisterWithCapabilities"] {
            let route = route_target_call(
                &tables,
                &config(),
                AGENT_MANAGER_PATH,
                AGENT_MANAGER_IFACE,
                member,
            );
            assert!(
                matches!(route, TargetRoute::AgentRegister(_)),
                "{member} not intercepted"
            );
        }
    }

    #[test]
    fn unregister_on_manager_interface_is_intercepted() {
        let tables = tables_with_manager();
        let route = route_target_call(
            &tables,
            &config(),
            AGENT_MANAGER_PATH,
            AGENT_MANAGER_IFACE,
            "Unregister",
        );
        assert!(matches!(route, TargetRoute::AgentUnregister(_)));
    }

    #[test]
    fn other_manager_methods_forward_plainly() {
        let tables = tables_with_manager();
        let route = route_target_call(
            &tables,
            &config(),
            AGENT_MANAGER_PATH,
            AGENT_MANAGER_IFACE,
            "GetPermissions",
        );
        assert_eq!(route, TargetRoute::Forward);
    }

    #[test]
    fn register_prefix_without_rule_forwards() {
        let tables = tables_with_manager();
        // Member starts with "Register" but the interface has no rule.
        let route = route_target_call(
            &tables,
            &config(),
            "/org/example/App",
            "org.example.App",
            "RegisterThing",
        );
        assert_eq!(route, TargetRoute::Forward);
    }

    #[test]
    fn interception_requires_matching_source_service() {
        let tables = tables_with_manager();
        let mut other = config();
        other.source_bus_name = "org.example.OtherService".to_string();
        let route = route_target_call(
            &tables,
            &other,
            AGENT_MANAGER_PATH,
            AGENT_MANAGER_IFACE,
            "Register",
        );
        assert_eq!(route, TargetRoute::Forward);
    }
}
