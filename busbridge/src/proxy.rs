//! Proxy lifecycle: bus connections, name ownership, the two message pumps
//! and orderly shutdown.

use std::sync::Arc;

use busbridge_core::{BusType, DBUS_INTERFACE, DBUS_PATH, ProxyConfig, ProxyError};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zbus::fdo::{DBusProxy, RequestNameFlags};
use zbus::message::Type;
use zbus::{Connection, Message, MessageStream};

use crate::agent;
use crate::discovery;
use crate::forward;
use crate::introspect::{self, DISCOVERY_TIMEOUT, Introspection};
use crate::signals;
use crate::state::ProxyState;

/// Why the event loop stopped. All of these are normal shutdowns; startup
/// failures are errors instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupted,
    Terminated,
    SourceVanished,
    NameLost,
    ConnectionClosed,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ShutdownReason::Interrupted => "interrupted",
            ShutdownReason::Terminated => "terminated",
            ShutdownReason::SourceVanished => "source service vanished",
            ShutdownReason::NameLost => "target name lost",
            ShutdownReason::ConnectionClosed => "bus connection closed",
        };
        f.write_str(text)
    }
}

async fn connect_bus(bus_type: BusType) -> zbus::Result<Connection> {
    match bus_type {
        BusType::System => Connection::system().await,
        BusType::Session => Connection::session().await,
    }
}

/// The assembled proxy.
pub struct Proxy {
    state: Arc<ProxyState>,
}

impl Proxy {
    /// Establish both bus connections. Fails fatally if either bus is
    /// unreachable.
    pub async fn connect(config: ProxyConfig) -> Result<Self, ProxyError> {
        config.validate()?;

        let source = connect_bus(config.source_bus_type)
            .await
            .map_err(|err| ProxyError::ConnectFailed { bus: "source", source: err })?;
        info!(bus = %config.source_bus_type, "connected to source bus");

        let target = connect_bus(config.target_bus_type)
            .await
            .map_err(|err| ProxyError::ConnectFailed { bus: "target", source: err })?;
        info!(bus = %config.target_bus_type, "connected to target bus");

        let source_dbus = DBusProxy::new(&source).await?;
        let target_dbus = DBusProxy::new(&target).await?;

        Ok(Self {
            state: Arc::new(ProxyState::new(config, source, target, source_dbus, target_dbus)),
        })
    }

    pub fn state(&self) -> &Arc<ProxyState> {
        &self.state
    }

    /// Introspect the configured root once before going any further, so a
    /// misconfigured or absent service fails the startup instead of
    /// producing an empty mirror.
    pub async fn probe_source(&self) -> Result<(), ProxyError> {
        let config = &self.state.config;
        info!(
            service = config.source_bus_name,
            path = config.source_object_path,
            "fetching introspection data from source"
        );
        match introspect::introspect(
            &self.state.source,
            &config.source_bus_name,
            &config.source_object_path,
            DISCOVERY_TIMEOUT,
        )
        .await?
        {
            Introspection::Node(_) => {
                info!("introspection data parsed successfully");
                Ok(())
            }
            Introspection::NotFound => Err(ProxyError::IntrospectFailed {
                path: config.source_object_path.clone(),
                reason: "object does not exist".to_string(),
            }),
            Introspection::ParseError(reason) => Err(ProxyError::IntrospectFailed {
                path: config.source_object_path.clone(),
                reason,
            }),
        }
    }

    /// Claim the proxy's well-known name on the target bus.
    pub async fn acquire_name(&self) -> Result<(), ProxyError> {
        let name = &self.state.config.target_bus_name;
        match self
            .state
            .target
            .request_name_with_flags(name.as_str(), RequestNameFlags::DoNotQueue.into())
            .await
        {
            Ok(_) => {
                info!(name, "name acquired on target bus");
                Ok(())
            }
            Err(zbus::Error::NameTaken) => Err(ProxyError::NameOwnFailed {
                name: name.clone(),
                reason: "name already taken".to_string(),
            }),
            Err(err) => Err(ProxyError::NameOwnFailed {
                name: name.clone(),
                reason: err.to_string(),
            }),
        }
    }

    /// One-shot setup after the name is owned: signal subscriptions, then
    /// the discovery walk. Discovery errors are logged, not fatal.
    pub async fn setup(&self) -> Result<(), ProxyError> {
        signals::subscribe(&self.state).await?;

        let root = self.state.config.source_object_path.clone();
        if let Err(err) = discovery::discover(Arc::clone(&self.state), root, true).await {
            warn!(%err, "object tree discovery was incomplete");
        }

        let objects = self.state.tables().proxied_objects.len();
        info!(objects, "object tree proxying complete");
        Ok(())
    }

    /// Run until a signal arrives, the source vanishes or the name is lost,
    /// then tear everything down in order.
    pub async fn run(self) -> Result<ShutdownReason, ProxyError> {
        let state = self.state;
        let (tx, mut rx) = mpsc::channel::<ShutdownReason>(4);

        let tasks: Vec<JoinHandle<()>> = vec![
            tokio::spawn(watch_source(Arc::clone(&state), tx.clone())),
            tokio::spawn(watch_name_lost(Arc::clone(&state), tx.clone())),
            tokio::spawn(pump_target(Arc::clone(&state), tx.clone())),
            tokio::spawn(pump_source(Arc::clone(&state), tx.clone())),
        ];

        let reason = tokio::select! {
            _ = tokio::signal::ctrl_c() => ShutdownReason::Interrupted,
            _ = sigterm() => ShutdownReason::Terminated,
            Some(reason) = rx.recv() => reason,
        };
        info!(%reason, "shutting down");

        shutdown(&state).await;
        for task in tasks {
            task.abort();
        }
        Ok(reason)
    }
}

/// Wait for SIGTERM; pends forever where it cannot be registered.
async fn sigterm() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    std::future::pending::<()>().await;
}

/// Watch the source service's well-known name; fires once when it loses its
/// owner. A rename (non-empty new owner) is not a vanish.
async fn watch_source(state: Arc<ProxyState>, tx: mpsc::Sender<ShutdownReason>) {
    let name = state.config.source_bus_name.clone();
    let mut stream = match state
        .source_dbus
        .receive_name_owner_changed_with_args(&[(0, name.as_str())])
        .await
    {
        Ok(stream) => stream,
        Err(err) => {
            error!(%err, "failed to watch source name");
            let _ = tx.send(ShutdownReason::ConnectionClosed).await;
            return;
        }
    };

    while let Some(signal) = stream.next().await {
        let Ok(args) = signal.args() else { continue };
        if args.new_owner().is_none() {
            info!(name, "source service vanished");
            let _ = tx.send(ShutdownReason::SourceVanished).await;
            return;
        }
    }
}

/// Watch for losing the proxy's own name on the target bus.
async fn watch_name_lost(state: Arc<ProxyState>, tx: mpsc::Sender<ShutdownReason>) {
    let mut stream = match state.target_dbus.receive_name_lost().await {
        Ok(stream) => stream,
        Err(err) => {
            error!(%err, "failed to watch for name loss");
            return;
        }
    };

    while let Some(signal) = stream.next().await {
        let Ok(args) = signal.args() else { continue };
        if args.name().as_str() == state.config.target_bus_name {
            error!(name = state.config.target_bus_name, "lost name on target bus");
            let _ = tx.send(ShutdownReason::NameLost).await;
            return;
        }
    }
}

/// Pump for the target connection: client method calls (each forwarded in
/// its own task) and the `NameOwnerChanged` signals backing the agent name
/// watches (handled in order, inline).
async fn pump_target(state: Arc<ProxyState>, tx: mpsc::Sender<ShutdownReason>) {
    let mut stream = MessageStream::from(&state.target);
    while let Some(next) = stream.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(err) => {
                error!(%err, "target bus stream failed");
                break;
            }
        };
        match msg.message_type() {
            Type::MethodCall => {
                let state = Arc::clone(&state);
                tokio::spawn(forward::handle_target_call(state, msg));
            }
            Type::Signal => handle_target_signal(&state, &msg).await,
            _ => {}
        }
    }
    let _ = tx.send(ShutdownReason::ConnectionClosed).await;
}

async fn handle_target_signal(state: &Arc<ProxyState>, msg: &Message) {
    let is_owner_change = {
        let header = msg.header();
        header.interface().is_some_and(|i| i.as_str() == DBUS_INTERFACE)
            && header.member().is_some_and(|m| m.as_str() == "NameOwnerChanged")
            && header.path().is_some_and(|p| p.as_str() == DBUS_PATH)
    };
    if !is_owner_change {
        return;
    }
    let (name, old_owner, new_owner): (String, String, String) = match msg.body().deserialize() {
        Ok(args) => args,
        Err(err) => {
            debug!(%err, "malformed NameOwnerChanged signal");
            return;
        }
    };
    agent::handle_name_owner_changed(
        state,
        &name,
        Some(old_owner.as_str()).filter(|o| !o.is_empty()),
        Some(new_owner.as_str()).filter(|n| !n.is_empty()),
    )
    .await;
}

/// Pump for the source connection: service callbacks into agent objects and
/// the forwarded signal traffic. Signals are handled inline so their
/// ordering is preserved.
async fn pump_source(state: Arc<ProxyState>, tx: mpsc::Sender<ShutdownReason>) {
    let mut stream = MessageStream::from(&state.source);
    while let Some(next) = stream.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(err) => {
                error!(%err, "source bus stream failed");
                break;
            }
        };
        match msg.message_type() {
            Type::MethodCall => {
                let state = Arc::clone(&state);
                tokio::spawn(forward::handle_source_call(state, msg));
            }
            Type::Signal => signals::handle_source_signal(&state, &msg).await,
            _ => {}
        }
    }
    let _ = tx.send(ShutdownReason::ConnectionClosed).await;
}

/// Orderly teardown: signal subscriptions, then agents, then the mirror
/// tables, then the name. Connections flush and close on drop.
async fn shutdown(state: &Arc<ProxyState>) {
    signals::unsubscribe(state).await;
    agent::shutdown(state).await;

    let (objects, interfaces) = {
        let mut tables = state.tables_mut();
        let objects = tables.proxied_objects.len();
        let interfaces = tables.interface_cache.len();
        tables.proxied_objects.clear();
        tables.interface_cache.clear();
        (objects, interfaces)
    };
    info!(objects, interfaces, "mirror registrations released");

    if let Err(err) = state
        .target
        .release_name(state.config.target_bus_name.as_str())
        .await
    {
        debug!(%err, "failed to release name");
    }
}
