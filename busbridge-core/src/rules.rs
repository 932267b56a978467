//! The static callback-agent rule table.
//!
//! A rule describes one family of register-a-callback protocols: which
//! manager interface clients talk to, which members register and unregister,
//! and what interface the service expects to call back into. Supporting a
//! new protocol family means adding a table entry; the forwarding and
//! registry code is generic over rules.

/// One callback protocol family.
#[derive(Debug, PartialEq, Eq)]
pub struct AgentRule {
    /// Well-known name of the service this rule applies to.
    pub service_name: &'static str,
    /// Object path of the manager clients call Register/Unregister on.
    pub manager_path: &'static str,
    pub manager_interface: &'static str,
    pub register_methods: &'static [&'static str],
    pub unregister_method: &'static str,
    /// When true, the first Register argument is the object path the client
    /// exports its agent at; otherwise `client_object_path` is fixed.
    pub path_customizable: bool,
    pub client_object_path: &'static str,
    /// Interface the service calls back into, and the members it may use.
    pub client_interface: &'static str,
    pub client_methods: &'static [&'static str],
}

const NM_SECRET_AGENT_METHODS: &[&str] =
    &["GetSecrets", "CancelGetSecrets", "SaveSecrets", "DeleteSecrets"];

/// NetworkManager secret agents: `Register` / `RegisterWithCapabilities` on
/// the AgentManager, callbacks on `org.freedesktop.NetworkManager.SecretAgent`
/// at a fixed path.
pub static AGENT_RULES: &[AgentRule] = &[AgentRule {
    service_name: "org.freedesktop.NetworkManager",
    manager_path: "/org/freedesktop/NetworkManager/AgentManager",
    manager_interface: "org.freedesktop.NetworkManager.AgentManager",
    register_methods: &["Register", "RegisterWithCapabilities"],
    unregister_method: "Unregister",
    path_customizable: false,
    client_object_path: "/org/freedesktop/NetworkManager/SecretAgent",
    client_interface: "org.freedesktop.NetworkManager.SecretAgent",
    client_methods: NM_SECRET_AGENT_METHODS,
}];

impl AgentRule {
    pub fn is_register_method(&self, member: &str) -> bool {
        self.register_methods.contains(&member)
    }

    pub fn is_client_method(&self, member: &str) -> bool {
        self.client_methods.contains(&member)
    }
}

/// Find the rule matching a manager call, by exact service name and manager
/// interface, with the member being one of the register methods or the
/// unregister method.
pub fn rule_for(service_name: &str, interface: &str, member: &str) -> Option<&'static AgentRule> {
    AGENT_RULES.iter().find(|rule| {
        rule.service_name == service_name
            && rule.manager_interface == interface
            && (rule.is_register_method(member) || rule.unregister_method == member)
    })
}
