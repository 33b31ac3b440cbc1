//! Hot-tier key composition.
//!
//! Every key the broker writes is shaped as
//! `<prefix><tenant>:<namespace>:<kind>:<name>` with
//! `kind ∈ {sm, topic, retry, dlq}`. Kinds never collide because the kind
//! segment is fixed per key family, and two scopes never collide because
//! tenant and namespace always appear before the kind.

use serde::{Deserialize, Serialize};

/// Tenant used when the caller does not specify one.
pub const DEFAULT_TENANT: &str = "default";

/// Namespace used when the caller does not specify one.
pub const DEFAULT_NAMESPACE: &str = "msg";

/// Default hot-key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "cw:";

/// Tenant/namespace pair scoping every operation.
///
/// The two labels are orthogonal: tenants isolate customers, namespaces
/// isolate applications within a tenant. Both are embedded into every hot
/// key, so operations in one scope cannot observe another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub tenant: String,
    pub namespace: String,
}

impl Scope {
    pub fn new(tenant: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            namespace: namespace.into(),
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new(DEFAULT_TENANT, DEFAULT_NAMESPACE)
    }
}

/// Composes hot-tier keys under a configured prefix.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn compose(&self, scope: &Scope, kind: &str, name: &str) -> String {
        format!(
            "{}{}:{}:{}:{}",
            self.prefix, scope.tenant, scope.namespace, kind, name
        )
    }

    /// Key for a shared-memory value.
    pub fn shared_memory(&self, scope: &Scope, name: &str) -> String {
        self.compose(scope, "sm", name)
    }

    /// Key of a topic's log.
    pub fn topic(&self, scope: &Scope, topic: &str) -> String {
        self.compose(scope, "topic", topic)
    }

    /// Key of the retry sorted-set for `(topic, subscription)`.
    pub fn retry(&self, scope: &Scope, topic: &str, subscription: &str) -> String {
        self.compose(scope, "retry", &format!("{}:{}", topic, subscription))
    }

    /// Key of a topic's dead-letter log.
    pub fn dead_letter(&self, scope: &Scope, topic: &str) -> String {
        self.compose(scope, "dlq", topic)
    }

    /// Consumer-group name for a subscription.
    pub fn group(subscription: &str) -> String {
        format!("sub:{}", subscription)
    }

    /// Key of the hash holding a subscription's persisted configuration.
    pub fn subscription_config(&self, scope: &Scope, topic: &str, subscription: &str) -> String {
        format!("{}:sub:{}:config", self.topic(scope, topic), subscription)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composes_expected_shapes() {
        let keys = KeySpace::default();
        let scope = Scope::default();

        assert_eq!(keys.topic(&scope, "orders"), "cw:default:msg:topic:orders");
        assert_eq!(keys.shared_memory(&scope, "k1"), "cw:default:msg:sm:k1");

        let scoped = Scope::new("t1", "ns");
        assert_eq!(
            keys.retry(&scoped, "orders", "fraud"),
            "cw:t1:ns:retry:orders:fraud"
        );
        assert_eq!(keys.dead_letter(&scoped, "orders"), "cw:t1:ns:dlq:orders");
    }

    #[test]
    fn group_and_config_keys() {
        let keys = KeySpace::default();
        let scope = Scope::default();

        assert_eq!(KeySpace::group("fraud"), "sub:fraud");
        assert_eq!(
            keys.subscription_config(&scope, "orders", "fraud"),
            "cw:default:msg:topic:orders:sub:fraud:config"
        );
    }

    #[test]
    fn scopes_do_not_collide() {
        let keys = KeySpace::default();
        let a = keys.topic(&Scope::new("t1", "ns1"), "orders");
        let b = keys.topic(&Scope::new("t2", "ns2"), "orders");
        let c = keys.topic(&Scope::new("t1", "ns2"), "orders");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn kinds_do_not_collide() {
        // A topic named like another kind's payload must not produce the
        // same key as that kind.
        let keys = KeySpace::default();
        let scope = Scope::default();
        assert_ne!(
            keys.topic(&scope, "orders"),
            keys.dead_letter(&scope, "orders")
        );
        assert_ne!(
            keys.retry(&scope, "orders", "s"),
            keys.topic(&scope, "orders:s")
        );
    }
}
