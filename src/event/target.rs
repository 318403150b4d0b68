use super::Scope;
use crate::context::RequestContext;
use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};

/// Addressing half of an event: a scope plus the one key that scope needs.
///
/// Equality is on `(scope, key)`; keys that the scope does not use are never
/// stored, so two targets compare equal iff they address the same recipients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventTarget {
    scope: Scope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
}

impl EventTarget {
    pub fn new(scope: Scope, key: Option<String>) -> Self {
        let key = match scope {
            Scope::World => None,
            _ => key.filter(|k| !k.trim().is_empty()),
        };
        Self { scope, key }
    }

    pub fn world() -> Self {
        Self::new(Scope::World, None)
    }

    pub fn channel(channel: impl Into<String>) -> Self {
        Self::new(Scope::Channel, Some(channel.into()))
    }

    pub fn user(user_key: impl Into<String>) -> Self {
        Self::new(Scope::User, Some(user_key.into()))
    }

    pub fn connection(connection_id: impl Into<String>) -> Self {
        Self::new(Scope::SelfOnly, Some(connection_id.into()))
    }

    /// Target with the key left for [`EventTarget::resolve`] to fill in.
    pub fn unresolved(scope: Scope) -> Self {
        Self::new(scope, None)
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.key_for(Scope::Channel)
    }

    pub fn user_key(&self) -> Option<&str> {
        self.key_for(Scope::User)
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.key_for(Scope::SelfOnly)
    }

    fn key_for(&self, scope: Scope) -> Option<&str> {
        if self.scope == scope {
            self.key.as_deref()
        } else {
            None
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.scope == Scope::World || self.key.is_some()
    }

    /// Fills a missing key from the caller's context.
    pub fn resolve(&self, ctx: &RequestContext) -> Option<EventTarget> {
        if self.is_resolved() {
            return Some(self.clone());
        }
        let fallback = match self.scope {
            Scope::Channel => ctx.channel.clone(),
            Scope::User => ctx.user_key.clone(),
            Scope::SelfOnly => ctx.connection_id.clone(),
            Scope::World => None,
        };
        let resolved = EventTarget::new(self.scope, fallback);
        resolved.is_resolved().then_some(resolved)
    }

    pub fn require_resolved(&self, ctx: &RequestContext, name: &str) -> AppResult<EventTarget> {
        self.resolve(ctx).ok_or_else(|| AppError::UnresolvedTarget {
            name: name.to_string(),
            scope: self.scope.to_string(),
        })
    }
}
