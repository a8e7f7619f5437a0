//! Who asked for a lifecycle operation

use serde::{Deserialize, Serialize};

use crate::identity::new_id;

/// Request context attached to notifications and authoring calls
///
/// The identity layer authenticates callers before they reach the core; the
/// context only carries what it established so downstream effects can be
/// traced back to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// ULID, unique per operation
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

impl Context {
    /// Anonymous context with no user or connection
    pub fn new() -> Self {
        Self {
            id: new_id(),
            user_id: None,
            connection_id: None,
        }
    }

    pub fn for_user(user_id: impl Into<String>, connection_id: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            user_id: Some(user_id.into()),
            connection_id: Some(connection_id.into()),
        }
    }

    /// True when the context was issued for `connection_id`
    pub fn belongs_to(&self, connection_id: &str) -> bool {
        self.connection_id.as_deref() == Some(connection_id)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_context() {
        let ctx = Context::for_user("alice", "home-1");

        assert_eq!(ctx.user_id.as_deref(), Some("alice"));
        assert!(ctx.belongs_to("home-1"));
        assert!(!ctx.belongs_to("home-2"));
        assert_ne!(ctx.id, Context::for_user("alice", "home-1").id);
    }

    #[test]
    fn test_anonymous_context_belongs_nowhere() {
        assert!(!Context::new().belongs_to("home-1"));
    }

    #[test]
    fn test_anonymous_context_serializes_without_optionals() {
        let value = serde_json::to_value(Context::new()).unwrap();
        assert!(value.get("user_id").is_none());
        assert!(value.get("connection_id").is_none());
    }
}
