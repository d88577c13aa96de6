//! Request Context
//!
//! The acting principal and request id carried through one table operation.

use serde_json::Value;
use uuid::Uuid;

/// Context carried through a table operation
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Request ID for tracing
    pub request_id: Uuid,

    /// Acting principal
    pub principal: Principal,
}

impl RequestContext {
    pub fn new(principal: Principal) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            principal,
        }
    }

    pub fn anonymous() -> Self {
        Self::new(Principal::anonymous())
    }

    /// Context for a known user id
    pub fn user(user_id: impl Into<Value>) -> Self {
        Self::new(Principal::user(user_id))
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::anonymous()
    }
}

/// The user on whose behalf a request runs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Principal {
    /// Injected into `user_id_on_*` fields and `{user.id}` filter values
    pub user_id: Option<Value>,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(user_id: impl Into<Value>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }
}
