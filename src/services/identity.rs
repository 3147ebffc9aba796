//! Identity Boundary
//!
//! Role lookup for approval gates and the write-back of approval status
//! onto the business entity a workflow acts upon.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// Identity and authorization collaborator.
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Roles held by a user. Unknown users hold none.
    async fn user_roles(&self, user_id: &str) -> Result<Vec<String>, DispatchError>;

    /// Users holding at least one of `roles`.
    async fn resolve_role_holders(&self, roles: &[String]) -> Result<Vec<String>, DispatchError>;

    /// Records the outcome of a business approval on the target entity.
    async fn update_entity_approval_status(
        &self,
        update: ApprovalStatusUpdate,
    ) -> Result<(), DispatchError>;
}

/// Approval outcome written back to a business entity.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalStatusUpdate {
    pub entity_type: String,
    pub entity_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// In-process identity service backed by a static role table.
///
/// Status updates are kept in memory so callers can inspect them.
#[derive(Debug, Default)]
pub struct StaticIdentityService {
    roles: RwLock<BTreeMap<String, BTreeSet<String>>>,
    updates: Mutex<Vec<ApprovalStatusUpdate>>,
}

impl StaticIdentityService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a user with the given roles.
    pub fn with_user<I, S>(self, user_id: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let user_id = user_id.into();
        for role in roles {
            self.grant(&user_id, role);
        }
        self
    }

    pub fn grant(&self, user_id: &str, role: impl Into<String>) {
        let mut table = self.roles.write().unwrap_or_else(|e| e.into_inner());
        table.entry(user_id.to_string()).or_default().insert(role.into());
    }

    /// Approval status updates received so far, oldest first.
    pub fn status_updates(&self) -> Vec<ApprovalStatusUpdate> {
        self.updates.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl IdentityService for StaticIdentityService {
    async fn user_roles(&self, user_id: &str) -> Result<Vec<String>, DispatchError> {
        let table = self.roles.read().unwrap_or_else(|e| e.into_inner());
        Ok(table
            .get(user_id)
            .map(|roles| roles.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn resolve_role_holders(&self, roles: &[String]) -> Result<Vec<String>, DispatchError> {
        let table = self.roles.read().unwrap_or_else(|e| e.into_inner());
        Ok(table
            .iter()
            .filter(|(_, held)| roles.iter().any(|r| held.contains(r)))
            .map(|(user, _)| user.clone())
            .collect())
    }

    async fn update_entity_approval_status(
        &self,
        update: ApprovalStatusUpdate,
    ) -> Result<(), DispatchError> {
        info!(
            "{} {} approval status -> {} (by {})",
            update.entity_type,
            update.entity_id,
            update.status,
            update.approver_id.as_deref().unwrap_or("system")
        );
        self.updates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(update);
        Ok(())
    }
}
