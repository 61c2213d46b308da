//! Permission records gating cross-node reads.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::node::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    Public,
    Shared,
    Single,
}

/// What a caller asks for when writing a gated value.
#[derive(Debug, Clone, PartialEq)]
pub struct Permission {
    pub mode: PermissionMode,
    pub shared_with: Vec<NodeId>,
    pub single_target: Option<NodeId>,
    pub ttl: Option<Duration>,
}

impl Permission {
    pub fn public() -> Self {
        Self {
            mode: PermissionMode::Public,
            shared_with: Vec::new(),
            single_target: None,
            ttl: None,
        }
    }

    pub fn shared<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode: PermissionMode::Shared,
            shared_with: targets.into_iter().map(Into::into).collect(),
            single_target: None,
            ttl: None,
        }
    }

    pub fn single(target: impl Into<String>) -> Self {
        Self {
            mode: PermissionMode::Single,
            shared_with: Vec::new(),
            single_target: Some(target.into()),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub(crate) fn into_record(self, owner: &str, now: DateTime<Utc>) -> PermissionRecord {
        // A TTL too large to represent never expires
        let expires_at = self
            .ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| now.checked_add_signed(ttl));
        PermissionRecord {
            mode: self.mode,
            owner: owner.to_string(),
            shared_with: self.shared_with,
            single_target: self.single_target,
            expires_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRecord {
    pub mode: PermissionMode,
    pub owner: NodeId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shared_with: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_target: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl PermissionRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// The owner can always read.
    pub fn allows(&self, requester: &str) -> bool {
        if requester == self.owner {
            return true;
        }
        match self.mode {
            PermissionMode::Public => true,
            PermissionMode::Shared => self.shared_with.iter().any(|id| id == requester),
            PermissionMode::Single => self.single_target.as_deref() == Some(requester),
        }
    }
}
