use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Role attached to an authenticated token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
}

/// Outcome of a successful token check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub tenant: String,
    pub role: Role,
}

/// Identity service capability consumed by the API layer. The core never
/// calls this itself; it is part of the controller's external contract.
#[async_trait]
pub trait Identity: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<AuthContext>;
}

/// Fixed token table, for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct StaticTokenIdentity {
    tokens: HashMap<String, AuthContext>,
}

impl StaticTokenIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: &str, tenant: &str, role: Role) {
        self.tokens.insert(
            token.to_string(),
            AuthContext {
                tenant: tenant.to_string(),
                role,
            },
        );
    }
}

#[async_trait]
impl Identity for StaticTokenIdentity {
    async fn authenticate(&self, token: &str) -> Result<AuthContext> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| CoreError::Ownership("token rejected by identity service".into()))
    }
}
