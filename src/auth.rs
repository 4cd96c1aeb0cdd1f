use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::domain::errors::{ApiError, PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Administrator,
    Manager,
    Viewer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Administrator => "Administrator",
            Role::Manager => "Manager",
            Role::Viewer => "Viewer",
        };
        f.write_str(name)
    }
}

/// Pipeline entry points a role may be granted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    ViewReports,
    ViewAlerts,
    Analytics,
    ManageCache,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::ViewReports => "view_reports",
            Operation::ViewAlerts => "view_alerts",
            Operation::Analytics => "analytics",
            Operation::ManageCache => "manage_cache",
        };
        f.write_str(name)
    }
}

pub fn allows(role: Role, operation: Operation) -> bool {
    match role {
        Role::Administrator => true,
        Role::Manager => !matches!(operation, Operation::ManageCache),
        Role::Viewer => matches!(operation, Operation::ViewReports | Operation::ViewAlerts),
    }
}

/// `allows` as a pipeline result
pub fn authorize(role: Role, operation: Operation) -> PipelineResult<()> {
    if allows(role, operation) {
        Ok(())
    } else {
        tracing::warn!(role = %role, operation = %operation, "Operation denied");
        Err(PipelineError::Forbidden {
            role: role.to_string(),
            operation: operation.to_string(),
        })
    }
}

/// SHA-256 hex digest of a password
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub username: String,
    pub password_hash: String,
    pub role: Role,
}

/// Source of dashboard users. Injected into the HTTP layer; the pipeline
/// only ever sees the resulting `Role`.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn lookup(&self, username: &str) -> Option<User>;

    /// The user, if `password` matches their stored hash
    async fn verify(&self, username: &str, password: &str) -> Option<User> {
        if username.is_empty() || password.is_empty() {
            return None;
        }
        let user = self.lookup(username).await?;
        (user.password_hash == hash_password(password)).then_some(user)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryUserStore {
    users: HashMap<String, User>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// admin / manager / viewer with their stock passwords
    pub fn with_default_users() -> Self {
        let mut store = Self::new();
        store.add_user("admin", "admin123", Role::Administrator);
        store.add_user("manager", "manager123", Role::Manager);
        store.add_user("viewer", "viewer123", Role::Viewer);
        store
    }

    pub fn add_user(&mut self, username: &str, password: &str, role: Role) {
        self.users.insert(
            username.to_string(),
            User {
                username: username.to_string(),
                password_hash: hash_password(password),
                role,
            },
        );
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn lookup(&self, username: &str) -> Option<User> {
        self.users.get(username).cloned()
    }
}

/// Identity attached to an authenticated request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    pub username: String,
    pub role: Role,
}

/// Split an `Authorization: Basic ...` header into username and password
pub fn parse_basic_auth(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?.trim();
    let decoded = general_purpose::STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Middleware to require HTTP Basic credentials on protected endpoints
pub async fn require_auth(
    State(store): State<Arc<dyn UserStore>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let Some(header) = header else {
        tracing::warn!("Missing Authorization header");
        return Err(ApiError::Unauthorized("missing credentials".to_string()));
    };
    let Some((username, password)) = parse_basic_auth(header) else {
        tracing::warn!("Invalid Authorization header format (expected Basic credentials)");
        return Err(ApiError::Unauthorized("malformed credentials".to_string()));
    };

    match store.verify(&username, &password).await {
        Some(user) => {
            tracing::debug!(user = %user.username, role = %user.role, "Request authenticated");
            request.extensions_mut().insert(Authenticated {
                username: user.username,
                role: user.role,
            });
            Ok(next.run(request).await)
        }
        None => {
            tracing::warn!(user = %username, "Invalid credentials attempted");
            Err(ApiError::Unauthorized("invalid credentials".to_string()))
        }
    }
}
