use rocket::http::Status;
use serde::{Deserialize, Serialize};

use super::{Permission, Role};
use crate::error::AppError;

#[derive(Debug, Serialize, Clone)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub role: Role,
    pub created_at: Option<String>,
}

/// A `users` row as the storage layer returns it.
#[derive(Deserialize, Clone)]
pub struct DbUser {
    pub id: i64,
    pub email: String,
    #[serde(default)]
    pub hashed_password: Option<String>,
    pub role: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl TryFrom<DbUser> for User {
    type Error = AppError;

    fn try_from(user: DbUser) -> Result<Self, Self::Error> {
        let role = user
            .role
            .parse()
            .map_err(|e: anyhow::Error| AppError::Internal(e.to_string()))?;

        Ok(Self {
            id: user.id,
            email: user.email,
            role,
            created_at: user.created_at,
        })
    }
}

impl User {
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.role.has_permission(permission)
    }

    pub fn require_permission(&self, permission: Permission) -> Result<(), Status> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            tracing::warn!(
                email = %self.email,
                role = %self.role.as_str(),
                permission = ?permission,
                "Permission denied"
            );
            Err(Status::Forbidden)
        }
    }
}
