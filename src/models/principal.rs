use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Coach,
    Admin,
}

impl Role {
    pub fn from_string(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Some(Role::User),
            "coach" => Some(Role::Coach),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Identity and authorization attributes resolved for an authenticated request.
///
/// Inserted into the request extensions once by the auth stage and only read
/// afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub roles: Vec<Role>,
    pub premium: bool,
    pub premium_expires_at: Option<DateTime<Utc>>,
}

impl Principal {
    pub fn new(id: impl Into<String>, roles: Vec<Role>) -> Self {
        Self {
            id: id.into(),
            roles,
            premium: false,
            premium_expires_at: None,
        }
    }

    pub fn with_premium(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.premium = true;
        self.premium_expires_at = expires_at;
        self
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// A premium flag without an expiry never lapses.
    pub fn has_active_premium(&self, now: DateTime<Utc>) -> bool {
        self.premium && self.premium_expires_at.is_none_or(|expires_at| expires_at > now)
    }
}
