//! Request principal for authorization and audit attribution.
//!
//! Every engine operation takes a [`Principal`]: the already-resolved caller
//! identity. Authentication itself (OAuth exchange, password verification)
//! happens outside the core; by the time a call reaches the engine, the
//! principal's role is settled and the workflow engine only has to evaluate
//! it against configuration.

use serde::{Deserialize, Serialize};

/// The authenticated caller identity consumed by the core.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Principal {
    user_id: i64,
    username: String,
    role: String,
}

impl Principal {
    /// System principal for background tasks, migrations, and recovery.
    /// Carries the `admin` role, which the workflow engine treats as a
    /// bypass.
    pub fn system() -> Self {
        Principal {
            user_id: 0,
            username: "system".to_string(),
            role: "admin".to_string(),
        }
    }

    /// Anonymous principal. The `public` role can only view records in
    /// published statuses.
    pub fn public() -> Self {
        Principal {
            user_id: 0,
            username: "public".to_string(),
            role: "public".to_string(),
        }
    }

    pub fn new(user_id: i64, username: impl Into<String>, role: impl Into<String>) -> Self {
        Principal {
            user_id,
            username: username.into(),
            role: role.into(),
        }
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    /// Git author identity for commits made on behalf of this principal.
    pub fn git_identity(&self) -> (String, String) {
        (
            self.username.clone(),
            format!("{}@civicvault.local", self.username),
        )
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_system_is_admin() {
        let p = Principal::system();
        assert_eq!(p.role(), "admin");
        assert_eq!(p.user_id(), 0);
    }

    #[test]
    fn test_git_identity() {
        let p = Principal::new(3, "clerk-ada", "clerk");
        let (name, email) = p.git_identity();
        assert_eq!(name, "clerk-ada");
        assert_eq!(email, "clerk-ada@civicvault.local");
    }
}
