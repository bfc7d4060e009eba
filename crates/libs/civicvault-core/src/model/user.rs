//! Users, sessions, and the external-provider guard.
//!
//! The core never hashes passwords; callers hand it an opaque
//! `password_hash`. What the core does enforce: a user whose
//! `auth_provider` is not `password` has no password and can never have one
//! set through this API, and a role change invalidates the user's sessions.

use crate::Principal;
use crate::error::{Error, Result};
use crate::model::ModelManager;
use crate::store::frontmatter::DATETIME_FORMAT;
use crate::types::UserId;
use crate::utils::validation::{validate_email, validate_username};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Auth provider for users authenticated with a locally stored hash.
pub const PROVIDER_PASSWORD: &str = "password";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: Option<String>,
    pub name: String,
    pub role: String,
    pub auth_provider: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub email_verified: bool,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct UserForCreate {
    pub username: String,
    pub email: Option<String>,
    pub name: String,
    pub role: String,
    pub auth_provider: String,
    pub password_hash: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UserForUpdate {
    pub email: Option<String>,
    pub name: Option<String>,
    pub role: Option<String>,
}

/// Backend Model Controller for user operations.
pub struct UserBmc;

impl UserBmc {
    pub async fn create(_ctx: &Principal, mm: &ModelManager, uc: UserForCreate) -> Result<UserId> {
        validate_username(&uc.username)?;
        if let Some(email) = &uc.email {
            validate_email(email)?;
        }

        // External-provider guard: no password material may be stored for a
        // user the provider owns.
        if uc.auth_provider != PROVIDER_PASSWORD && uc.password_hash.is_some() {
            return Err(Error::ExternalProvider {
                username: uc.username.clone(),
            });
        }

        let db = mm.db();
        let stmt = db
            .prepare(
                r#"
            INSERT INTO users (username, email, name, role, auth_provider, password_hash)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
            )
            .await?;

        let mut rows = match stmt
            .query((
                uc.username.as_str(),
                uc.email.as_deref(),
                uc.name.as_str(),
                uc.role.as_str(),
                uc.auth_provider.as_str(),
                uc.password_hash.as_deref(),
            ))
            .await
        {
            Ok(rows) => rows,
            Err(e) if e.to_string().contains("UNIQUE") => {
                return Err(Error::DuplicateKey {
                    key: format!("username:{}", uc.username),
                });
            }
            Err(e) => return Err(Error::from(e)),
        };

        if let Some(row) = rows.next().await? {
            Ok(UserId::new(row.get(0)?))
        } else {
            Err(Error::InvalidInput("Failed to create user".into()))
        }
    }

    pub async fn get(_ctx: &Principal, mm: &ModelManager, id: UserId) -> Result<User> {
        let db = mm.db();
        let stmt = db
            .prepare(&format!("SELECT {COLUMNS} FROM users WHERE id = ?"))
            .await?;
        let mut rows = stmt.query([id.get()]).await?;

        if let Some(row) = rows.next().await? {
            Self::from_row(row)
        } else {
            Err(Error::UserNotFound(id.to_string()))
        }
    }

    pub async fn get_by_username(
        _ctx: &Principal,
        mm: &ModelManager,
        username: &str,
    ) -> Result<User> {
        let db = mm.db();
        let stmt = db
            .prepare(&format!("SELECT {COLUMNS} FROM users WHERE username = ?"))
            .await?;
        let mut rows = stmt.query([username]).await?;

        if let Some(row) = rows.next().await? {
            Self::from_row(row)
        } else {
            Err(Error::UserNotFound(username.to_string()))
        }
    }

    /// True when the username resolves to a user. Used by record validation
    /// for author fields.
    pub async fn exists(mm: &ModelManager, username: &str) -> Result<bool> {
        let db = mm.db();
        let stmt = db.prepare("SELECT 1 FROM users WHERE username = ?").await?;
        let mut rows = stmt.query([username]).await?;
        Ok(rows.next().await?.is_some())
    }

    pub async fn list_all(_ctx: &Principal, mm: &ModelManager) -> Result<Vec<User>> {
        let db = mm.db();
        let stmt = db
            .prepare(&format!("SELECT {COLUMNS} FROM users ORDER BY username"))
            .await?;
        let mut rows = stmt.query(()).await?;

        let mut users = Vec::new();
        while let Some(row) = rows.next().await? {
            users.push(Self::from_row(row)?);
        }
        Ok(users)
    }

    /// Updates profile fields. A role change invalidates every session the
    /// user holds, so stale permissions cannot outlive the change.
    pub async fn update(
        ctx: &Principal,
        mm: &ModelManager,
        id: UserId,
        uu: UserForUpdate,
    ) -> Result<()> {
        if let Some(email) = &uu.email {
            validate_email(email)?;
        }

        let current = Self::get(ctx, mm, id).await?;
        let db = mm.db();

        let stmt = db
            .prepare("UPDATE users SET email = COALESCE(?, email), name = COALESCE(?, name), role = COALESCE(?, role) WHERE id = ?")
            .await?;
        stmt.execute((
            uu.email.as_deref(),
            uu.name.as_deref(),
            uu.role.as_deref(),
            id.get(),
        ))
        .await?;

        if let Some(new_role) = &uu.role {
            if *new_role != current.role {
                Self::invalidate_sessions(mm, id).await?;
            }
        }
        Ok(())
    }

    pub async fn delete(_ctx: &Principal, mm: &ModelManager, id: UserId) -> Result<()> {
        let db = mm.db();
        let stmt = db.prepare("DELETE FROM users WHERE id = ?").await?;
        let changed = stmt.execute([id.get()]).await?;
        if changed == 0 {
            return Err(Error::UserNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Stores a new password hash for a password-provider user.
    ///
    /// Fails with Authorization before touching the row when the user is
    /// owned by an external provider.
    pub async fn set_password(
        ctx: &Principal,
        mm: &ModelManager,
        username: &str,
        password_hash: &str,
    ) -> Result<()> {
        let user = Self::get_by_username(ctx, mm, username).await?;
        if user.auth_provider != PROVIDER_PASSWORD {
            return Err(Error::ExternalProvider {
                username: username.to_string(),
            });
        }

        let db = mm.db();
        let stmt = db
            .prepare("UPDATE users SET password_hash = ? WHERE id = ?")
            .await?;
        stmt.execute((password_hash, user.id.get())).await?;
        Ok(())
    }

    /// Rotates a password given proof of the current one.
    ///
    /// The same external-provider guard applies; a mismatched current hash
    /// is an Authorization failure, indistinguishable from other denials.
    pub async fn change_password(
        ctx: &Principal,
        mm: &ModelManager,
        username: &str,
        current_hash: &str,
        new_hash: &str,
    ) -> Result<()> {
        let user = Self::get_by_username(ctx, mm, username).await?;
        if user.auth_provider != PROVIDER_PASSWORD {
            return Err(Error::ExternalProvider {
                username: username.to_string(),
            });
        }
        if user.password_hash.as_deref() != Some(current_hash) {
            return Err(Error::Denied {
                reason: "Current password does not match".to_string(),
            });
        }

        let db = mm.db();
        let stmt = db
            .prepare("UPDATE users SET password_hash = ? WHERE id = ?")
            .await?;
        stmt.execute((new_hash, user.id.get())).await?;
        Ok(())
    }

    /// Creates a session token row for a user.
    pub async fn create_session(
        _ctx: &Principal,
        mm: &ModelManager,
        user_id: UserId,
        token: &str,
        expires_at: NaiveDateTime,
    ) -> Result<()> {
        let db = mm.db();
        let stmt = db
            .prepare("INSERT INTO sessions (user_id, token, expires_at) VALUES (?, ?, ?)")
            .await?;
        stmt.execute((
            user_id.get(),
            token,
            expires_at.format(DATETIME_FORMAT).to_string(),
        ))
        .await?;
        Ok(())
    }

    /// Resolves a session token to a [`Principal`]. Expired or unknown
    /// tokens yield the same uniform error.
    pub async fn resolve_token(mm: &ModelManager, token: &str) -> Result<Principal> {
        let db = mm.db();
        let stmt = db
            .prepare(
                r#"
            SELECT u.id, u.username, u.role, s.expires_at
            FROM sessions s JOIN users u ON u.id = s.user_id
            WHERE s.token = ?
            "#,
            )
            .await?;
        let mut rows = stmt.query([token]).await?;

        let Some(row) = rows.next().await? else {
            return Err(Error::SessionInvalid);
        };

        let expires_at_str: String = row.get(3)?;
        let expires_at = NaiveDateTime::parse_from_str(&expires_at_str, DATETIME_FORMAT)
            .map_err(|_| Error::SessionInvalid)?;
        if expires_at < chrono::Utc::now().naive_utc() {
            return Err(Error::SessionInvalid);
        }

        Ok(Principal::new(
            row.get(0)?,
            row.get::<String>(1)?,
            row.get::<String>(2)?,
        ))
    }

    pub async fn invalidate_sessions(mm: &ModelManager, user_id: UserId) -> Result<()> {
        let db = mm.db();
        let stmt = db.prepare("DELETE FROM sessions WHERE user_id = ?").await?;
        stmt.execute([user_id.get()]).await?;
        Ok(())
    }

    fn from_row(row: libsql::Row) -> Result<User> {
        let created_at_str: String = row.get(8)?;
        let created_at = NaiveDateTime::parse_from_str(&created_at_str, DATETIME_FORMAT)
            .unwrap_or_default();

        Ok(User {
            id: UserId::new(row.get(0)?),
            username: row.get(1)?,
            email: row.get::<Option<String>>(2)?,
            name: row.get(3)?,
            role: row.get(4)?,
            auth_provider: row.get(5)?,
            password_hash: row.get::<Option<String>>(6)?,
            email_verified: row.get::<i64>(7)? != 0,
            created_at,
        })
    }
}

const COLUMNS: &str =
    "id, username, email, name, role, auth_provider, password_hash, email_verified, created_at";
