//! User model tests: validation, the external-provider guard, sessions.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

#[path = "common/mod.rs"]
mod common;

use crate::common::TestContext;
use civicvault_core::Error;
use civicvault_core::model::user::{UserBmc, UserForCreate, UserForUpdate};
use civicvault_core::utils::validation::ValidationError;

fn user(username: &str, role: &str, provider: &str) -> UserForCreate {
    UserForCreate {
        username: username.to_string(),
        email: None,
        name: String::new(),
        role: role.to_string(),
        auth_provider: provider.to_string(),
        password_hash: if provider == "password" {
            Some("hash".to_string())
        } else {
            None
        },
    }
}

#[tokio::test]
async fn test_reserved_and_malformed_usernames_rejected() {
    let tc = TestContext::new().await.expect("test context");
    let mm = &tc.container.mm;

    let err = UserBmc::create(&tc.system, mm, user("admin", "clerk", "password"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::ReservedUsername { .. })
    ));

    let err = UserBmc::create(&tc.system, mm, user("Ada Lovelace", "clerk", "password"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = UserBmc::create(
        &tc.system,
        mm,
        UserForCreate {
            email: Some("not-an-email".to_string()),
            ..user("valid-name", "clerk", "password")
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_duplicate_username_conflicts() {
    let tc = TestContext::new().await.expect("test context");
    let mm = &tc.container.mm;

    UserBmc::create(&tc.system, mm, user("grace", "clerk", "password"))
        .await
        .expect("first");
    let err = UserBmc::create(&tc.system, mm, user("grace", "council", "password"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateKey { .. }));
}

/// A user owned by an external provider can never hold password material.
#[tokio::test]
async fn test_external_provider_guard() {
    let tc = TestContext::new().await.expect("test context");
    let mm = &tc.container.mm;

    // Creating with a hash under an external provider is refused outright.
    let err = UserBmc::create(
        &tc.system,
        mm,
        UserForCreate {
            password_hash: Some("hash".to_string()),
            ..user("oauth-user", "clerk", "oauth-github")
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::ExternalProvider { .. }));

    // And set_password fails with Authorization before touching the row.
    UserBmc::create(&tc.system, mm, user("oauth-user", "clerk", "oauth-github"))
        .await
        .expect("create");
    let err = UserBmc::set_password(&tc.system, mm, "oauth-user", "new-hash")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ExternalProvider { .. }));
    assert_eq!(err.kind(), civicvault_core::ErrorKind::Authorization);

    let stored = UserBmc::get_by_username(&tc.system, mm, "oauth-user")
        .await
        .expect("get");
    assert!(stored.password_hash.is_none());
}

#[tokio::test]
async fn test_set_password_for_password_provider() {
    let tc = TestContext::new().await.expect("test context");
    let mm = &tc.container.mm;

    UserBmc::create(&tc.system, mm, user("local-user", "clerk", "password"))
        .await
        .expect("create");
    UserBmc::set_password(&tc.system, mm, "local-user", "rotated-hash")
        .await
        .expect("set");

    let stored = UserBmc::get_by_username(&tc.system, mm, "local-user")
        .await
        .expect("get");
    assert_eq!(stored.password_hash.as_deref(), Some("rotated-hash"));
}

/// change_password requires proof of the current hash and honors the
/// provider guard.
#[tokio::test]
async fn test_change_password() {
    let tc = TestContext::new().await.expect("test context");
    let mm = &tc.container.mm;

    UserBmc::create(&tc.system, mm, user("rotating", "clerk", "password"))
        .await
        .expect("create");

    // Wrong current hash: denied, nothing stored.
    let err = UserBmc::change_password(&tc.system, mm, "rotating", "wrong", "next")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), civicvault_core::ErrorKind::Authorization);

    UserBmc::change_password(&tc.system, mm, "rotating", "hash", "next")
        .await
        .expect("rotate");
    let stored = UserBmc::get_by_username(&tc.system, mm, "rotating")
        .await
        .expect("get");
    assert_eq!(stored.password_hash.as_deref(), Some("next"));

    // External provider: refused before any comparison.
    UserBmc::create(&tc.system, mm, user("ext-user", "clerk", "oauth-github"))
        .await
        .expect("create");
    let err = UserBmc::change_password(&tc.system, mm, "ext-user", "x", "y")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ExternalProvider { .. }));
}

/// Changing a user's role invalidates their sessions.
#[tokio::test]
async fn test_role_change_invalidates_sessions() {
    let tc = TestContext::new().await.expect("test context");
    let mm = &tc.container.mm;

    let id = UserBmc::create(&tc.system, mm, user("temp-clerk", "clerk", "password"))
        .await
        .expect("create");
    let expires = chrono::Utc::now().naive_utc() + chrono::Duration::hours(1);
    UserBmc::create_session(&tc.system, mm, id, "session-token-1", expires)
        .await
        .expect("session");

    let principal = UserBmc::resolve_token(mm, "session-token-1")
        .await
        .expect("resolve");
    assert_eq!(principal.username(), "temp-clerk");
    assert_eq!(principal.role(), "clerk");

    UserBmc::update(
        &tc.system,
        mm,
        id,
        UserForUpdate {
            role: Some("council".to_string()),
            ..Default::default()
        },
    )
    .await
    .expect("role change");

    let err = UserBmc::resolve_token(mm, "session-token-1").await.unwrap_err();
    assert!(matches!(err, Error::SessionInvalid));
}

/// Expired and unknown tokens fail uniformly.
#[tokio::test]
async fn test_session_expiry_uniform() {
    let tc = TestContext::new().await.expect("test context");
    let mm = &tc.container.mm;

    let id = UserBmc::create(&tc.system, mm, user("short-lived", "clerk", "password"))
        .await
        .expect("create");
    let expired = chrono::Utc::now().naive_utc() - chrono::Duration::hours(1);
    UserBmc::create_session(&tc.system, mm, id, "stale-token", expired)
        .await
        .expect("session");

    let err_expired = UserBmc::resolve_token(mm, "stale-token").await.unwrap_err();
    let err_unknown = UserBmc::resolve_token(mm, "no-such-token").await.unwrap_err();
    assert_eq!(err_expired.to_string(), err_unknown.to_string());
}

/// Profile updates keep unrelated fields (COALESCE semantics).
#[tokio::test]
async fn test_partial_update() {
    let tc = TestContext::new().await.expect("test context");
    let mm = &tc.container.mm;

    let id = UserBmc::create(
        &tc.system,
        mm,
        UserForCreate {
            email: Some("old@town.gov".to_string()),
            name: "Old Name".to_string(),
            ..user("updatable", "clerk", "password")
        },
    )
    .await
    .expect("create");

    UserBmc::update(
        &tc.system,
        mm,
        id,
        UserForUpdate {
            name: Some("New Name".to_string()),
            ..Default::default()
        },
    )
    .await
    .expect("update");

    let stored = UserBmc::get(&tc.system, mm, id).await.expect("get");
    assert_eq!(stored.name, "New Name");
    assert_eq!(stored.email.as_deref(), Some("old@town.gov"));
    assert_eq!(stored.role, "clerk");
}
