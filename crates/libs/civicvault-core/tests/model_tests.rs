//! Model-layer tests for settings and API keys.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

#[path = "common/mod.rs"]
mod common;

use crate::common::TestContext;
use civicvault_core::Error;
use civicvault_core::model::api_key::ApiKeyBmc;
use civicvault_core::model::setting::SettingBmc;
use civicvault_core::model::user::{UserBmc, UserForCreate};

#[tokio::test]
async fn test_settings_round_trip() {
    let tc = TestContext::new().await.expect("test context");
    let mm = &tc.container.mm;

    // Migrations seeded the schema version.
    let version = SettingBmc::get(&tc.system, mm, "schema_version")
        .await
        .expect("get");
    assert_eq!(version.as_deref(), Some("3"));

    assert!(SettingBmc::get(&tc.system, mm, "missing").await.expect("get").is_none());

    SettingBmc::set(&tc.system, mm, "index.auto", "true").await.expect("set");
    SettingBmc::set(&tc.system, mm, "index.auto", "false").await.expect("overwrite");
    let value = SettingBmc::get(&tc.system, mm, "index.auto").await.expect("get");
    assert_eq!(value.as_deref(), Some("false"));

    let all = SettingBmc::all(&tc.system, mm).await.expect("all");
    assert!(all.iter().any(|(k, _)| k == "schema_version"));
}

#[tokio::test]
async fn test_api_key_resolves_to_principal() {
    let tc = TestContext::new().await.expect("test context");
    let mm = &tc.container.mm;

    let user_id = UserBmc::create(
        &tc.system,
        mm,
        UserForCreate {
            username: "ci-bot".to_string(),
            email: None,
            name: "CI".to_string(),
            role: "clerk".to_string(),
            auth_provider: "password".to_string(),
            password_hash: Some("x".to_string()),
        },
    )
    .await
    .expect("user");

    let key_id = ApiKeyBmc::create(&tc.system, mm, user_id, "hash-of-key", "ci pipeline")
        .await
        .expect("key");

    let principal = ApiKeyBmc::resolve(mm, "hash-of-key").await.expect("resolve");
    assert_eq!(principal.username(), "ci-bot");
    assert_eq!(principal.role(), "clerk");

    let keys = ApiKeyBmc::list_for_user(&tc.system, mm, user_id).await.expect("list");
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].label, "ci pipeline");

    ApiKeyBmc::revoke(&tc.system, mm, key_id).await.expect("revoke");
    let err = ApiKeyBmc::resolve(mm, "hash-of-key").await.unwrap_err();
    assert!(matches!(err, Error::SessionInvalid));
}

#[tokio::test]
async fn test_api_key_unknown_is_uniform() {
    let tc = TestContext::new().await.expect("test context");
    let err = ApiKeyBmc::resolve(&tc.container.mm, "no-such-key").await.unwrap_err();
    assert!(matches!(err, Error::SessionInvalid));
}

#[tokio::test]
async fn test_duplicate_key_hash_conflicts() {
    let tc = TestContext::new().await.expect("test context");
    let mm = &tc.container.mm;

    let user_id = UserBmc::create(
        &tc.system,
        mm,
        UserForCreate {
            username: "key-owner".to_string(),
            email: None,
            name: String::new(),
            role: "clerk".to_string(),
            auth_provider: "password".to_string(),
            password_hash: Some("x".to_string()),
        },
    )
    .await
    .expect("user");

    ApiKeyBmc::create(&tc.system, mm, user_id, "same-hash", "one")
        .await
        .expect("first");
    let err = ApiKeyBmc::create(&tc.system, mm, user_id, "same-hash", "two")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateKey { .. }));
}
