//! Login and logout through the registry with a scripted authenticator.

mod common;

use chatfed::auth::{AuthError, Credentials, LoginError, LoginResponse, MfaChallenge, MfaResponse};
use chatfed::client::TransportEvent;
use chatfed::instance_url::normalize;
use chatfed::registry::InstanceState;
use chatfed::storage::StoreError;
use common::*;

const URL: &str = "Chat.Example/";

fn password() -> Credentials {
    Credentials::Password {
        email: "me@chat.example".into(),
        password: "hunter2".into(),
    }
}

#[tokio::test]
async fn success_stores_session_and_opens_connection() {
    let h = harness();
    h.auth.push(Ok(LoginResponse::Success(credentials("fresh"))));

    h.registry.login(URL, password(), "laptop").await.unwrap();

    let stored = h.registry.sessions().get(URL).unwrap();
    assert_eq!(stored.token, "fresh");
    assert!(!stored.valid);
    assert!(h.storage.document("sessions").unwrap().contains("fresh"));

    let info = h.registry.directory().get(URL).unwrap();
    assert_eq!(info.name, "chat.example");
    assert!(!info.builtin);

    let client = h.factory.client(URL).unwrap();
    assert_eq!(client.assigned_token().as_deref(), Some("fresh"));
    assert_eq!(h.registry.state(URL), Some(InstanceState::Connecting));

    let (instance, body) = &h.auth.requests()[0];
    assert_eq!(*instance, normalize(URL));
    assert_eq!(body["email"], "me@chat.example");
    assert_eq!(body["friendly_name"], "laptop");
}

#[tokio::test]
async fn session_becomes_valid_after_handshake() {
    let h = harness();
    h.auth.push(Ok(LoginResponse::Success(credentials("fresh"))));
    h.registry.login(URL, password(), "laptop").await.unwrap();

    h.factory.client(URL).unwrap().emit(TransportEvent::Connected);

    wait_for_state(&h.registry, URL, InstanceState::Connected).await;
    eventually(|| h.registry.sessions().get(URL).is_some_and(|s| s.valid)).await;
}

#[tokio::test]
async fn mfa_challenge_writes_nothing() {
    let h = harness();
    h.auth.push(Ok(LoginResponse::Mfa(MfaChallenge {
        ticket: "T-1".into(),
        allowed_methods: vec!["Totp".into(), "Recovery".into()],
    })));

    let err = h.registry.login(URL, password(), "laptop").await.unwrap_err();

    match &err {
        LoginError::MfaRequired(challenge) => {
            assert_eq!(challenge.ticket, "T-1");
            assert_eq!(challenge.allowed_methods.len(), 2);
        }
        other => panic!("expected MFA challenge, got {other:?}"),
    }
    assert_eq!(err.reason(), "mfa");
    assert!(h.registry.sessions().is_empty());
    assert!(h.registry.directory().get(URL).is_none());
    assert!(h.factory.created().is_empty());
    assert!(h.storage.document("sessions").is_none());
}

#[tokio::test]
async fn mfa_second_step_completes_login() {
    let h = harness();
    h.auth.push(Ok(LoginResponse::Success(credentials("after-mfa"))));

    let creds = Credentials::Mfa {
        mfa_ticket: "T-1".into(),
        mfa_response: MfaResponse::Totp {
            totp_code: "123456".into(),
        },
    };
    h.registry.login(URL, creds, "laptop").await.unwrap();

    let (_, body) = &h.auth.requests()[0];
    assert_eq!(body["mfa_ticket"], "T-1");
    assert_eq!(body["mfa_response"]["totp_code"], "123456");
    assert_eq!(h.registry.sessions().get(URL).unwrap().token, "after-mfa");
}

#[tokio::test]
async fn disabled_account_writes_nothing() {
    let h = harness();
    h.auth.push(Ok(LoginResponse::Disabled {
        user_id: "user-1".into(),
    }));

    let err = h.registry.login(URL, password(), "laptop").await.unwrap_err();

    assert!(matches!(err, LoginError::Disabled));
    assert_eq!(err.reason(), "disabled");
    assert!(h.registry.sessions().is_empty());
    assert!(h.factory.created().is_empty());
}

#[tokio::test]
async fn rejected_credentials_report_failure() {
    let h = harness();
    h.auth.push(Err(AuthError::Rejected {
        status: 401,
        kind: Some("InvalidCredentials".into()),
    }));

    let err = h.registry.login(URL, password(), "laptop").await.unwrap_err();

    assert!(matches!(err, LoginError::Auth(AuthError::Rejected { status: 401, .. })));
    assert_eq!(err.reason(), "failed");
    assert!(h.registry.sessions().is_empty());
}

#[tokio::test]
async fn relogin_replaces_existing_connection() {
    let h = harness();
    h.registry.sessions().set(URL, session("old", true)).unwrap();
    h.registry.open_connection(URL).unwrap();
    let old = h.factory.client(URL).unwrap();

    h.auth.push(Ok(LoginResponse::Success(credentials("new"))));
    h.registry.login(URL, password(), "laptop").await.unwrap();

    assert_eq!(old.disconnect_count(), 1);
    let new = h.factory.client(URL).unwrap();
    assert_eq!(new.assigned_token().as_deref(), Some("new"));
    assert_eq!(h.factory.created().len(), 2);
    assert!(!h.registry.sessions().get(URL).unwrap().valid);
}

#[tokio::test]
async fn login_keeps_existing_directory_name() {
    let h = harness();
    h.registry.directory().add(URL, "Work Chat").unwrap();
    h.auth.push(Ok(LoginResponse::Success(credentials("fresh"))));

    h.registry.login(URL, password(), "laptop").await.unwrap();

    assert_eq!(h.registry.directory().get(URL).unwrap().name, "Work Chat");
}

#[tokio::test]
async fn login_to_builtin_instance_keeps_it_builtin() {
    let h = harness();
    h.auth.push(Ok(LoginResponse::Success(credentials("fresh"))));

    h.registry
        .login("https://stoat.chat/api/", password(), "laptop")
        .await
        .unwrap();

    let info = h.registry.directory().get("stoat.chat/api").unwrap();
    assert!(info.builtin);
    assert_eq!(info.name, "Stoat");
}

#[tokio::test]
async fn unwritable_store_leaves_no_session_or_connection() {
    let (registry, factory, auth) = failing_harness();
    auth.push(Ok(LoginResponse::Success(credentials("fresh"))));

    let err = registry.login(URL, password(), "laptop").await.unwrap_err();

    assert!(matches!(err, LoginError::Store(StoreError::Write { .. })), "{err:?}");
    assert_eq!(err.reason(), "failed");
    assert!(registry.sessions().get(URL).is_none());
    assert!(registry.directory().get(URL).is_none());
    assert!(registry.open_connection(URL).is_none());
    assert!(factory.created().is_empty());
}
