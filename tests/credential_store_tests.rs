//! Credential store persistence and concurrency

use std::sync::Arc;

use controlroom_auth::credentials::{
    AuthMode, AuthenticationScope, BearerToken, Credential, ScopedAuthenticationToken,
    ScopedCredentialStore, StoreEvent,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn scope(id: &str) -> AuthenticationScope {
    AuthenticationScope::new(id, id.to_uppercase())
}

fn store_file(dir: &TempDir) -> std::path::PathBuf {
    dir.path().join("state").join("credentials.json")
}

#[test]
fn test_tokens_survive_reopen() {
    // GIVEN: a store with a scoped token, an auth mode and a bearer token
    let dir = TempDir::new().unwrap();
    let store = ScopedCredentialStore::open(store_file(&dir));
    store
        .set(ScopedAuthenticationToken::new(scope("logbook"), "alice", "pw"))
        .unwrap();
    store.set_auth_mode(&scope("alarms"), AuthMode::OAuth2).unwrap();
    store
        .set_bearer_token(&BearerToken {
            access_token: "access".to_string(),
            id_token: Some("id".to_string()),
        })
        .unwrap();

    // WHEN: the file is opened by a new store
    let reopened = ScopedCredentialStore::open(store_file(&dir));

    // THEN: everything is there, including the display name
    let token = reopened.get(&scope("logbook")).unwrap();
    assert_eq!(token.username.as_deref(), Some("alice"));
    assert_eq!(token.password.as_deref(), Some("pw"));
    assert_eq!(token.scope.display_name(), "LOGBOOK");
    assert_eq!(reopened.auth_mode(&scope("alarms")), Some(AuthMode::OAuth2));
    assert_eq!(
        reopened.credential_for(&scope("alarms")),
        Some(Credential::Bearer("access".to_string()))
    );
    assert_eq!(reopened.bearer_token().unwrap().id_token.as_deref(), Some("id"));
}

#[test]
fn test_set_replaces_previous_token() {
    let dir = TempDir::new().unwrap();
    let store = ScopedCredentialStore::open(store_file(&dir));

    store
        .set(ScopedAuthenticationToken::new(scope("logbook"), "alice", "old"))
        .unwrap();
    store
        .set(ScopedAuthenticationToken::new(scope("logbook"), "bob", "new"))
        .unwrap();

    let tokens = ScopedCredentialStore::open(store_file(&dir)).tokens();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].username.as_deref(), Some("bob"));
    assert_eq!(tokens[0].password.as_deref(), Some("new"));
}

#[test]
fn test_delete_absent_scope_is_ok() {
    let store = ScopedCredentialStore::in_memory();
    let mut events = store.subscribe();

    store.delete(&scope("nothing")).unwrap();

    assert!(events.try_recv().is_err());
}

#[test]
fn test_corrupt_file_starts_empty_and_is_overwritten() {
    let dir = TempDir::new().unwrap();
    let path = store_file(&dir);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "{ not json").unwrap();

    let store = ScopedCredentialStore::open(path.clone());
    assert!(store.tokens().is_empty());
    assert_eq!(store.bearer_token(), None);

    store
        .set(ScopedAuthenticationToken::new(scope("logbook"), "alice", "pw"))
        .unwrap();
    assert_eq!(ScopedCredentialStore::open(path).tokens().len(), 1);
}

#[cfg(unix)]
#[test]
fn test_file_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let store = ScopedCredentialStore::open(store_file(&dir));
    store.set_value("jwt_token", "access").unwrap();

    let mode = std::fs::metadata(store_file(&dir)).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn test_mutations_emit_events() {
    let store = ScopedCredentialStore::in_memory();
    let mut events = store.subscribe();

    store
        .set(ScopedAuthenticationToken::new(scope("logbook"), "alice", "pw"))
        .unwrap();
    store.delete(&scope("logbook")).unwrap();
    store
        .set_bearer_token(&BearerToken {
            access_token: "a".to_string(),
            id_token: None,
        })
        .unwrap();
    store.set_auth_mode(&scope("alarms"), AuthMode::OAuth2).unwrap();
    store.delete_all().unwrap();

    let received: Vec<StoreEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert_eq!(
        received,
        vec![
            StoreEvent::ScopeChanged("logbook".to_string()),
            StoreEvent::ScopeRemoved("logbook".to_string()),
            StoreEvent::BearerChanged,
            StoreEvent::ScopeChanged("alarms".to_string()),
            StoreEvent::Cleared,
        ]
    );
}

#[test]
fn test_concurrent_writers_do_not_lose_updates() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(ScopedCredentialStore::open(store_file(&dir)));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for j in 0..10 {
                    let id = format!("service-{i}-{j}");
                    store
                        .set(ScopedAuthenticationToken::new(scope(&id), "user", "pw"))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.tokens().len(), 80);
    assert_eq!(ScopedCredentialStore::open(store_file(&dir)).tokens().len(), 80);
}

#[test]
fn test_clear_bearer_keeps_scoped_tokens() {
    let store = ScopedCredentialStore::in_memory();
    store
        .set(ScopedAuthenticationToken::new(scope("logbook"), "alice", "pw"))
        .unwrap();
    store
        .set_bearer_token(&BearerToken {
            access_token: "a".to_string(),
            id_token: Some("i".to_string()),
        })
        .unwrap();

    store.clear_bearer_token().unwrap();

    assert_eq!(store.bearer_token(), None);
    assert_eq!(store.get_value("jwt_id_token"), None);
    assert!(store.get(&scope("logbook")).is_some());
}
