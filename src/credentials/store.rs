//! Scoped credential store
//!
//! Persists per-service credentials and the process-wide bearer tokens to a
//! single JSON file so logins survive restarts. The file is the only durable
//! record of whether a service is authenticated; if it cannot be read the
//! store starts empty.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::types::{
    AuthMode, AuthenticationScope, BearerToken, Credential, ScopedAuthenticationToken,
};
use crate::{Error, Result};

/// Well-known key of the OAuth2 access token
pub const ACCESS_TOKEN_KEY: &str = "jwt_token";

/// Well-known key of the OAuth2 ID token
pub const ID_TOKEN_KEY: &str = "jwt_id_token";

const AUTH_MODE_PREFIX: &str = "auth_mode:";

/// Change notification emitted after a successful mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A scoped token was written
    ScopeChanged(String),
    /// A scoped token was removed
    ScopeRemoved(String),
    /// The bearer token was written or cleared
    BearerChanged,
    /// All scoped tokens were removed
    Cleared,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredScope {
    display_name: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    scopes: BTreeMap<String, StoredScope>,
    #[serde(default)]
    values: BTreeMap<String, String>,
}

/// Thread-safe credential store
pub struct ScopedCredentialStore {
    path: Option<PathBuf>,
    state: Mutex<StoreFile>,
    events: broadcast::Sender<StoreEvent>,
}

impl ScopedCredentialStore {
    /// Open the store at `path`, starting empty if the file is missing or unreadable
    #[must_use]
    pub fn open(path: PathBuf) -> Self {
        let state = load_file(&path);
        let (events, _) = broadcast::channel(64);
        Self {
            path: Some(path),
            state: Mutex::new(state),
            events,
        }
    }

    /// A store that never touches disk
    #[must_use]
    pub fn in_memory() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            path: None,
            state: Mutex::new(StoreFile::default()),
            events,
        }
    }

    /// Backing file, if any
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Receive change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Token stored for `scope`
    pub fn get(&self, scope: &AuthenticationScope) -> Option<ScopedAuthenticationToken> {
        let state = self.state.lock();
        state.scopes.get(scope.id()).map(|s| ScopedAuthenticationToken {
            scope: AuthenticationScope::new(scope.id(), s.display_name.clone()),
            username: s.username.clone(),
            password: s.password.clone(),
        })
    }

    /// All stored scoped tokens, ordered by scope id
    pub fn tokens(&self) -> Vec<ScopedAuthenticationToken> {
        let state = self.state.lock();
        state
            .scopes
            .iter()
            .map(|(id, s)| ScopedAuthenticationToken {
                scope: AuthenticationScope::new(id.clone(), s.display_name.clone()),
                username: s.username.clone(),
                password: s.password.clone(),
            })
            .collect()
    }

    /// Store `token`, replacing any previous token of the same scope
    pub fn set(&self, token: ScopedAuthenticationToken) -> Result<()> {
        let id = token.scope.id().to_string();
        self.mutate(|state| {
            state.scopes.insert(
                id.clone(),
                StoredScope {
                    display_name: token.scope.display_name().to_string(),
                    username: token.username,
                    password: token.password,
                },
            );
        })?;
        debug!(scope = %id, "Stored scoped credentials");
        self.notify(StoreEvent::ScopeChanged(id));
        Ok(())
    }

    /// Remove the token of `scope`; removing an absent scope is not an error
    pub fn delete(&self, scope: &AuthenticationScope) -> Result<()> {
        let id = scope.id().to_string();
        let mut removed = false;
        self.mutate(|state| {
            removed = state.scopes.remove(&id).is_some();
        })?;
        if removed {
            debug!(scope = %id, "Deleted scoped credentials");
            self.notify(StoreEvent::ScopeRemoved(id));
        }
        Ok(())
    }

    /// Remove every scoped token and auth-mode marker; bearer tokens are kept
    pub fn delete_all(&self) -> Result<()> {
        self.mutate(|state| {
            state.scopes.clear();
            state.values.retain(|k, _| !k.starts_with(AUTH_MODE_PREFIX));
        })?;
        info!("Deleted all scoped credentials");
        self.notify(StoreEvent::Cleared);
        Ok(())
    }

    /// Value stored under a well-known key
    pub fn get_value(&self, key: &str) -> Option<String> {
        self.state.lock().values.get(key).cloned()
    }

    /// Store a value under a well-known key
    pub fn set_value(&self, key: &str, value: &str) -> Result<()> {
        self.mutate(|state| {
            state.values.insert(key.to_string(), value.to_string());
        })?;
        self.notify_value(key);
        Ok(())
    }

    /// Remove a well-known key
    pub fn delete_value(&self, key: &str) -> Result<()> {
        let mut removed = false;
        self.mutate(|state| {
            removed = state.values.remove(key).is_some();
        })?;
        if removed {
            self.notify_value(key);
        }
        Ok(())
    }

    /// How `scope` was last authenticated
    pub fn auth_mode(&self, scope: &AuthenticationScope) -> Option<AuthMode> {
        self.get_value(&auth_mode_key(scope))
            .and_then(|v| AuthMode::parse(&v))
    }

    /// Record how `scope` was authenticated
    pub fn set_auth_mode(&self, scope: &AuthenticationScope, mode: AuthMode) -> Result<()> {
        self.set_value(&auth_mode_key(scope), mode.as_str())
    }

    /// Forget how `scope` was authenticated
    pub fn clear_auth_mode(&self, scope: &AuthenticationScope) -> Result<()> {
        self.delete_value(&auth_mode_key(scope))
    }

    /// The process-wide bearer token, if an access token is stored
    pub fn bearer_token(&self) -> Option<BearerToken> {
        let state = self.state.lock();
        let access_token = state.values.get(ACCESS_TOKEN_KEY)?.clone();
        Some(BearerToken {
            access_token,
            id_token: state.values.get(ID_TOKEN_KEY).cloned(),
        })
    }

    /// Store both bearer tokens in one write
    pub fn set_bearer_token(&self, token: &BearerToken) -> Result<()> {
        self.mutate(|state| {
            state
                .values
                .insert(ACCESS_TOKEN_KEY.to_string(), token.access_token.clone());
            match &token.id_token {
                Some(id) => {
                    state.values.insert(ID_TOKEN_KEY.to_string(), id.clone());
                }
                None => {
                    state.values.remove(ID_TOKEN_KEY);
                }
            }
        })?;
        info!("Stored OAuth2 bearer token");
        self.notify(StoreEvent::BearerChanged);
        Ok(())
    }

    /// Remove both bearer tokens in one write
    pub fn clear_bearer_token(&self) -> Result<()> {
        let mut removed = false;
        self.mutate(|state| {
            removed |= state.values.remove(ACCESS_TOKEN_KEY).is_some();
            removed |= state.values.remove(ID_TOKEN_KEY).is_some();
        })?;
        if removed {
            info!("Cleared OAuth2 bearer token");
            self.notify(StoreEvent::BearerChanged);
        }
        Ok(())
    }

    /// Credential an API client should use for `scope`.
    ///
    /// Scoped username/password wins; otherwise the bearer token is returned
    /// when the scope was last authenticated through OAuth2.
    pub fn credential_for(&self, scope: &AuthenticationScope) -> Option<Credential> {
        if let Some(token) = self.get(scope) {
            if let (Some(username), Some(password)) = (token.username, token.password) {
                return Some(Credential::Basic { username, password });
            }
        }
        if self.auth_mode(scope) == Some(AuthMode::OAuth2) {
            return self
                .bearer_token()
                .map(|b| Credential::Bearer(b.access_token));
        }
        None
    }

    /// Apply `f` to a copy of the state, persist it, then commit.
    ///
    /// The lock is held across the write so file updates are serialized and
    /// memory never diverges from disk.
    fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut StoreFile),
    {
        let mut state = self.state.lock();
        let mut next = state.clone();
        f(&mut next);
        if let Some(path) = &self.path {
            save_file(path, &next)?;
        }
        *state = next;
        Ok(())
    }

    fn notify(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn notify_value(&self, key: &str) {
        if key == ACCESS_TOKEN_KEY || key == ID_TOKEN_KEY {
            self.notify(StoreEvent::BearerChanged);
        } else if let Some(scope) = key.strip_prefix(AUTH_MODE_PREFIX) {
            self.notify(StoreEvent::ScopeChanged(scope.to_string()));
        }
    }
}

fn auth_mode_key(scope: &AuthenticationScope) -> String {
    format!("{AUTH_MODE_PREFIX}{}", scope.id())
}

fn load_file(path: &Path) -> StoreFile {
    if !path.exists() {
        debug!(path = %path.display(), "No credential store yet");
        return StoreFile::default();
    }

    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<StoreFile>(&content) {
            Ok(state) => {
                info!(
                    path = %path.display(),
                    scopes = state.scopes.len(),
                    "Loaded credential store"
                );
                state
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Credential store is corrupt, starting empty");
                StoreFile::default()
            }
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read credential store, starting empty");
            StoreFile::default()
        }
    }
}

fn save_file(path: &Path, state: &StoreFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| {
            Error::Persistence(format!("Failed to create {}: {e}", dir.display()))
        })?;
    }

    let content = serde_json::to_string_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)
        .map_err(|e| Error::Persistence(format!("Failed to write {}: {e}", tmp.display())))?;

    // Owner read/write only
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600));
    }

    fs::rename(&tmp, path)
        .map_err(|e| Error::Persistence(format!("Failed to replace {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logbook() -> AuthenticationScope {
        AuthenticationScope::new("logbook", "Logbook")
    }

    #[test]
    fn auth_mode_is_per_scope() {
        let store = ScopedCredentialStore::in_memory();
        let sar = AuthenticationScope::new("save-and-restore", "Save & Restore");

        store.set_auth_mode(&logbook(), AuthMode::OAuth2).unwrap();
        store.set_auth_mode(&sar, AuthMode::Basic).unwrap();

        assert_eq!(store.auth_mode(&logbook()), Some(AuthMode::OAuth2));
        assert_eq!(store.auth_mode(&sar), Some(AuthMode::Basic));

        store.clear_auth_mode(&logbook()).unwrap();
        assert_eq!(store.auth_mode(&logbook()), None);
    }

    #[test]
    fn bearer_keys_do_not_collide_with_scopes() {
        let store = ScopedCredentialStore::in_memory();
        store
            .set_bearer_token(&BearerToken {
                access_token: "A".to_string(),
                id_token: Some("B".to_string()),
            })
            .unwrap();

        assert!(store.tokens().is_empty());
        assert_eq!(store.get_value(ACCESS_TOKEN_KEY).as_deref(), Some("A"));
        assert_eq!(store.get_value(ID_TOKEN_KEY).as_deref(), Some("B"));
    }

    #[test]
    fn delete_all_keeps_bearer_token() {
        let store = ScopedCredentialStore::in_memory();
        store
            .set(ScopedAuthenticationToken::new(logbook(), "bob", "secret"))
            .unwrap();
        store.set_auth_mode(&logbook(), AuthMode::Basic).unwrap();
        store.set_value(ACCESS_TOKEN_KEY, "A").unwrap();

        store.delete_all().unwrap();

        assert!(store.tokens().is_empty());
        assert_eq!(store.auth_mode(&logbook()), None);
        assert!(store.bearer_token().is_some());
    }

    #[test]
    fn credential_prefers_scoped_basic() {
        let store = ScopedCredentialStore::in_memory();
        store.set_value(ACCESS_TOKEN_KEY, "A").unwrap();
        store.set_auth_mode(&logbook(), AuthMode::OAuth2).unwrap();
        assert_eq!(
            store.credential_for(&logbook()),
            Some(Credential::Bearer("A".to_string()))
        );

        store
            .set(ScopedAuthenticationToken::new(logbook(), "bob", "secret"))
            .unwrap();
        assert_eq!(
            store.credential_for(&logbook()),
            Some(Credential::Basic {
                username: "bob".to_string(),
                password: "secret".to_string(),
            })
        );
    }

    #[test]
    fn bearer_requires_oauth2_mode() {
        let store = ScopedCredentialStore::in_memory();
        store.set_value(ACCESS_TOKEN_KEY, "A").unwrap();
        assert_eq!(store.credential_for(&logbook()), None);
    }

    #[test]
    fn notifies_subscribers() {
        let store = ScopedCredentialStore::in_memory();
        let mut rx = store.subscribe();

        store
            .set(ScopedAuthenticationToken::new(logbook(), "bob", "secret"))
            .unwrap();
        store.delete(&logbook()).unwrap();

        assert_eq!(rx.try_recv().unwrap(), StoreEvent::ScopeChanged("logbook".to_string()));
        assert_eq!(rx.try_recv().unwrap(), StoreEvent::ScopeRemoved("logbook".to_string()));
    }
}
