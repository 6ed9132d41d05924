//! OAuth2 redirect listener
//!
//! A minimal local HTTP server that receives the authorization code after the
//! operator logs in through the browser. The browser is answered at once; the
//! code is exchanged for tokens in a spawned task whose progress is published
//! on a `watch` channel.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use super::exchange::TokenClient;
use crate::credentials::{BearerToken, ScopedCredentialStore};
use crate::{Error, Result};

/// Body returned to the browser once a code was accepted
pub const SUCCESS_BODY: &str = "Login successful! You can close this window.";

const BUSY_BODY: &str = "A login is already being processed.";

/// Progress of an authorization-code login
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    /// Not bound
    Idle,
    /// Bound and waiting for the browser redirect
    Listening,
    /// A code arrived and is being exchanged
    CodeReceived,
    /// The token endpoint answered with tokens
    TokenExchanged,
    /// Tokens are stored
    Success,
    /// The login failed
    Failed(String),
}

impl ListenerState {
    /// `Success` or `Failed`
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed(_))
    }
}

/// Redirect query parameters
#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// State shared with the callback handler
#[derive(Clone)]
struct HandlerState {
    tokens: Arc<TokenClient>,
    store: Arc<ScopedCredentialStore>,
    progress: Arc<watch::Sender<ListenerState>>,
    exchange: Arc<AsyncMutex<()>>,
}

struct RunningServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Local redirect listener for the authorization-code flow
pub struct OAuth2CallbackListener {
    tokens: Arc<TokenClient>,
    store: Arc<ScopedCredentialStore>,
    progress: Arc<watch::Sender<ListenerState>>,
    running: parking_lot::Mutex<Option<RunningServer>>,
}

impl OAuth2CallbackListener {
    /// Create an idle listener
    #[must_use]
    pub fn new(tokens: Arc<TokenClient>, store: Arc<ScopedCredentialStore>) -> Self {
        let (progress, _) = watch::channel(ListenerState::Idle);
        Self {
            tokens,
            store,
            progress: Arc::new(progress),
            running: parking_lot::Mutex::new(None),
        }
    }

    /// Bind `127.0.0.1:port` and serve `callback_path`.
    ///
    /// Port 0 binds an ephemeral port; see [`Self::local_addr`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if this listener is already bound and
    /// [`Error::Transport`] if the port cannot be bound.
    pub async fn start(&self, port: u16, callback_path: &str) -> Result<SocketAddr> {
        if let Some(addr) = self.active_addr() {
            return Err(Error::AlreadyRunning(addr.to_string()));
        }

        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| Error::Transport(format!("Failed to bind callback listener on port {port}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::Internal(format!("Failed to get callback listener address: {e}")))?;

        let path = if callback_path.starts_with('/') {
            callback_path.to_string()
        } else {
            format!("/{callback_path}")
        };

        let state = HandlerState {
            tokens: Arc::clone(&self.tokens),
            store: Arc::clone(&self.store),
            progress: Arc::clone(&self.progress),
            exchange: Arc::new(AsyncMutex::new(())),
        };
        let app = Router::new()
            .route(&path, get(handle_callback))
            .with_state(state);

        let mut running = self.running.lock();
        if let Some(current) = running.as_ref().filter(|r| !r.task.is_finished()) {
            // Lost a race with a concurrent start; our socket is dropped here
            return Err(Error::AlreadyRunning(current.addr.to_string()));
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                error!(error = %e, "Callback listener failed");
            }
        });

        *running = Some(RunningServer {
            addr,
            shutdown: shutdown_tx,
            task,
        });
        drop(running);

        self.progress.send_replace(ListenerState::Listening);
        info!(addr = %addr, path = %path, "OAuth2 callback listener started");
        Ok(addr)
    }

    /// Stop serving and wait for the server task to finish
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(server) = running {
            let _ = server.shutdown.send(());
            if let Err(e) = server.task.await {
                warn!(error = %e, "Callback listener task ended abnormally");
            }
            info!(addr = %server.addr, "OAuth2 callback listener stopped");
        }
        self.progress.send_replace(ListenerState::Idle);
    }

    /// Bound address while running
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active_addr()
    }

    /// Current progress
    #[must_use]
    pub fn state(&self) -> ListenerState {
        self.progress.borrow().clone()
    }

    /// Observe progress changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ListenerState> {
        self.progress.subscribe()
    }

    /// Wait until the current login reaches `Success` or `Failed`.
    ///
    /// The outcome is consumed: a running listener goes back to `Listening`,
    /// so the next call waits for the next redirect instead of returning the
    /// previous result. Dropping the future does not cancel an exchange in
    /// flight.
    pub async fn wait_for_completion(&self) -> ListenerState {
        let mut rx = self.progress.subscribe();
        let outcome = match rx.wait_for(ListenerState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => return ListenerState::Failed("Callback listener closed".to_string()),
        };

        if self.active_addr().is_some() {
            self.progress.send_if_modified(|state| {
                if *state == outcome {
                    *state = ListenerState::Listening;
                    true
                } else {
                    false
                }
            });
        }
        outcome
    }

    /// Browser URL that starts the login
    pub fn authorization_url(&self) -> Result<Url> {
        self.tokens.authorization_url()
    }

    /// End the provider session and forget the bearer token.
    ///
    /// The provider call is best effort; the stored tokens are cleared
    /// whether or not it succeeds.
    pub async fn logout(&self) -> Result<()> {
        let id_token = self.store.bearer_token().and_then(|t| t.id_token);
        if let Err(e) = self.tokens.end_session(id_token.as_deref()).await {
            warn!(error = %e, "Identity provider logout failed");
        }
        self.store.clear_bearer_token()
    }

    fn active_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .as_ref()
            .filter(|r| !r.task.is_finished())
            .map(|r| r.addr)
    }
}

impl Drop for OAuth2CallbackListener {
    fn drop(&mut self) {
        if let Some(server) = self.running.get_mut().take() {
            let _ = server.shutdown.send(());
        }
    }
}

/// Handle the browser redirect
async fn handle_callback(
    State(state): State<HandlerState>,
    Query(params): Query<CallbackParams>,
) -> impl IntoResponse {
    if let Some(error) = params.error {
        let description = params
            .error_description
            .unwrap_or_else(|| "no description".to_string());
        warn!(error = %error, description = %description, "Identity provider returned an error");
        state
            .progress
            .send_replace(ListenerState::Failed(format!("{error}: {description}")));
        return (
            StatusCode::BAD_REQUEST,
            format!("Login failed: {error} ({description})"),
        );
    }

    let Some(code) = params.code.filter(|c| !c.is_empty()) else {
        warn!("Callback without authorization code");
        state
            .progress
            .send_replace(ListenerState::Failed("Missing authorization code".to_string()));
        return (
            StatusCode::BAD_REQUEST,
            "Login failed: no authorization code received.".to_string(),
        );
    };

    let Ok(guard) = Arc::clone(&state.exchange).try_lock_owned() else {
        debug!("Ignoring authorization code while another exchange is pending");
        return (StatusCode::CONFLICT, BUSY_BODY.to_string());
    };

    state.progress.send_replace(ListenerState::CodeReceived);
    tokio::spawn(async move {
        let outcome = exchange_and_store(&state, &code).await;
        let next = match outcome {
            Ok(()) => ListenerState::Success,
            Err(e) => {
                warn!(error = %e, "OAuth2 login failed");
                ListenerState::Failed(e.to_string())
            }
        };
        state.progress.send_replace(next);
        drop(guard);
    });

    (StatusCode::OK, SUCCESS_BODY.to_string())
}

async fn exchange_and_store(state: &HandlerState, code: &str) -> Result<()> {
    let response = state.tokens.exchange_code(code).await?;
    state.progress.send_replace(ListenerState::TokenExchanged);
    state.store.set_bearer_token(&BearerToken {
        access_token: response.access_token,
        id_token: response.id_token,
    })
}
