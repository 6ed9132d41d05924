//! OAuth2 authorization-code login
//!
//! - [`OAuth2CallbackListener`]: local redirect listener driving the flow
//! - [`TokenClient`]: token exchange and end-session calls

mod callback;
mod exchange;

pub use callback::{ListenerState, OAuth2CallbackListener, SUCCESS_BODY};
pub use exchange::{TokenClient, TokenResponse};
