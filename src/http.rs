//! HTTP client construction

use std::time::Duration;

use crate::trust::TlsContext;
use crate::{Error, Result};

/// Overall request timeout for identity-provider and login calls
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Build an HTTP client that trusts exactly what `tls` trusts.
///
/// `connect_timeout` of `None` leaves the client default in place.
///
/// # Errors
///
/// Returns an error if the client cannot be constructed.
pub fn build_http_client(
    tls: &TlsContext,
    connect_timeout: Option<Duration>,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .use_preconfigured_tls((*tls.client_config()).clone())
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("controlroom-auth/", env!("CARGO_PKG_VERSION")));

    if let Some(timeout) = connect_timeout {
        builder = builder.connect_timeout(timeout);
    }

    builder
        .build()
        .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {e}")))
}
