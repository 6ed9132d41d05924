//! Control Room Authentication CLI
//!
//! Operator bootstrap for certificate pinning, service logins and OAuth2.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::error;

use controlroom_auth::{
    Error,
    cli::{CertsCommand, Cli, Command, OauthCommand, TokenCommand},
    config::Config,
    credentials::AuthenticationStatus,
    oauth::ListenerState,
    oidc::FALLBACK_USERNAME,
    service::AuthenticationService,
    setup_tracing,
    trust::CertificateTrustStore,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Certs(cmd) => run_certs(cmd, &config).await,
        command => match AuthenticationService::from_config(config).await {
            Ok(service) => run_service_command(command, &service).await,
            Err(e) => {
                eprintln!("❌ {e}");
                ExitCode::FAILURE
            }
        },
    }
}

/// Certificate commands only need the trust store
async fn run_certs(cmd: CertsCommand, config: &Config) -> ExitCode {
    let store = match CertificateTrustStore::from_config(config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    match cmd {
        CertsCommand::Acquire { url } => {
            let Some(url) = url.or_else(|| store.provider_url().map(str::to_string)) else {
                eprintln!("❌ No URL given and idp.base_url is not configured");
                return ExitCode::FAILURE;
            };
            report_acquisition(&store, store.acquire_certificates(&url).await, &url).await
        }
        CertsCommand::Refresh => {
            let url = store.provider_url().unwrap_or("<unset>").to_string();
            report_acquisition(&store, store.refresh_certificates().await, &url).await
        }
        CertsCommand::List => {
            let entries = store.entries().await;
            if entries.is_empty() {
                println!("No pinned certificates in {}", store.path().display());
                return ExitCode::SUCCESS;
            }
            println!("{} pinned certificate(s) in {}:\n", entries.len(), store.path().display());
            for entry in entries {
                println!("🔒 {}", entry.alias);
                println!("   {}", entry.summary());
                println!("   Acquired: {}", entry.acquired_at.to_rfc3339());
            }
            ExitCode::SUCCESS
        }
    }
}

async fn report_acquisition(store: &CertificateTrustStore, ok: bool, url: &str) -> ExitCode {
    if ok {
        let count = store.entries().await.len();
        println!("✅ Pinned certificates from {url} ({count} in store)");
        ExitCode::SUCCESS
    } else {
        eprintln!(
            "❌ Could not acquire certificates from {url}: {}",
            store.last_connection_error().unwrap_or_default()
        );
        ExitCode::FAILURE
    }
}

async fn run_service_command(command: Command, service: &AuthenticationService) -> ExitCode {
    match command {
        Command::Login { scope, credentials } => {
            let status = service
                .login(&scope, &credentials.username, &credentials.password)
                .await;
            print_status(&scope, status)
        }
        Command::Logout { scope: Some(scope), .. } => {
            if service.logout(&scope).await {
                println!("✅ Logged out of {scope}");
                ExitCode::SUCCESS
            } else {
                eprintln!("❌ Unknown service: {scope}");
                ExitCode::FAILURE
            }
        }
        Command::Logout { scope: None, .. } => {
            service.logout_all().await;
            println!("✅ Logged out of all services");
            ExitCode::SUCCESS
        }
        Command::Status { format } => run_status(service, &format),
        Command::Oauth(cmd) => run_oauth(cmd, service).await,
        Command::Token(TokenCommand::Check) => run_token_check(service).await,
        Command::Certs(cmd) => run_certs(cmd, service.config()).await,
    }
}

fn run_status(service: &AuthenticationService, format: &str) -> ExitCode {
    service.check_stored_bearer();
    let rows = service.overview();

    if format == "json" {
        return match serde_json::to_string_pretty(&rows) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("❌ Failed to serialize to JSON: {e}");
                ExitCode::FAILURE
            }
        };
    }

    if rows.is_empty() {
        println!("No services configured.");
        return ExitCode::SUCCESS;
    }
    for row in rows {
        let user = row.username.as_deref().unwrap_or("-");
        println!("{:<24} {:<16} {user}", row.display_name, row.status.to_string());
    }
    ExitCode::SUCCESS
}

async fn run_oauth(cmd: OauthCommand, service: &AuthenticationService) -> ExitCode {
    let Some(listener) = service.listener() else {
        eprintln!("❌ OAuth2 is not enabled (idp.enabled)");
        return ExitCode::FAILURE;
    };

    match cmd {
        OauthCommand::Login { timeout_secs } => {
            if let Err(e) = service.initialize().await {
                eprintln!("❌ {e}");
                return ExitCode::FAILURE;
            }
            match listener.authorization_url() {
                Ok(url) => println!("Open this URL in a browser to log in:\n\n  {url}\n"),
                Err(e) => {
                    eprintln!("❌ {e}");
                    return ExitCode::FAILURE;
                }
            }

            let login =
                tokio::time::timeout(Duration::from_secs(timeout_secs), service.complete_oauth_login())
                    .await;
            listener.stop().await;

            let Ok(login) = login else {
                eprintln!("❌ Timed out waiting for the browser login");
                return ExitCode::FAILURE;
            };
            if let ListenerState::Failed(reason) = login.outcome {
                eprintln!("❌ Login failed: {reason}");
                return ExitCode::FAILURE;
            }
            println!("✅ Logged in to the identity provider");
            let mut code = ExitCode::SUCCESS;
            for (scope, status) in login.services {
                if !status.is_usable() {
                    code = ExitCode::FAILURE;
                }
                print_status(scope.id(), status);
            }
            code
        }
        OauthCommand::Logout => {
            service.oauth_logout().await;
            println!("✅ Logged out of the identity provider");
            ExitCode::SUCCESS
        }
    }
}

async fn run_token_check(service: &AuthenticationService) -> ExitCode {
    match service.verify_bearer_token().await {
        Ok(Some(claims)) => {
            let expires = chrono::DateTime::from_timestamp(claims.exp, 0)
                .map_or_else(|| claims.exp.to_string(), |t| t.to_rfc3339());
            let username = claims
                .claim("preferred_username")
                .unwrap_or_else(|| FALLBACK_USERNAME.to_string());
            println!("✅ Token valid for {username}");
            println!("   Expires: {expires}");
            ExitCode::SUCCESS
        }
        Ok(None) => {
            println!("No bearer token stored.");
            ExitCode::FAILURE
        }
        Err(e @ Error::TokenValidation(_)) => {
            eprintln!("❌ {e} (stored token cleared)");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

fn print_status(scope: &str, status: AuthenticationStatus) -> ExitCode {
    if status.is_usable() {
        println!("✅ {scope}: {status}");
        ExitCode::SUCCESS
    } else {
        eprintln!("❌ {scope}: {status}");
        ExitCode::FAILURE
    }
}
