//! Command-line interface

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Control-room authentication: certificate pinning, service logins and OAuth2
#[derive(Parser, Debug)]
#[command(name = "controlroom-auth")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "CONTROLROOM_AUTH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "warn",
        env = "CONTROLROOM_AUTH_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "CONTROLROOM_AUTH_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Identity provider certificate pinning
    #[command(subcommand)]
    Certs(CertsCommand),

    /// Log in to a service with username and password
    Login {
        /// Service scope id (e.g. logbook)
        scope: String,

        #[command(flatten)]
        credentials: CredentialArgs,
    },

    /// Log out of one service, or all of them
    Logout {
        /// Service scope id
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        scope: Option<String>,

        /// Log out of every configured service
        #[arg(long)]
        all: bool,
    },

    /// Show the cached login status of every service
    Status {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// OAuth2 browser login
    #[command(subcommand)]
    Oauth(OauthCommand),

    /// Stored bearer token checks
    #[command(subcommand)]
    Token(TokenCommand),
}

/// Username/password arguments
#[derive(Args, Debug)]
pub struct CredentialArgs {
    /// Username
    #[arg(short, long, env = "CONTROLROOM_AUTH_USERNAME")]
    pub username: String,

    /// Password
    #[arg(short, long, env = "CONTROLROOM_AUTH_PASSWORD", hide_env_values = true)]
    pub password: String,
}

/// Certificate subcommands
#[derive(Subcommand, Debug)]
pub enum CertsCommand {
    /// Capture and pin the certificate chain served at a URL
    Acquire {
        /// HTTPS URL; defaults to the configured identity provider
        url: Option<String>,
    },

    /// Re-acquire the configured identity provider's chain
    Refresh,

    /// List pinned certificates
    List,
}

/// OAuth2 subcommands
#[derive(Subcommand, Debug)]
pub enum OauthCommand {
    /// Print the login URL and wait for the browser redirect
    Login {
        /// Give up after this many seconds
        #[arg(long, default_value = "300")]
        timeout_secs: u64,
    },

    /// End the identity provider session and clear the bearer token
    Logout,
}

/// Token subcommands
#[derive(Subcommand, Debug)]
pub enum TokenCommand {
    /// Verify the stored bearer token against the provider's JWKS
    Check,
}
