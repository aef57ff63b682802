//! authgate - command-line client for the authenticated request gateway.
//!
//! Signs in, keeps the credential in the configured store, and sends
//! authenticated requests that refresh the access token on demand.

use std::io;

use anyhow::{bail, Context, Result};
use authgate_core::{ApiRequest, Gateway, GatewayConfig, SessionState};
use tokio::sync::broadcast::error::TryRecvError;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "\
Usage: authgate <command> [args]

Commands:
  login <username>        Sign in (password is prompted)
  logout                  Sign out and forget stored credentials
  status [--refresh]      Show session state, optionally forcing a refresh
  get <path>              Send an authenticated GET and print the body
  post <path> <json>      Send an authenticated POST with a JSON body
  put <path> <json>       Send an authenticated PUT with a JSON body
  delete <path>           Send an authenticated DELETE

Environment:
  AUTHGATE_BASE_URL, AUTHGATE_TIMEOUT_SECS, AUTHGATE_STORAGE (keyring|file|memory)
  AUTHGATE_LOG_DIR        Also write logs to a daily file in this directory
  RUST_LOG                Log filter (default: warn)";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var("AUTHGATE_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "authgate.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    let config = GatewayConfig::load()?.apply_env()?;
    let storage = config.open_storage()?;
    let gateway = Gateway::new(config, storage).context("Failed to build gateway")?;
    let mut signed_out = gateway.subscribe_signed_out();
    info!(command = %command, base_url = %gateway.config().base_url, "authgate starting");

    let result = match (command.as_str(), &args[1..]) {
        ("login", [username]) => login(&gateway, username).await,
        ("logout", []) => {
            gateway.logout().await?;
            println!("Signed out");
            Ok(())
        }
        ("status", rest) => status(&gateway, rest.iter().any(|a| a == "--refresh")).await,
        ("get", [path]) => send(&gateway, ApiRequest::get(path.as_str())).await,
        ("post", [path, body]) => {
            send(&gateway, ApiRequest::post(path.as_str()).json(&parse_body(body)?)?).await
        }
        ("put", [path, body]) => {
            send(&gateway, ApiRequest::put(path.as_str()).json(&parse_body(body)?)?).await
        }
        ("delete", [path]) => send(&gateway, ApiRequest::delete(path.as_str())).await,
        ("help" | "--help" | "-h", _) => {
            println!("{}", USAGE);
            Ok(())
        }
        _ => bail!("Unrecognized command\n\n{}", USAGE),
    };

    match signed_out.try_recv() {
        Ok(_) | Err(TryRecvError::Lagged(_)) if command != "logout" => {
            eprintln!("Your session has expired. Run `authgate login <username>` to sign in again.");
        }
        _ => {}
    }

    result
}

async fn login(gateway: &Gateway, username: &str) -> Result<()> {
    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;
    let outcome = gateway.login(username, &password).await?;
    println!("Signed in as {}", username);
    if !outcome.profile.is_empty() {
        println!("{}", serde_json::to_string_pretty(&outcome.profile)?);
    }
    Ok(())
}

async fn status(gateway: &Gateway, force_refresh: bool) -> Result<()> {
    if force_refresh {
        gateway.refresh_now().await?;
    }
    let state = gateway.session_state().await;
    let label = match state {
        SessionState::Anonymous => "signed out",
        SessionState::Authenticated => "signed in",
        SessionState::RefreshInProgress => "refreshing",
    };
    println!("Session: {}", label);
    println!("Server:  {}", gateway.config().base_url);
    Ok(())
}

fn parse_body(body: &str) -> Result<serde_json::Value> {
    serde_json::from_str(body).context("Request body is not valid JSON")
}

async fn send(gateway: &Gateway, request: ApiRequest) -> Result<()> {
    let response = gateway.send(request).await?;
    if response.body.is_empty() {
        return Ok(());
    }
    match serde_json::from_str::<serde_json::Value>(&response.body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", response.body),
    }
    Ok(())
}
