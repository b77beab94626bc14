//! marketlink - session and realtime client for the offers market backend
//!
//! Keeps one authenticated session alive (proactive renewal, retry after
//! renewal, forced logout) and one realtime event channel connected.

mod api;
mod auth;
mod config;
mod realtime;
mod session;

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::RequestOptions;
use crate::auth::login::{self, Platform};
use crate::auth::MemoryStore;
use crate::config::Config;
use crate::realtime::registry::{Handler, WILDCARD};
use crate::session::Session;

#[derive(Parser)]
#[command(name = "marketlink")]
#[command(about = "Session and realtime client for the offers market backend", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this access token for one command instead of the stored session
    #[arg(long, global = true)]
    token: Option<String>,

    /// Refresh token to pair with --token
    #[arg(long, global = true, requires = "token")]
    refresh_token: Option<String>,

    /// Extra request header, "Name: value" (repeatable)
    #[arg(short = 'H', long = "header", global = true)]
    headers: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in with a one-time code sent to your Telegram account
    Login {
        /// Mobile number registered with the market
        #[arg(short, long)]
        mobile: String,

        /// Login code (prompted for when omitted)
        #[arg(long)]
        otp: Option<String>,
    },

    /// Log out and clear stored credentials
    Logout,

    /// Show current authentication status
    Status,

    /// Renew the access token now
    Renew,

    /// Authenticated GET against the API
    Get {
        /// Path under /api (e.g. /offers)
        path: String,
    },

    /// Authenticated POST against the API
    Post {
        /// Path under /api
        path: String,

        /// JSON request body
        json: String,
    },

    /// Authenticated PUT against the API
    Put {
        /// Path under /api
        path: String,

        /// JSON request body
        json: String,
    },

    /// Authenticated DELETE against the API
    Delete {
        /// Path under /api
        path: String,
    },

    /// Show the number of unread notifications
    Unread,

    /// Connect to the realtime channel and print events
    Watch {
        /// Event type to subscribe to (repeatable; all events when omitted)
        #[arg(short = 't', long = "type")]
        types: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::load()?;
    let session = match &cli.token {
        Some(token) => {
            let refresh = cli.refresh_token.as_deref();
            let store = MemoryStore::with_tokens(Some(token.as_str()), refresh);
            Session::with_store(&config, Arc::new(store))?
        }
        None => Session::from_config(&config)?,
    };
    let headers = cli.headers;

    match cli.command {
        Commands::Login { mobile, otp } => {
            tracing::info!("Starting login flow...");
            login_flow(&session, &mobile, otp).await?;
        }
        Commands::Logout => {
            session.logout();
            println!("Logged out.");
        }
        Commands::Status => {
            status(&config, &session);
        }
        Commands::Renew => {
            if session.renew_or_logout().await {
                println!("Access token renewed.");
                print_expiry(&session);
            } else {
                anyhow::bail!("Renewal failed; stored credentials were cleared");
            }
        }
        Commands::Get { path } => {
            send(&session, &path, RequestOptions::get(), &headers).await?;
        }
        Commands::Post { path, json } => {
            let options = RequestOptions::post(parse_body(&json)?);
            send(&session, &path, options, &headers).await?;
        }
        Commands::Put { path, json } => {
            let options = RequestOptions::put(parse_body(&json)?);
            send(&session, &path, options, &headers).await?;
        }
        Commands::Delete { path } => {
            send(&session, &path, RequestOptions::delete(), &headers).await?;
        }
        Commands::Unread => {
            let options = with_headers(RequestOptions::get(), &headers)?;
            match session
                .fetch_json::<u64>("/notifications/unread-count", options)
                .await
            {
                Ok(count) => println!("{} unread notification(s)", count),
                Err(e) if e.is_unauthorized() => {
                    anyhow::bail!("Session expired. Run 'marketlink login' to sign in again.")
                }
                Err(e) => return Err(e).context("Failed to fetch unread count"),
            }
        }
        Commands::Watch { types } => {
            watch(&session, types).await?;
        }
    }

    Ok(())
}

async fn login_flow(session: &Session, mobile: &str, otp: Option<String>) -> Result<()> {
    let otp = match otp {
        Some(otp) => otp,
        None => {
            let message = login::request_otp(session.api(), mobile).await?;
            println!("{}", message);
            prompt("Login code: ")?
        }
    };

    let fingerprint = uuid::Uuid::new_v4().to_string();
    let pair = login::verify_otp(session.api(), mobile, &otp, Platform::Web, &fingerprint).await?;
    session.establish(pair);

    println!("Logged in.");
    print_expiry(session);
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read login code")?;
    let line = line.trim().to_string();
    if line.is_empty() {
        anyhow::bail!("No login code entered");
    }
    Ok(line)
}

fn status(config: &Config, session: &Session) {
    println!("Backend:     {}", config.base_url);
    println!("Realtime:    {}", session.channel().endpoint());

    match session.store().access_token() {
        Some(token) if !session.lifecycle().is_expired(&token) => {
            println!("Access tok:  valid");
            if let Some(exp) = auth::token::expires_at(&token) {
                println!("  expires_at: {}", exp.to_rfc3339());
            }
        }
        Some(_) => println!("Access tok:  expired"),
        None => println!("Access tok:  none"),
    }

    match session.store().refresh_token() {
        Some(_) => println!("Refresh tok: present"),
        None => println!("Refresh tok: none"),
    }
}

fn print_expiry(session: &Session) {
    let expiry = session
        .store()
        .access_token()
        .and_then(|token| auth::token::expires_at(&token));
    if let Some(exp) = expiry {
        println!("Token expires at {}", exp.to_rfc3339());
    }
}

fn parse_body(json: &str) -> Result<Value> {
    serde_json::from_str(json).context("Request body is not valid JSON")
}

/// Apply `Name: value` header arguments.
fn with_headers(mut options: RequestOptions, headers: &[String]) -> Result<RequestOptions> {
    for raw in headers {
        let (name, value) = raw
            .split_once(':')
            .with_context(|| format!("Header '{}' is not in 'Name: value' form", raw))?;
        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("Header '{}' has an empty name", raw);
        }
        options = options.header(name, value.trim());
    }
    Ok(options)
}

async fn send(
    session: &Session,
    path: &str,
    options: RequestOptions,
    headers: &[String],
) -> Result<()> {
    let options = with_headers(options, headers)?;
    let resp = session.fetch(path, options).await?;
    print_response(&resp);
    Ok(())
}

fn print_response(resp: &api::ApiResponse) {
    println!("HTTP {}", resp.status);
    match serde_json::from_slice::<Value>(&resp.body) {
        Ok(json) => match serde_json::to_string_pretty(&json) {
            Ok(pretty) => println!("{}", pretty),
            Err(_) => println!("{}", resp.text()),
        },
        Err(_) => println!("{}", resp.text()),
    }
}

async fn watch(session: &Session, types: Vec<String>) -> Result<()> {
    if !session.is_authenticated() {
        anyhow::bail!("Not logged in. Run 'marketlink login' first.");
    }
    if session.resume().is_none() {
        tracing::warn!("Stored access token has no readable expiry; proactive renewal is off");
    }

    let mut subscriptions = Vec::new();
    let printer: Handler = Arc::new(|envelope: &Value| {
        let kind = envelope["type"].as_str().unwrap_or("?");
        println!("[{}] {}", kind, envelope["data"]);
    });
    if types.is_empty() {
        subscriptions.push(session.subscribe(WILDCARD, printer.clone()));
    } else {
        for kind in types {
            let label = kind.clone();
            subscriptions.push(session.subscribe(
                &kind,
                Arc::new(move |data: &Value| println!("[{}] {}", label, data)),
            ));
        }
    }
    for sub in &subscriptions {
        tracing::debug!("Subscribed to '{}'", sub.event());
    }

    let mut state = session.channel().watch_state();
    session.connect();
    println!("Watching realtime events (Ctrl-C to stop)...");

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                tracing::info!("Realtime channel: {:?}", current);
                if session.channel().is_connected() {
                    println!("Connected to {}", session.channel().endpoint());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, closing channel");
                break;
            }
        }
    }

    session.off(WILDCARD, &printer);
    for sub in &subscriptions {
        session.unsubscribe(sub);
    }
    session.disconnect();
    Ok(())
}
