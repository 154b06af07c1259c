//! mail-bridge-mcp-rs: multi-account IMAP/SMTP MCP server over stdio
//!
//! Exposes email tools (login, listing, body fetch, send) over the Model
//! Context Protocol. Accounts live in a local JSON store; OAuth tokens are
//! refreshed through an ordered strategy chain before every operation, and
//! message bodies go through a MIME resolution and text-normalization
//! pipeline before they reach the caller.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading, startup token sweep, and stdio serving
//! - [`config`]: Environment-driven settings and the static provider endpoint table
//! - [`errors`]: Error taxonomy with MCP mapping and remediation hints
//! - [`store`]: JSON credential store with atomic writes and default-account selection
//! - [`token`]: OAuth token lifecycle (skew-window refresh, strategy chain, sweep)
//! - [`imap`]: Session lifecycle with timeout-bounded operations and best-effort teardown
//! - [`mime`]: MIME body resolution and attachment enumeration
//! - [`html`]: HTML-to-text conversion and entity decoding
//! - [`text`]: Plain-text normalization pipeline
//! - [`smtp`]: Outbound composition and submission
//! - [`server`]: MCP tool handlers with validation and orchestration
//! - [`models`]: Input/output DTOs and schema-bearing types

mod config;
mod errors;
mod html;
mod imap;
mod mime;
mod models;
mod server;
mod smtp;
mod store;
mod text;
mod token;

use std::sync::Arc;
use std::time::Duration;

use rmcp::ServiceExt;
use rmcp::transport::stdio;
use tracing_subscriber::EnvFilter;

use config::Settings;
use store::AccountStore;
use token::TokenManager;

/// Application entry point
///
/// Initializes tracing from environment, opens the credential store, runs
/// the startup token sweep, and serves the MCP server over stdio. This
/// process expects to be spawned by an MCP client via `stdio` transport.
///
/// # Environment Variables
///
/// See [`Settings::load_from_env`] for full configuration options.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let settings = Arc::new(Settings::load_from_env()?);
    let store = Arc::new(AccountStore::open(&settings.store_path)?);
    let tokens = Arc::new(TokenManager::new(Arc::clone(&settings), Arc::clone(&store))?);

    tokens.sweep().await;
    if settings.sweep_interval_secs > 0 {
        let sweeper = Arc::clone(&tokens);
        let period = Duration::from_secs(settings.sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The startup sweep already covered the first tick.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sweeper.sweep().await;
            }
        });
    }

    let service = server::MailBridgeServer::new(settings, store, tokens)
        .serve(stdio())
        .await?;
    service.waiting().await?;
    Ok(())
}
