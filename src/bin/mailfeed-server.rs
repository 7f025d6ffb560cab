#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! HTTP server exposing the unread-mail fetch pipeline

use clap::Parser;
use mailfeed::{EmailService, MailConfig, router};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mailfeed-server")]
#[command(about = "Serve unread mailbox contents over HTTP")]
struct Args {
    /// Address to bind the HTTP listener to
    #[arg(long, default_value = "127.0.0.1:3001")]
    bind: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = MailConfig::from_env()?;
    let service = Arc::new(EmailService::new(config));

    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, router(service)).await?;

    Ok(())
}
