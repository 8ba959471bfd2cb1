pub mod capture;
pub mod cli;
pub mod config;
pub mod models;
pub mod server;
pub mod service;
pub mod store;

use cli::Args;
use config::capture::load_capture_config;
use log::info;
use server::Server;
use service::CaptureService;
use std::error::Error;
use std::sync::Arc;
use store::initialize_transcript_store;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("Transcript Store Type: {}", args.store_type);
    info!("Transcript Store URL: {}", args.store_url);
    if args.store_type.eq_ignore_ascii_case("supabase") {
        info!("Transcript Table: {}", args.store_table);
    }
    info!("Capture Config: {}", args.capture_config.as_deref().unwrap_or("(built-in defaults)"));
    info!("Preferred Widget Transport: {}", args.widget_transport);
    info!("Widget Origin: {}", args.widget_origin);
    info!("Announce Lifecycle: {}", args.announce_lifecycle);
    if let Some(http_port) = args.http_port {
        info!("HTTP API Port: {}", http_port);
    }
    info!("-------------------------");

    let capture_config = load_capture_config(args.capture_config.as_deref())?;
    info!("Accepting widget messages from: {}", capture_config.allowed_hosts.join(", "));

    let store = initialize_transcript_store(&args)?;
    let service = Arc::new(CaptureService::from_args(&args, &capture_config, store));

    let addr = args.server_addr.clone();
    info!("Starting server on: {}", addr);
    let server = Server::new(addr, service, args);
    server.run().await?;

    Ok(())
}
