pub mod agent;
pub mod cli;
pub mod config;
pub mod history;
pub mod llm;
pub mod models;
pub mod rate_limit;
pub mod reconciler;
pub mod server;

use agent::ChatAgent;
use cli::Args;
use log::info;
use server::Server;
use std::error::Error;
use std::sync::Arc;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("HTTP API Port: {}", args.http_port.map_or("disabled".to_string(), |p| p.to_string()));
    info!("Standard Model: {}", args.standard_model);
    info!("Pro Model: {}", args.pro_model);
    info!("Image Model: {}", args.image_model);
    info!("API Key Configured: {}", !args.api_key.is_empty());
    info!("Thinking Mode: {:?}", args.thinking_mode);
    info!("Web Search: {}", args.web_search);
    info!("Save History: {}", args.save_history);
    info!("Store Type: {}", args.store_type);
    info!("Prompts Path: {}", args.prompts_path);
    info!("Pro Quota: {} messages per {} hours", args.pro_message_limit, args.pro_reset_hours);
    info!("TLS Enabled: {}", args.enable_tls);
    info!("-------------------------");

    let agent = Arc::new(ChatAgent::new(&args).await?);
    let addr = args.server_addr.clone();
    info!("Starting server on: {}", addr);
    let server = Server::new(addr, agent, args);
    server.run().await?;

    Ok(())
}
