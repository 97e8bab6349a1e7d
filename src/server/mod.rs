pub mod api;
pub mod websocket;

use crate::agent::ChatAgent;
use crate::cli::Args;
use std::error::Error;
use std::sync::Arc;

pub struct Server {
    addr: String,
    agent: Arc<ChatAgent>,
    args: Args,
}

impl Server {
    pub fn new(addr: String, agent: Arc<ChatAgent>, args: Args) -> Self {
        Self { addr, agent, args }
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(http_port) = self.args.http_port {
            api::start_http_server(http_port, Arc::clone(&self.agent), self.args.clone()).await?;
        }

        websocket::start_ws_server(&self.addr, Arc::clone(&self.agent), self.args.clone()).await
    }
}
