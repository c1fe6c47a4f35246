use clap::Parser;
use pipeline_gateway::app_state::{AppState, ServerConfig};
use pipeline_gateway::pipelines::{DeviceRequest, HubLoader};
use pipeline_gateway::server;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(
        long,
        default_value = "127.0.0.1",
        help = "Host address to bind the server to"
    )]
    host: String,

    #[arg(long, default_value_t = 8000, help = "Port number to listen on")]
    port: u16,

    #[arg(
        long,
        help = "Force pipelines onto the CPU even when an accelerator is available"
    )]
    cpu: bool,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let device = if args.cpu {
        DeviceRequest::Cpu
    } else {
        DeviceRequest::Default
    };
    let app_state = AppState::new(Arc::new(HubLoader::new(device)));
    server::startup(
        ServerConfig {
            host: args.host,
            port: args.port,
        },
        app_state,
    )
    .await?;
    Ok(())
}
