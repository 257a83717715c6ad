use std::{error::Error, path::PathBuf};

use clap::Parser;
use linewire::{
    Server, ServerConfig,
    logging::{self, LogConfig},
    protocol::DEFAULT_MAX_HANDLERS,
};
use log::{LevelFilter, info};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Host to bind to
    host: String,
    /// Port to listen on
    port: u16,
    /// Connections allowed to run their handler at once
    #[arg(long, default_value_t = DEFAULT_MAX_HANDLERS)]
    max_handlers: usize,
    /// Fixed reply for every request; requests are echoed back when unset
    #[arg(long)]
    reply: Option<String>,
    /// Directory for main.log; logs go to stderr when unset
    #[arg(long)]
    logs_dir: Option<PathBuf>,
    /// Default log level, overridden by RUST_LOG
    #[arg(long, default_value_t = LevelFilter::Info)]
    log_level: LevelFilter,
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        logs_dir: cli.logs_dir,
    })?;

    let config = ServerConfig {
        max_handlers: cli.max_handlers,
        ..ServerConfig::new(cli.host, cli.port)
    };
    let reply = cli.reply.map(String::into_bytes);
    let server = Server::bind(config, move |request: &[u8]| match &reply {
        Some(reply) => reply.clone(),
        None => request.to_vec(),
    })?;

    info!(
        "admitting up to {} concurrent handlers",
        server.gate().capacity()
    );

    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("interrupt received");
        shutdown.shutdown();
    })?;

    server.serve()?;
    Ok(())
}
