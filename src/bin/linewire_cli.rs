use std::{
    error::Error,
    io::{self, Write},
    path::PathBuf,
};

use clap::Parser;
use linewire::{
    Command, ConnectionPool,
    logging::{self, LogConfig},
    prompt,
};
use log::LevelFilter;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Port of the service on 127.0.0.1
    port: u16,
    /// Request body; starts an interactive prompt when omitted
    body: Option<String>,
    /// Directory for main.log; logs go to stderr when unset
    #[arg(long)]
    logs_dir: Option<PathBuf>,
    /// Default log level, overridden by RUST_LOG
    #[arg(long, default_value_t = LevelFilter::Warn)]
    log_level: LevelFilter,
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        logs_dir: cli.logs_dir,
    })?;

    let pool = ConnectionPool::new();

    if let Some(body) = cli.body {
        let response = pool.call(cli.port, body.as_bytes())?;
        println!("{}", String::from_utf8_lossy(&response));
        return Ok(());
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        let cmd = match prompt(stdin.lock(), stdout.lock()) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        match cmd {
            Command::Exit => break,
            Command::Send(body) => match pool.call(cli.port, body.as_bytes()) {
                Ok(response) => writeln!(stdout, "{}", String::from_utf8_lossy(&response))?,
                Err(e) => eprintln!("request error: {e}"),
            },
        }
    }

    Ok(())
}
