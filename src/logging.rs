//! Process-wide logger set-up.
//!
//! Everything in the crate logs through the `log` facade; binaries call
//! [`init`] once to install `env_logger`. `RUST_LOG` still takes precedence
//! over the configured level.
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use env_logger::{Builder, Env, Target};
use log::{LevelFilter, SetLoggerError, info};
use thiserror::Error;

pub const LOG_FILE_NAME: &str = "main.log";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("unable to open log file {path:?}: {source}")]
    File { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Install(#[from] SetLoggerError),
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LevelFilter,
    /// Append to `<dir>/main.log` instead of writing to stderr.
    pub logs_dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            logs_dir: None,
        }
    }
}

pub fn init(config: &LogConfig) -> Result<(), LoggingError> {
    let mut builder = Builder::from_env(Env::default().default_filter_or(config.level.as_str()));

    let destination = match &config.logs_dir {
        Some(dir) => {
            let (file, path) = open_log_file(dir)?;
            builder.target(Target::Pipe(Box::new(file)));
            path.display().to_string()
        }
        None => "stderr".to_string(),
    };

    builder.try_init()?;
    info!("start logging: {destination}");
    Ok(())
}

/// Create `dir` if needed and open its log file for appending.
pub fn open_log_file(dir: &Path) -> Result<(File, PathBuf), LoggingError> {
    let path = dir.join(LOG_FILE_NAME);
    let file = fs::create_dir_all(dir)
        .and_then(|_| OpenOptions::new().create(true).append(true).open(&path))
        .map_err(|source| LoggingError::File {
            path: path.clone(),
            source,
        })?;
    Ok((file, path))
}
