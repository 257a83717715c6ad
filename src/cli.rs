//! CLI utilities for linewire.
//!
//! The utilities present in this module drive the interactive client.
use std::io::{BufRead, Write};

/// Possible commands from a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Exit command `.exit`
    Exit,
    /// Request body to send as-is
    Send(String),
}

/// Prompt user for a command.
///
/// End of input is treated as `.exit`.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, String>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ").map_err(|e| e.to_string())?;
    writer.flush().map_err(|e| e.to_string())?;

    let read = reader.read_line(&mut s).map_err(|e| e.to_string())?;
    if read == 0 {
        return Ok(Command::Exit);
    }

    match s.trim_end_matches(['\r', '\n']) {
        ".exit" => Ok(Command::Exit),
        "" => Err("empty request".to_string()),
        s if !s.starts_with('.') => Ok(Command::Send(s.to_string())),
        s => Err(format!("unrecognized command '{}'", s)),
    }
}
