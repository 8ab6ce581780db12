//! Logging for the rig executables
//!
//! Records go to the terminal with coloured level tags and to the session log file with plain
//! ones. Both carry the session elapsed time and the name of the thread which logged them, since
//! the gimbal and tracker tasks interleave their output.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External imports
use colored::Colorize;
use log::{self, info, Level};
use std::fmt;
use thiserror::Error;

// Internal imports
use crate::session;

// Re-exports
pub use log::LevelFilter;

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Errors associated with initialising the logger.
#[derive(Debug, Error)]
pub enum LoggerInitError {
    #[error("Expected a log level of `INFO` or more verbose, found `{0}`")]
    InvalidMinLogLevel(log::LevelFilter),

    #[error("Error initialising the log file: {0}")]
    LogFileInitError(std::io::Error),

    #[error("An error occured while setting up the logger: {0}")]
    FernInitError(log::SetLoggerError),
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Initialise the logger for this execution.
///
/// # Notes
///
/// - `min_level` must be `Info`, `Debug` or `Trace`, warnings about the equipment must never be
///   filtered out.
///
/// # Safety
///
/// - This function must only be called once to prevent corrupting logs.
pub fn logger_init(
    min_level: LevelFilter,
    session: &session::Session,
) -> Result<(), LoggerInitError> {
    if min_level < Level::Info {
        return Err(LoggerInitError::InvalidMinLogLevel(min_level));
    }

    let log_file =
        fern::log_file(session.log_file_path.clone()).map_err(LoggerInitError::LogFileInitError)?;

    let terminal = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}",
                Line::new(record, message, Tag::Coloured)
            ))
        })
        .chain(std::io::stdout());

    let file = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!("{}", Line::new(record, message, Tag::Plain)))
        })
        .chain(log_file);

    fern::Dispatch::new()
        .level(min_level)
        .chain(terminal)
        .chain(file)
        .apply()
        .map_err(LoggerInitError::FernInitError)?;

    info!("Logging initialised");
    info!("    Session epoch: {}", session.epoch);
    info!("    Log level: {:?}", min_level);
    info!("    Log file path: {:?}", session.log_file_path);

    Ok(())
}

// ---------------------------------------------------------------------------
// PRIVATE ITEMS
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Tag {
    Coloured,
    Plain,
}

/// One formatted log line.
struct Line<'a> {
    elapsed_s: f64,
    level: Level,
    thread: Option<String>,
    target: &'a str,
    message: &'a fmt::Arguments<'a>,
    tag: Tag,
}

impl<'a> Line<'a> {
    fn new(record: &'a log::Record, message: &'a fmt::Arguments<'a>, tag: Tag) -> Self {
        Self {
            elapsed_s: session::get_elapsed_seconds(),
            level: record.level(),
            thread: std::thread::current().name().map(String::from),
            target: record.target(),
            message,
            tag,
        }
    }
}

impl<'a> fmt::Display for Line<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = plain_tag(self.level);

        write!(f, "[{:10.6} ", self.elapsed_s)?;
        match self.tag {
            Tag::Plain => write!(f, "{}", tag)?,
            Tag::Coloured => write!(f, "{}", colour_tag(self.level, tag))?,
        }
        write!(f, " {:<8}] ", self.thread.as_deref().unwrap_or("?"))?;

        // If debug or trace include the target, otherwise don't include it
        if self.level > Level::Info {
            write!(f, "{}: {}", self.target, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// Get the three letter tag of a log level
fn plain_tag(level: Level) -> &'static str {
    match level {
        Level::Trace => "TRC",
        Level::Debug => "DBG",
        Level::Info => "INF",
        Level::Warn => "WRN",
        Level::Error => "ERR",
    }
}

fn colour_tag(level: Level, tag: &str) -> colored::ColoredString {
    match level {
        Level::Trace => tag.dimmed().italic(),
        Level::Debug => tag.dimmed(),
        Level::Info => tag.normal(),
        Level::Warn => tag.yellow(),
        Level::Error => tag.red().bold(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn render(level: Level, thread: Option<&str>, args: fmt::Arguments) -> String {
        Line {
            elapsed_s: 1.5,
            level,
            thread: thread.map(String::from),
            target: "rig_lib::gimbal",
            message: &args,
            tag: Tag::Plain,
        }
        .to_string()
    }

    #[test]
    fn test_plain_lines() {
        assert_eq!(
            render(Level::Warn, Some("tracker"), format_args!("node {} silent", 2)),
            "[  1.500000 WRN tracker ] node 2 silent"
        );

        // Verbose levels name the module
        assert_eq!(
            render(Level::Debug, None, format_args!("cycle")),
            "[  1.500000 DBG ?       ] rig_lib::gimbal: cycle"
        );
    }

    #[test]
    fn test_tags() {
        assert_eq!(plain_tag(Level::Error), "ERR");
        assert_eq!(plain_tag(Level::Trace), "TRC");
    }
}
