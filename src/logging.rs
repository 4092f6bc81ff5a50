//! Logger initialization, matching the format used by the rest of the stack:
//! `[timestamp LEVEL target file:line] message`, with `file:line` shown only at debug or
//! more verbose.

use crate::config::{Config, LogScope};
use anyhow::{Context, Result};
use clap::crate_name;
use env_logger::fmt::Color;
use log::LevelFilter;
use std::{env, io::Write};

/// Set `RUST_LOG` from the configuration and initialize the global logger.
pub fn init(config: &Config) -> Result<()> {
    let directive = if config.log_scope() == LogScope::Global {
        config.log_level().to_string()
    } else {
        format!("{}={}", crate_name!(), config.log_level())
    };
    env::set_var("RUST_LOG", directive);

    let log_level = config.log_level();
    env_logger::builder()
        .format(move |buf, r| {
            let mut style = buf.style();
            style.set_color(Color::Black).set_intense(true);
            writeln!(
                buf,
                "{}{} {:<5} {}{}{} {}",
                style.value("["),
                buf.timestamp_millis(),
                buf.default_styled_level(r.level()),
                r.target(),
                match (log_level >= LevelFilter::Debug, r.file(), r.line()) {
                    (true, Some(file), Some(line)) => format!(" {}:{}", file, line),
                    _ => "".into(),
                },
                style.value("]"),
                r.args()
            )
        })
        .try_init()
        .context("init env logger")
}
