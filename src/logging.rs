// Copyright 2026 Octave Online LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Diagnostics go to stderr through `tracing`, so the child's output on stdout stays untouched.

use std::env;
use std::io;
use std::io::IsTerminal;

use thiserror::Error;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Consulted before [`LoggerConfig::level`].
pub const LEVEL_ENV: &str = "RUST_LOG";

#[derive(Debug, Clone)]
pub struct LoggerConfig {
	/// An `EnvFilter` directive such as `warn` or `cgrun=debug`.
	pub level: String,
	pub with_targets: bool,
	pub use_color: bool,
}

impl Default for LoggerConfig {
	fn default() -> Self {
		Self {
			level: level_for(0).to_string(),
			with_targets: false,
			use_color: io::stderr().is_terminal(),
		}
	}
}

impl LoggerConfig {
	pub fn verbosity(mut self, count: u8) -> Self {
		self.level = level_for(count).to_string();
		self
	}
}

#[derive(Debug, Error)]
pub enum LoggerError {
	#[error("logger has already been initialized")]
	AlreadyInitialized,
	#[error("invalid log level: {0}")]
	InvalidLogLevel(String),
}

/// Each `-v` raises the level one step from `warn`.
pub fn level_for(verbosity: u8) -> &'static str {
	match verbosity {
		0 => "warn",
		1 => "info",
		2 => "debug",
		_ => "trace",
	}
}

fn mk_filter(level: &str) -> Result<EnvFilter, LoggerError> {
	EnvFilter::try_new(level).map_err(|_| LoggerError::InvalidLogLevel(level.to_string()))
}

pub fn init(cfg: &LoggerConfig) -> Result<(), LoggerError> {
	let level = match env::var(LEVEL_ENV) {
		Ok(level) if !level.trim().is_empty() => level,
		_ => cfg.level.clone(),
	};
	let filter = mk_filter(&level)?;
	let fmt_layer = fmt::layer()
		.with_writer(io::stderr)
		.with_ansi(cfg.use_color)
		.with_target(cfg.with_targets)
		.without_time();

	tracing_subscriber::registry()
		.with(filter)
		.with(fmt_layer)
		.try_init()
		.map_err(|_| LoggerError::AlreadyInitialized)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn verbosity_steps_up_from_warn() {
		let levels: Vec<_> = (0..5).map(level_for).collect();
		assert_eq!(levels, ["warn", "info", "debug", "trace", "trace"]);
		assert_eq!(LoggerConfig::default().verbosity(2).level, "debug");
	}

	#[test]
	fn bad_directives_are_rejected() {
		assert!(matches!(mk_filter("cgrun=[nope"), Err(LoggerError::InvalidLogLevel(_))));
		assert!(mk_filter("cgrun=debug,warn").is_ok());
	}
}
