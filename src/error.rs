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

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::runner::ExitReport;

/// Problems with the requested limits, group name or identities. These are raised before any
/// control group exists, so nothing needs to be cleaned up.
#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("{0:?} is not a valid limit, expected <controller>.<key>=<value>")]
	MalformedToken(String),

	#[error("invalid name {name:?}: {reason}")]
	InvalidName { name: String, reason: &'static str },

	#[error("cannot read limits file {}: {source}", path.display())]
	LimitsFile {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("line {line}: {reason}")]
	LimitsSyntax { line: usize, reason: String },

	#[error("unknown user {0:?}")]
	UnknownUser(String),

	#[error("cannot look up user {user:?}: {source}")]
	UserLookup {
		user: String,
		#[source]
		source: nix::Error,
	},

	#[error("invalid control group path {path:?}: {reason}")]
	InvalidGroupPath { path: String, reason: &'static str },

	#[error("no resource limits were given, refusing to create an unconfigured control group")]
	NoLimits,
}

/// A single limit that could not be written during `configure`.
#[derive(Debug, Error)]
#[error("{controller}.{key}={value}: {source}")]
pub struct WriteFailure {
	pub controller: String,
	pub key: String,
	pub value: String,
	#[source]
	pub source: io::Error,
}

#[derive(Debug, Error)]
pub enum BackendError {
	#[error("no control group hierarchy is mounted at {}", root.display())]
	Unavailable { root: PathBuf },

	#[error("controller {controller:?} is not available in {}", root.display())]
	ControllerUnavailable { controller: String, root: PathBuf },

	#[error("permission denied on {}: {source}", path.display())]
	PermissionDenied {
		path: PathBuf,
		#[source]
		source: io::Error,
	},

	#[error("control group {} already exists", path.display())]
	AlreadyExists { path: PathBuf },

	#[error("could not apply {}", join_failures(.failures))]
	Configure { failures: Vec<WriteFailure> },

	#[error("control group {} still has processes attached", path.display())]
	GroupBusy { path: PathBuf },

	#[error("{}: {source}", path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
}

impl BackendError {
	/// Sorts an I/O error from the cgroup filesystem into the backend taxonomy.
	pub(crate) fn from_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
		let path = path.into();
		match source.kind() {
			io::ErrorKind::PermissionDenied => Self::PermissionDenied { path, source },
			io::ErrorKind::AlreadyExists => Self::AlreadyExists { path },
			_ if source.raw_os_error() == Some(nix::errno::Errno::EBUSY as i32) => Self::GroupBusy { path },
			_ => Self::Io { path, source },
		}
	}
}

fn join_failures(failures: &[WriteFailure]) -> String {
	failures.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Error)]
pub enum RunError {
	#[error("cannot spawn {program:?}: {source}")]
	SpawnFailed {
		program: String,
		#[source]
		source: io::Error,
	},

	#[error("lost track of the child process: {0}")]
	Wait(#[source] io::Error),
}

impl RunError {
	pub fn exit_code(&self) -> i32 {
		match self {
			Self::SpawnFailed { source, .. } if source.kind() == io::ErrorKind::NotFound => 127,
			Self::SpawnFailed { source, .. } if source.kind() == io::ErrorKind::PermissionDenied => 126,
			_ => 1,
		}
	}
}

/// The lifecycle stage in which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
	Create,
	Configure,
	Run,
	Delete,
}

impl fmt::Display for Stage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Create => "create",
			Self::Configure => "configure",
			Self::Run => "run",
			Self::Delete => "delete",
		})
	}
}

#[derive(Debug, Error)]
pub enum StageError {
	#[error(transparent)]
	Backend(#[from] BackendError),
	#[error(transparent)]
	Run(#[from] RunError),
}

#[derive(Debug, Error)]
#[error("{stage} failed: {error}")]
pub struct StageFailure {
	pub stage: Stage,
	#[source]
	pub error: StageError,
}

impl StageFailure {
	pub fn new(stage: Stage, error: impl Into<StageError>) -> Self {
		Self {
			stage,
			error: error.into(),
		}
	}

	pub fn exit_code(&self) -> i32 {
		match &self.error {
			StageError::Run(e) => e.exit_code(),
			StageError::Backend(_) => 1,
		}
	}
}

#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	Config(#[from] ConfigError),

	#[error(transparent)]
	Stage(#[from] StageFailure),

	/// Cleanup failed after the group had been used. The outcome of the earlier stages is kept.
	#[error("{}; {cleanup}", describe_primary(.primary))]
	Compound {
		primary: Result<ExitReport, StageFailure>,
		cleanup: StageFailure,
	},
}

fn describe_primary(primary: &Result<ExitReport, StageFailure>) -> String {
	match primary {
		Ok(report) => format!("command {}", report.termination),
		Err(failure) => failure.to_string(),
	}
}
