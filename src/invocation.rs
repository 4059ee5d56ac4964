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

use std::ffi::OsString;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::cgroup::CGroup;
use crate::error::ConfigError;
use crate::identity::GroupIdentity;
use crate::identity::Identity;
use crate::limits::LimitSet;
use crate::limits::LimitSetBuilder;
use crate::limits::LimitTable;
use crate::limits::ACCOUNTING_CONTROLLER;
use crate::orchestrator::Plan;
use crate::runner::ExecutionSpec;
use crate::runner::OutputPolicy;

/// One request to run a command in a fresh control group, as collected from the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
	/// Overrides the default `cgrun/task_<pid>` group path.
	pub group_path: Option<String>,
	/// INI limits files, merged in order.
	pub limit_files: Vec<PathBuf>,
	/// `<controller>.<key>=<value>` tokens, applied after the files.
	pub inline_limits: Vec<String>,
	pub run_as: Option<String>,
	pub timeout_secs: Option<u64>,
	pub command: Vec<OsString>,
	pub output: OutputPolicy,
}

impl Invocation {
	/// Validates everything and resolves users, without touching any control group.
	pub fn into_plan(self) -> Result<Plan, ConfigError> {
		let timeout = self.timeout_secs.filter(|secs| *secs > 0).map(Duration::from_secs);
		let limits = self.limits(timeout.is_some())?;

		let path = match &self.group_path {
			Some(path) => CGroup::new(path)?,
			None => CGroup::for_current_task(),
		};
		let run_as = self.run_as.as_deref().map(Identity::lookup).transpose()?;
		let identity = match &run_as {
			Some(user) => user.clone(),
			None => Identity::current()?,
		};
		let group = GroupIdentity::new(path, identity.clone(), identity);

		let mut exec = ExecutionSpec::new(self.command).output(self.output);
		if let Some(user) = run_as {
			exec = exec.run_as(user);
		}
		if let Some(timeout) = timeout {
			exec = exec.timeout(timeout);
		}
		debug!(group = %group.path, limits = limits.len(), "plan ready");
		Ok(Plan::new(group, limits, exec))
	}

	fn limits(&self, timed: bool) -> Result<LimitSet, ConfigError> {
		let mut builder = LimitSet::builder();
		for path in &self.limit_files {
			if !path.is_file() {
				warn!(file = %path.display(), "not a regular file, skipping");
				continue;
			}
			if let Err(e) = load_file(&mut builder, path) {
				error!(error = %e, file = %path.display(), "limits file rejected, no limits will be applied");
				builder.poison();
			}
		}
		for token in &self.inline_limits {
			if let Err(e) = builder.inline(token) {
				warn!(error = %e, "skipping limit");
			}
		}
		if timed {
			builder.require(ACCOUNTING_CONTROLLER)?;
		}
		builder.build()
	}
}

fn load_file(builder: &mut LimitSetBuilder, path: &Path) -> Result<(), ConfigError> {
	let text = fs::read_to_string(path).map_err(|source| ConfigError::LimitsFile {
		path: path.to_path_buf(),
		source,
	})?;
	builder.table(&text.parse::<LimitTable>()?)?;
	Ok(())
}
