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
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::process;

use crate::error::ConfigError;

/// Prefix of the default group path.
pub const DEFAULT_PREFIX: &str = "cgrun";

/// Name of a control group, relative to the root of a hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CGroup(PathBuf);

impl CGroup {
	/// # Examples
	///
	/// ```
	/// use cgrun::CGroup;
	///
	/// let cgroup = CGroup::new("batch/job_1").unwrap();
	/// assert_eq!(cgroup.as_path().to_str(), Some("batch/job_1"));
	/// assert!(CGroup::new("/batch").is_err());
	/// assert!(CGroup::new("batch/../etc").is_err());
	/// ```
	pub fn new(path: &str) -> Result<Self, ConfigError> {
		let invalid = |reason| ConfigError::InvalidGroupPath {
			path: path.to_string(),
			reason,
		};
		let trimmed = path.trim_end_matches('/');
		if trimmed.is_empty() {
			return Err(invalid("path is empty"));
		}
		let mut out = PathBuf::new();
		for component in Path::new(trimmed).components() {
			match component {
				Component::Normal(name) => out.push(name),
				Component::RootDir | Component::Prefix(_) => return Err(invalid("path must be relative to the hierarchy root")),
				Component::CurDir | Component::ParentDir => return Err(invalid("path may not contain '.' or '..'")),
			}
		}
		Ok(Self(out))
	}

	/// The default, per-invocation group: `<prefix>/task_<pid>`.
	pub fn for_task(prefix: &str, pid: u32) -> Result<Self, ConfigError> {
		let mut cgroup = Self::new(prefix)?;
		cgroup.append(&format!("task_{pid}"))?;
		Ok(cgroup)
	}

	pub fn for_current_task() -> Self {
		Self(Path::new(DEFAULT_PREFIX).join(format!("task_{}", process::id())))
	}

	pub fn as_path(&self) -> &Path {
		&self.0
	}

	/// # Examples
	///
	/// ```
	/// use cgrun::CGroup;
	///
	/// let mut cgroup = CGroup::new("a/b/c").unwrap();
	/// cgroup.append("d").unwrap();
	/// assert_eq!(cgroup.as_path().to_str(), Some("a/b/c/d"));
	/// assert!(cgroup.append("/e").is_err());
	/// ```
	pub fn append(&mut self, path: &str) -> Result<(), ConfigError> {
		let tail = Self::new(path)?;
		self.0.push(tail.0);
		Ok(())
	}

	/// Proper ancestors of this group, from the hierarchy root (the empty path) down to the parent.
	pub fn ancestors(&self) -> Vec<&Path> {
		let mut out: Vec<&Path> = self.0.ancestors().skip(1).collect();
		out.reverse();
		out
	}
}

impl AsRef<Path> for CGroup {
	fn as_ref(&self) -> &Path {
		&self.0
	}
}

impl fmt::Display for CGroup {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0.display())
	}
}
