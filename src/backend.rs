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

//! Control group backends.
//!
//! [`ResourceGroupBackend`] is the seam between the lifecycle and the kernel facility. [`CgroupFs`]
//! implements it directly on top of the cgroup filesystem, for both the unified hierarchy
//! (cgroups v2) and the legacy per-controller hierarchies (cgroups v1).

use std::collections::HashSet;
use std::fs;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::BackendError;
use crate::error::WriteFailure;
use crate::identity::GroupIdentity;
use crate::identity::Identity;
use crate::limits::Controller;
use crate::limits::LimitSet;
use crate::limits::ACCOUNTING_CONTROLLER;

pub const DEFAULT_ROOT: &str = "/sys/fs/cgroup";

/// Files a process writes its pid into to join a group.
const ATTACH_FILES: [&str; 2] = ["cgroup.procs", "tasks"];

/// Creates, configures and deletes one control group. Attaching processes is left to the
/// [`ProcessRunner`](crate::ProcessRunner), which spawns children directly into
/// [`attach_targets`](ResourceGroupBackend::attach_targets).
pub trait ResourceGroupBackend {
	fn create(&self, group: &GroupIdentity, controllers: &[Controller]) -> Result<(), BackendError>;

	fn configure(&self, group: &GroupIdentity, controllers: &[Controller], limits: &LimitSet) -> Result<(), BackendError>;

	fn delete(&self, group: &GroupIdentity, controllers: &[Controller]) -> Result<(), BackendError>;

	fn attach_targets(&self, group: &GroupIdentity, controllers: &[Controller]) -> Vec<PathBuf>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hierarchy {
	/// cgroups v2: a single tree, controllers enabled through `cgroup.subtree_control`.
	Unified,
	/// cgroups v1: one tree per controller, mounted at `<root>/<controller>`.
	Legacy,
}

impl Hierarchy {
	pub fn detect(root: &Path) -> Result<Self, BackendError> {
		if root.join("cgroup.controllers").is_file() {
			Ok(Self::Unified)
		} else if root.is_dir() {
			Ok(Self::Legacy)
		} else {
			Err(BackendError::Unavailable { root: root.to_path_buf() })
		}
	}
}

#[derive(Debug, Clone)]
pub struct CgroupFs {
	root: PathBuf,
	hierarchy: Hierarchy,
}

impl CgroupFs {
	pub fn new(root: impl Into<PathBuf>, hierarchy: Hierarchy) -> Self {
		Self {
			root: root.into(),
			hierarchy,
		}
	}

	pub fn detect(root: impl Into<PathBuf>) -> Result<Self, BackendError> {
		let root = root.into();
		let hierarchy = Hierarchy::detect(&root)?;
		debug!(root = %root.display(), ?hierarchy, "detected cgroup hierarchy");
		Ok(Self { root, hierarchy })
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn hierarchy(&self) -> Hierarchy {
		self.hierarchy
	}

	/// CPU accounting is always on in the unified hierarchy; there is no controller to enable.
	fn is_implicit(&self, controller: &Controller) -> bool {
		self.hierarchy == Hierarchy::Unified && controller.as_str() == ACCOUNTING_CONTROLLER
	}

	fn controller_dir(&self, group: &GroupIdentity, controller: &Controller) -> PathBuf {
		match self.hierarchy {
			Hierarchy::Unified => self.root.join(&group.path),
			Hierarchy::Legacy => self.root.join(controller.as_str()).join(&group.path),
		}
	}

	fn group_dirs(&self, group: &GroupIdentity, controllers: &[Controller]) -> Vec<PathBuf> {
		match self.hierarchy {
			Hierarchy::Unified => vec![self.root.join(&group.path)],
			Hierarchy::Legacy => {
				let mut dirs: Vec<PathBuf> = Vec::new();
				for controller in controllers {
					let dir = self.controller_dir(group, controller);
					if !dirs.contains(&dir) {
						dirs.push(dir);
					}
				}
				dirs
			}
		}
	}

	fn available_controllers(&self) -> Result<HashSet<String>, BackendError> {
		let path = self.root.join("cgroup.controllers");
		match fs::read_to_string(&path) {
			Ok(contents) => Ok(contents.split_whitespace().map(str::to_string).collect()),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BackendError::Unavailable { root: self.root.clone() }),
			Err(e) => Err(BackendError::from_io(path, e)),
		}
	}

	fn create_unified(&self, group: &GroupIdentity, controllers: &[Controller], created: &mut Vec<PathBuf>) -> Result<Vec<PathBuf>, BackendError> {
		let available = self.available_controllers()?;
		let wanted: Vec<&Controller> = controllers.iter().filter(|c| !self.is_implicit(c)).collect();
		for controller in &wanted {
			if !available.contains(controller.as_str()) {
				return Err(BackendError::ControllerUnavailable {
					controller: controller.to_string(),
					root: self.root.clone(),
				});
			}
		}
		let enable = wanted.iter().map(|c| format!("+{c}")).collect::<Vec<_>>().join(" ");
		for ancestor in group.path.ancestors() {
			let dir = self.root.join(ancestor);
			make_dir(&dir, created)?;
			if !enable.is_empty() {
				let control = dir.join("cgroup.subtree_control");
				write_file(&control, &enable).map_err(|e| BackendError::from_io(control, e))?;
			}
		}
		let dir = self.root.join(&group.path);
		make_group_dir(&dir, created)?;
		Ok(vec![dir])
	}

	fn create_legacy(&self, group: &GroupIdentity, controllers: &[Controller], created: &mut Vec<PathBuf>) -> Result<Vec<PathBuf>, BackendError> {
		if !self.root.is_dir() {
			return Err(BackendError::Unavailable { root: self.root.clone() });
		}
		for controller in controllers {
			if !self.root.join(controller.as_str()).is_dir() {
				return Err(BackendError::ControllerUnavailable {
					controller: controller.to_string(),
					root: self.root.clone(),
				});
			}
		}
		let dirs = self.group_dirs(group, controllers);
		for controller in controllers {
			let mount = self.root.join(controller.as_str());
			for ancestor in group.path.ancestors().into_iter().skip(1) {
				make_dir(&mount.join(ancestor), created)?;
			}
		}
		for dir in &dirs {
			make_group_dir(dir, created)?;
		}
		Ok(dirs)
	}
}

/// Creates a group directory and records it in `created`. An existing directory is reused;
/// returns whether it was new.
fn make_dir(dir: &Path, created: &mut Vec<PathBuf>) -> Result<bool, BackendError> {
	match fs::create_dir(dir) {
		Ok(()) => {
			debug!(dir = %dir.display(), "created");
			created.push(dir.to_path_buf());
			Ok(true)
		}
		Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() => Ok(false),
		Err(e) => Err(BackendError::from_io(dir, e)),
	}
}

fn make_group_dir(dir: &Path, created: &mut Vec<PathBuf>) -> Result<(), BackendError> {
	if !make_dir(dir, created)? {
		warn!(dir = %dir.display(), "control group already exists, reusing it");
	}
	Ok(())
}

/// Undoes a failed `create`: removes what this call made, innermost first.
fn roll_back(created: &[PathBuf]) {
	for dir in created.iter().rev() {
		if let Err(e) = remove_tree(dir) {
			warn!(dir = %dir.display(), error = %e, "could not remove partially created group");
		}
	}
}

fn write_file(path: &Path, content: &str) -> io::Result<()> {
	let mut file = fs::OpenOptions::new().write(true).open(path)?;
	file.write_all(content.as_bytes())
}

fn chown_to(path: &Path, who: &Identity) -> Result<(), BackendError> {
	nix::unistd::chown(path, Some(who.uid()), Some(who.gid())).map_err(|errno| BackendError::from_io(path, io::Error::from(errno)))
}

/// Hands the group directory and its control files to the owner, and the attach files to the
/// task user.
fn assign_ownership(dir: &Path, group: &GroupIdentity) -> Result<(), BackendError> {
	if !group.owner.is_effective() {
		chown_to(dir, &group.owner)?;
		let entries = fs::read_dir(dir).map_err(|e| BackendError::from_io(dir, e))?;
		for entry in entries {
			let entry = entry.map_err(|e| BackendError::from_io(dir, e))?;
			let is_file = entry.file_type().map_err(|e| BackendError::from_io(entry.path(), e))?.is_file();
			if is_file {
				chown_to(&entry.path(), &group.owner)?;
			}
		}
	}
	if !group.task.is_effective() {
		for name in ATTACH_FILES {
			let path = dir.join(name);
			if path.exists() {
				chown_to(&path, &group.task)?;
			}
		}
	}
	Ok(())
}

/// Removes a group and every group nested in it. Control files vanish with their directory.
fn remove_tree(dir: &Path) -> Result<(), BackendError> {
	let entries = match fs::read_dir(dir) {
		Ok(entries) => entries,
		Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
		Err(e) => return Err(BackendError::from_io(dir, e)),
	};
	for entry in entries {
		let entry = entry.map_err(|e| BackendError::from_io(dir, e))?;
		let is_dir = entry.file_type().map_err(|e| BackendError::from_io(entry.path(), e))?.is_dir();
		if is_dir {
			remove_tree(&entry.path())?;
		}
	}
	match fs::remove_dir(dir) {
		Ok(()) => {
			debug!(dir = %dir.display(), "removed");
			Ok(())
		}
		Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(BackendError::from_io(dir, e)),
	}
}

impl ResourceGroupBackend for CgroupFs {
	fn create(&self, group: &GroupIdentity, controllers: &[Controller]) -> Result<(), BackendError> {
		let mut created = Vec::new();
		let made = match self.hierarchy {
			Hierarchy::Unified => self.create_unified(group, controllers, &mut created),
			Hierarchy::Legacy => self.create_legacy(group, controllers, &mut created),
		};
		let owned = made.and_then(|dirs| dirs.iter().try_for_each(|dir| assign_ownership(dir, group)));
		if let Err(e) = owned {
			roll_back(&created);
			return Err(e);
		}
		info!(group = %group.path, owner = %group.owner, task = %group.task, "control group ready");
		Ok(())
	}

	fn configure(&self, group: &GroupIdentity, controllers: &[Controller], limits: &LimitSet) -> Result<(), BackendError> {
		let mut failures = Vec::new();
		for (controller, limit) in limits.iter() {
			if !controllers.contains(controller) {
				debug!(%controller, key = %limit.key, "controller not part of the group, skipping");
				continue;
			}
			let file = self.controller_dir(group, controller).join(format!("{controller}.{}", limit.key));
			debug!(file = %file.display(), value = %limit.value, "write");
			if let Err(source) = write_file(&file, &limit.value) {
				warn!(file = %file.display(), error = %source, "limit not applied");
				failures.push(WriteFailure {
					controller: controller.to_string(),
					key: limit.key.clone(),
					value: limit.value.clone(),
					source,
				});
			}
		}
		if failures.is_empty() {
			Ok(())
		} else {
			Err(BackendError::Configure { failures })
		}
	}

	fn delete(&self, group: &GroupIdentity, controllers: &[Controller]) -> Result<(), BackendError> {
		for dir in self.group_dirs(group, controllers) {
			remove_tree(&dir)?;
		}
		info!(group = %group.path, "control group removed");
		Ok(())
	}

	fn attach_targets(&self, group: &GroupIdentity, controllers: &[Controller]) -> Vec<PathBuf> {
		self.group_dirs(group, controllers).into_iter().map(|dir| dir.join(ATTACH_FILES[0])).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cgroup::CGroup;
	use tempfile::tempdir;

	fn group(path: &str) -> GroupIdentity {
		let me = Identity::current().unwrap();
		GroupIdentity::new(CGroup::new(path).unwrap(), me.clone(), me)
	}

	fn controllers(names: &[&str]) -> Vec<Controller> {
		names.iter().map(|n| Controller::new(n).unwrap()).collect()
	}

	fn unified_root() -> tempfile::TempDir {
		let tmp = tempdir().unwrap();
		fs::write(tmp.path().join("cgroup.controllers"), "cpuset cpu io memory pids\n").unwrap();
		fs::write(tmp.path().join("cgroup.subtree_control"), "").unwrap();
		fs::create_dir(tmp.path().join("cgrun")).unwrap();
		fs::write(tmp.path().join("cgrun/cgroup.subtree_control"), "").unwrap();
		tmp
	}

	fn legacy_root(mounted: &[&str]) -> tempfile::TempDir {
		let tmp = tempdir().unwrap();
		for name in mounted {
			fs::create_dir(tmp.path().join(name)).unwrap();
		}
		tmp
	}

	#[test]
	fn detects_hierarchy_flavour() {
		let unified = unified_root();
		assert_eq!(Hierarchy::detect(unified.path()).unwrap(), Hierarchy::Unified);
		let legacy = legacy_root(&["cpu"]);
		assert_eq!(Hierarchy::detect(legacy.path()).unwrap(), Hierarchy::Legacy);
		assert!(matches!(
			Hierarchy::detect(&legacy.path().join("missing")),
			Err(BackendError::Unavailable { .. })
		));
	}

	#[test]
	fn unified_create_enables_controllers_down_the_tree() {
		let root = unified_root();
		let backend = CgroupFs::new(root.path(), Hierarchy::Unified);
		let group = group("cgrun/task_1");
		backend.create(&group, &controllers(&["cpu", "memory", "cpuacct"])).unwrap();
		assert!(root.path().join("cgrun/task_1").is_dir());
		assert_eq!(fs::read_to_string(root.path().join("cgroup.subtree_control")).unwrap(), "+cpu +memory");
		assert_eq!(fs::read_to_string(root.path().join("cgrun/cgroup.subtree_control")).unwrap(), "+cpu +memory");
		assert_eq!(
			backend.attach_targets(&group, &controllers(&["cpu", "memory"])),
			vec![root.path().join("cgrun/task_1/cgroup.procs")]
		);
	}

	#[test]
	fn unified_create_rejects_unknown_controller_before_touching_anything() {
		let root = unified_root();
		let backend = CgroupFs::new(root.path(), Hierarchy::Unified);
		let err = backend.create(&group("cgrun/task_2"), &controllers(&["cpu", "hugetlb"])).unwrap_err();
		assert!(matches!(err, BackendError::ControllerUnavailable { ref controller, .. } if controller == "hugetlb"));
		assert!(!root.path().join("cgrun/task_2").exists());
		assert_eq!(fs::read_to_string(root.path().join("cgroup.subtree_control")).unwrap(), "");
	}

	#[test]
	fn unified_without_mount_is_unavailable() {
		let tmp = tempdir().unwrap();
		let backend = CgroupFs::new(tmp.path(), Hierarchy::Unified);
		let err = backend.create(&group("cgrun/task_3"), &controllers(&["cpu"])).unwrap_err();
		assert!(matches!(err, BackendError::Unavailable { .. }));
	}

	#[test]
	fn legacy_create_makes_one_directory_per_controller() {
		let root = legacy_root(&["cpu", "memory", "cpuacct"]);
		let backend = CgroupFs::new(root.path(), Hierarchy::Legacy);
		let group = group("cgrun/task_4");
		let ctls = controllers(&["cpu", "memory", "cpuacct"]);
		backend.create(&group, &ctls).unwrap();
		for name in ["cpu", "memory", "cpuacct"] {
			assert!(root.path().join(name).join("cgrun/task_4").is_dir(), "{name}");
		}
		assert_eq!(backend.attach_targets(&group, &ctls).len(), 3);

		// Creating again reuses the existing directories.
		backend.create(&group, &ctls).unwrap();

		backend.delete(&group, &ctls).unwrap();
		for name in ["cpu", "memory", "cpuacct"] {
			assert!(!root.path().join(name).join("cgrun/task_4").exists(), "{name}");
			assert!(root.path().join(name).join("cgrun").is_dir(), "{name}");
		}
	}

	#[test]
	fn legacy_create_needs_every_controller_mounted() {
		let root = legacy_root(&["cpu"]);
		let backend = CgroupFs::new(root.path(), Hierarchy::Legacy);
		let err = backend.create(&group("cgrun/task_5"), &controllers(&["cpu", "memory"])).unwrap_err();
		assert!(matches!(err, BackendError::ControllerUnavailable { ref controller, .. } if controller == "memory"));
		assert!(!root.path().join("cpu/cgrun/task_5").exists());
	}

	#[test]
	fn failed_create_removes_what_it_made() {
		let root = legacy_root(&["cpu", "memory"]);
		fs::create_dir(root.path().join("memory/cgrun")).unwrap();
		fs::write(root.path().join("memory/cgrun/task_9"), "").unwrap();
		let backend = CgroupFs::new(root.path(), Hierarchy::Legacy);
		let err = backend.create(&group("cgrun/task_9"), &controllers(&["cpu", "memory"])).unwrap_err();
		assert!(matches!(err, BackendError::AlreadyExists { .. }), "{err}");
		assert!(!root.path().join("cpu/cgrun").exists());
		// Directories that were there before are left alone.
		assert!(root.path().join("memory/cgrun/task_9").is_file());
	}

	#[test]
	fn failed_unified_create_removes_new_ancestors() {
		let root = unified_root();
		let backend = CgroupFs::new(root.path(), Hierarchy::Unified);
		// A new intermediate group gets no subtree_control file here, so enabling cpu below it fails.
		let err = backend.create(&group("cgrun/fresh/leaf"), &controllers(&["cpu"])).unwrap_err();
		assert!(matches!(err, BackendError::Io { .. }), "{err}");
		assert!(!root.path().join("cgrun/fresh").exists());
		assert!(root.path().join("cgrun").is_dir());
	}

	#[test]
	fn configure_writes_every_limit_and_reports_failures_by_key() {
		let root = legacy_root(&["cpu", "memory"]);
		let backend = CgroupFs::new(root.path(), Hierarchy::Legacy);
		let group = group("cgrun/task_6");
		let ctls = controllers(&["cpu", "memory"]);
		backend.create(&group, &ctls).unwrap();
		// The kernel provides the control files; only cpu.shares exists here.
		fs::write(root.path().join("cpu/cgrun/task_6/cpu.shares"), "").unwrap();

		let mut builder = LimitSet::builder();
		builder.inline("cpu.shares=500").unwrap().inline("memory.limit_in_bytes=1000000").unwrap();
		let limits = builder.build().unwrap();

		let err = backend.configure(&group, &ctls, &limits).unwrap_err();
		assert_eq!(fs::read_to_string(root.path().join("cpu/cgrun/task_6/cpu.shares")).unwrap(), "500");
		match err {
			BackendError::Configure { failures } => {
				assert_eq!(failures.len(), 1);
				assert_eq!(failures[0].controller, "memory");
				assert_eq!(failures[0].key, "limit_in_bytes");
			}
			other => panic!("unexpected {other:?}"),
		}

		fs::write(root.path().join("memory/cgrun/task_6/memory.limit_in_bytes"), "").unwrap();
		backend.configure(&group, &ctls, &limits).unwrap();
		assert_eq!(
			fs::read_to_string(root.path().join("memory/cgrun/task_6/memory.limit_in_bytes")).unwrap(),
			"1000000"
		);
	}

	#[test]
	fn delete_removes_nested_groups_and_tolerates_absence() {
		let root = unified_root();
		let backend = CgroupFs::new(root.path(), Hierarchy::Unified);
		let group = group("cgrun/task_7");
		let ctls = controllers(&["cpu"]);
		backend.create(&group, &ctls).unwrap();
		fs::create_dir_all(root.path().join("cgrun/task_7/worker/inner")).unwrap();
		backend.delete(&group, &ctls).unwrap();
		assert!(!root.path().join("cgrun/task_7").exists());
		backend.delete(&group, &ctls).unwrap();
	}
}
