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

use std::ffi::CString;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::io::Read;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::Stdio;
use std::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::sys::signal::killpg;
use nix::sys::signal::Signal;
use nix::unistd::getgrouplist;
use nix::unistd::getpid;
use nix::unistd::setgid;
use nix::unistd::setgroups;
use nix::unistd::setuid;
use nix::unistd::Gid;
use nix::unistd::Pid;
use nix::unistd::Uid;
use tracing::debug;
use tracing::warn;

use crate::error::RunError;
use crate::identity::GroupIdentity;
use crate::identity::Identity;

/// What happens to the child's stdout and stderr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputPolicy {
	/// The child writes straight to our own stdout/stderr.
	#[default]
	Inherit,
	/// Both streams are collected into the [`ExitReport`].
	Capture,
}

/// The command to run inside the group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionSpec {
	pub command: Vec<OsString>,
	pub run_as: Option<Identity>,
	pub timeout: Option<Duration>,
	pub output: OutputPolicy,
}

impl ExecutionSpec {
	pub fn new<I, S>(command: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<OsString>,
	{
		Self {
			command: command.into_iter().map(Into::into).collect(),
			..Self::default()
		}
	}

	pub fn run_as(mut self, identity: Identity) -> Self {
		self.run_as = Some(identity);
		self
	}

	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	pub fn output(mut self, output: OutputPolicy) -> Self {
		self.output = output;
		self
	}

	/// The wall-clock bound, if any. A zero timeout means no bound.
	pub fn deadline(&self) -> Option<Duration> {
		self.timeout.filter(|t| !t.is_zero())
	}

	pub fn program(&self) -> Option<&OsStr> {
		self.command.first().map(OsString::as_os_str)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
	Exited(i32),
	Signaled(i32),
	/// The deadline passed and the process group was killed.
	TimedOut(Duration),
	/// The command was empty; nothing was started.
	Skipped,
	/// The command was written to a script instead of being run.
	Deferred,
}

impl Termination {
	/// Exit status to hand on to our own caller, following shell conventions for signals.
	pub fn exit_code(&self) -> i32 {
		match *self {
			Self::Exited(code) => code,
			Self::Signaled(signal) => 128 + signal,
			Self::TimedOut(_) => 128 + Signal::SIGKILL as i32,
			Self::Skipped | Self::Deferred => 0,
		}
	}
}

impl fmt::Display for Termination {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match *self {
			Self::Exited(code) => write!(f, "exited with code {code}"),
			Self::Signaled(signal) => match Signal::try_from(signal) {
				Ok(signal) => write!(f, "was killed by {}", signal.as_str()),
				Err(_) => write!(f, "was killed by signal {signal}"),
			},
			Self::TimedOut(limit) => write!(f, "timed out after {}s and was killed", limit.as_secs_f64()),
			Self::Skipped => f.write_str("was empty, nothing was run"),
			Self::Deferred => f.write_str("was written to the script"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
	pub termination: Termination,
	pub elapsed: Duration,
	/// Present only with [`OutputPolicy::Capture`].
	pub stdout: Option<Vec<u8>>,
	pub stderr: Option<Vec<u8>>,
}

impl ExitReport {
	pub(crate) fn without_output(termination: Termination) -> Self {
		Self {
			termination,
			elapsed: Duration::ZERO,
			stdout: None,
			stderr: None,
		}
	}

	pub fn exit_code(&self) -> i32 {
		self.termination.exit_code()
	}
}

/// Resolved in the parent, including the supplementary groups, so the child only has to make
/// syscalls.
struct Credentials {
	uid: Uid,
	gid: Gid,
	groups: Vec<Gid>,
}

impl Credentials {
	fn for_identity(identity: &Identity, program: &str) -> Result<Self, RunError> {
		let spawn_err = |source| RunError::SpawnFailed {
			program: program.to_string(),
			source,
		};
		let name = CString::new(identity.name()).map_err(|e| spawn_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
		let groups = getgrouplist(&name, identity.gid()).map_err(|errno| spawn_err(io::Error::from(errno)))?;
		Ok(Self {
			uid: identity.uid(),
			gid: identity.gid(),
			groups,
		})
	}
}

/// Runs in the forked child before `execve`: join the group first, then drop privileges.
fn enter_group(targets: &[PathBuf], credentials: Option<&Credentials>) -> io::Result<()> {
	for target in targets {
		let mut file = fs::OpenOptions::new().write(true).open(target)?;
		file.write_all(b"0\n")?;
	}
	if let Some(credentials) = credentials {
		setgroups(&credentials.groups)?;
		setgid(credentials.gid)?;
		setuid(credentials.uid)?;
	}
	Ok(())
}

fn drain(mut pipe: impl Read + Send + 'static) -> JoinHandle<Vec<u8>> {
	thread::spawn(move || {
		let mut buf = Vec::new();
		if let Err(e) = pipe.read_to_end(&mut buf) {
			warn!(error = %e, captured = buf.len(), "captured output is incomplete");
		}
		buf
	})
}

fn kill_tree(pgid: Pid) {
	match killpg(pgid, Signal::SIGKILL) {
		Ok(()) | Err(Errno::ESRCH) => {}
		Err(errno) => warn!(pgid = pgid.as_raw(), %errno, "could not kill process group"),
	}
}

/// Pids listed in an attach file. `0` is what a child writes for itself and is not a pid.
fn member_pids(target: &Path) -> Vec<Pid> {
	let Ok(contents) = fs::read_to_string(target) else {
		return Vec::new();
	};
	let me = getpid();
	contents
		.lines()
		.filter_map(|line| line.trim().parse::<i32>().ok())
		.filter(|pid| *pid > 0)
		.map(Pid::from_raw)
		.filter(|pid| *pid != me)
		.collect()
}

/// Kills everything still in the control group, including descendants that left the process
/// group. Uses `cgroup.kill` where the kernel has it.
fn kill_group(targets: &[PathBuf]) {
	for target in targets {
		if let Some(dir) = target.parent() {
			let killed = fs::OpenOptions::new()
				.write(true)
				.open(dir.join("cgroup.kill"))
				.and_then(|mut file| file.write_all(b"1"));
			if killed.is_ok() {
				continue;
			}
		}
		for pid in member_pids(target) {
			match kill(pid, Signal::SIGKILL) {
				Ok(()) | Err(Errno::ESRCH) => {}
				Err(errno) => warn!(pid = pid.as_raw(), %errno, "could not kill group member"),
			}
		}
	}
}

/// Starts commands inside a control group and waits for them.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
	pub fn new() -> Self {
		Self
	}

	/// Spawns `spec` already attached to the group through `attach_targets`, optionally as another
	/// user and under a deadline, and waits for it.
	pub fn run(&self, group: &GroupIdentity, attach_targets: &[PathBuf], spec: &ExecutionSpec) -> Result<ExitReport, RunError> {
		let Some((program, args)) = spec.command.split_first() else {
			debug!(group = %group.path, "empty command, nothing to run");
			return Ok(ExitReport::without_output(Termination::Skipped));
		};
		let program_name = program.to_string_lossy().into_owned();

		let mut cmd = Command::new(program);
		cmd.args(args);
		if spec.output == OutputPolicy::Capture {
			cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
		}
		let deadline = spec.deadline();
		if deadline.is_some() {
			// Own process group, so the whole tree can be killed at once.
			cmd.process_group(0);
		}
		let credentials = match &spec.run_as {
			Some(identity) if !identity.is_effective() => Some(Credentials::for_identity(identity, &program_name)?),
			_ => None,
		};
		let targets = attach_targets.to_vec();
		// SAFETY: everything the hook needs is resolved before the fork. In the child it only
		// calls open, write, close, setgroups, setgid and setuid, none of which allocate or take
		// locks.
		unsafe {
			cmd.pre_exec(move || enter_group(&targets, credentials.as_ref()));
		}

		debug!(group = %group.path, program = %program_name, ?args, user = ?spec.run_as.as_ref().map(Identity::name), ?deadline, "spawn");
		let started = Instant::now();
		let mut child = cmd.spawn().map_err(|source| RunError::SpawnFailed {
			program: program_name.clone(),
			source,
		})?;
		let pid = Pid::from_raw(child.id() as i32);
		let stdout = child.stdout.take().map(drain);
		let stderr = child.stderr.take().map(drain);

		let (tx, rx) = mpsc::channel();
		thread::spawn(move || {
			let _ = tx.send(child.wait());
		});

		let mut timed_out = None;
		let waited = match deadline {
			None => rx.recv().ok(),
			Some(limit) => match rx.recv_timeout(limit) {
				Ok(status) => Some(status),
				Err(RecvTimeoutError::Timeout) => {
					warn!(pid = pid.as_raw(), ?limit, "deadline reached, killing the process group");
					kill_tree(pid);
					kill_group(attach_targets);
					timed_out = Some(limit);
					rx.recv().ok()
				}
				Err(RecvTimeoutError::Disconnected) => None,
			},
		};
		let status = waited
			.ok_or_else(|| RunError::Wait(io::Error::other("waiter thread exited without a status")))?
			.map_err(RunError::Wait)?;
		let elapsed = started.elapsed();

		let termination = match (timed_out, status.code()) {
			(Some(limit), _) => Termination::TimedOut(limit),
			(None, Some(code)) => Termination::Exited(code),
			(None, None) => Termination::Signaled(status.signal().unwrap_or(0)),
		};
		debug!(program = %program_name, %termination, ?elapsed, "finished");
		Ok(ExitReport {
			termination,
			elapsed,
			stdout: stdout.map(|h| h.join().unwrap_or_default()),
			stderr: stderr.map(|h| h.join().unwrap_or_default()),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cgroup::CGroup;

	fn group() -> GroupIdentity {
		let me = Identity::current().unwrap();
		GroupIdentity::new(CGroup::new("cgrun/runner_test").unwrap(), me.clone(), me)
	}

	fn sh(script: &str) -> ExecutionSpec {
		ExecutionSpec::new(["/bin/sh", "-c", script])
	}

	#[test]
	fn empty_command_is_skipped() {
		let report = ProcessRunner::new().run(&group(), &[], &ExecutionSpec::default()).unwrap();
		assert_eq!(report.termination, Termination::Skipped);
		assert_eq!(report.exit_code(), 0);
	}

	#[test]
	fn exit_codes_are_reported() {
		let runner = ProcessRunner::new();
		let ok = runner.run(&group(), &[], &ExecutionSpec::new(["/bin/true"])).unwrap();
		assert_eq!(ok.termination, Termination::Exited(0));
		let failed = runner.run(&group(), &[], &sh("exit 3")).unwrap();
		assert_eq!(failed.termination, Termination::Exited(3));
		assert_eq!(failed.exit_code(), 3);
	}

	#[test]
	fn signals_map_to_shell_exit_codes() {
		let report = ProcessRunner::new().run(&group(), &[], &sh("kill -9 $$")).unwrap();
		assert_eq!(report.termination, Termination::Signaled(9));
		assert_eq!(report.exit_code(), 137);
		assert_eq!(report.termination.to_string(), "was killed by SIGKILL");
	}

	#[test]
	fn output_can_be_captured() {
		let spec = sh("echo out; echo err >&2").output(OutputPolicy::Capture);
		let report = ProcessRunner::new().run(&group(), &[], &spec).unwrap();
		assert_eq!(report.stdout.as_deref(), Some(&b"out\n"[..]));
		assert_eq!(report.stderr.as_deref(), Some(&b"err\n"[..]));
	}

	#[test]
	fn inherited_output_is_not_captured() {
		let report = ProcessRunner::new().run(&group(), &[], &ExecutionSpec::new(["/bin/true"])).unwrap();
		assert!(report.stdout.is_none());
		assert!(report.stderr.is_none());
	}

	#[test]
	fn missing_program_fails_to_spawn() {
		let err = ProcessRunner::new()
			.run(&group(), &[], &ExecutionSpec::new(["/nonexistent/cgrun-test"]))
			.unwrap_err();
		assert!(matches!(err, RunError::SpawnFailed { ref program, .. } if program == "/nonexistent/cgrun-test"));
		assert_eq!(err.exit_code(), 127);
	}

	#[test]
	fn child_attaches_itself_before_exec() {
		let tmp = tempfile::tempdir().unwrap();
		let procs = tmp.path().join("cgroup.procs");
		fs::write(&procs, "").unwrap();
		let report = ProcessRunner::new()
			.run(&group(), &[procs.clone()], &ExecutionSpec::new(["/bin/true"]))
			.unwrap();
		assert_eq!(report.termination, Termination::Exited(0));
		assert_eq!(fs::read_to_string(&procs).unwrap(), "0\n");
	}

	#[test]
	fn attach_failure_is_a_spawn_failure() {
		let tmp = tempfile::tempdir().unwrap();
		let err = ProcessRunner::new()
			.run(&group(), &[tmp.path().join("missing/cgroup.procs")], &ExecutionSpec::new(["/bin/true"]))
			.unwrap_err();
		assert!(matches!(err, RunError::SpawnFailed { .. }));
	}

	#[test]
	fn timeout_kills_processes_that_ignore_sigterm() {
		let spec = sh("trap '' TERM; sleep 30; exit 0").timeout(Duration::from_secs(1));
		let report = ProcessRunner::new().run(&group(), &[], &spec).unwrap();
		assert_eq!(report.termination, Termination::TimedOut(Duration::from_secs(1)));
		assert_eq!(report.exit_code(), 137);
		assert!(report.elapsed >= Duration::from_secs(1));
		assert!(report.elapsed < Duration::from_secs(10), "{:?}", report.elapsed);
	}

	#[test]
	fn timeout_kills_the_whole_tree() {
		let spec = sh("sleep 30 & sleep 30; wait").timeout(Duration::from_millis(300)).output(OutputPolicy::Capture);
		let report = ProcessRunner::new().run(&group(), &[], &spec).unwrap();
		assert!(matches!(report.termination, Termination::TimedOut(_)));
		// The capture threads only finish once every writer, including the background sleep, is gone.
		assert!(report.elapsed < Duration::from_secs(10));
		assert_eq!(report.stdout.as_deref(), Some(&b""[..]));
	}

	#[test]
	fn timeout_kills_group_members_that_left_the_process_group() {
		let tmp = tempfile::tempdir().unwrap();
		let procs = tmp.path().join("cgroup.procs");
		fs::write(&procs, "").unwrap();
		let script = format!("setsid sh -c 'echo $$ >> {}; exec sleep 30' & sleep 30", procs.display());
		let spec = sh(&script).timeout(Duration::from_secs(1)).output(OutputPolicy::Capture);
		let started = Instant::now();
		let report = ProcessRunner::new().run(&group(), &[procs.clone()], &spec).unwrap();
		assert!(matches!(report.termination, Termination::TimedOut(_)));
		// The escaped sleep holds the stdout pipe; capture only ends once it is killed too.
		assert!(started.elapsed() < Duration::from_secs(10), "{:?}", started.elapsed());
	}

	#[test]
	fn member_pids_skip_placeholders_and_ourselves() {
		let tmp = tempfile::tempdir().unwrap();
		let procs = tmp.path().join("cgroup.procs");
		fs::write(&procs, format!("0\n4242\nnot-a-pid\n{}\n", getpid())).unwrap();
		assert_eq!(member_pids(&procs), [Pid::from_raw(4242)]);
		assert!(member_pids(&tmp.path().join("missing")).is_empty());
	}

	#[test]
	fn supplementary_groups_are_resolved_up_front() {
		let me = Identity::current().unwrap();
		let credentials = Credentials::for_identity(&me, "/bin/true").unwrap();
		assert_eq!(credentials.uid, me.uid());
		assert!(credentials.groups.contains(&me.gid()));
	}

	struct BrokenPipe {
		sent: bool,
	}

	impl Read for BrokenPipe {
		fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
			if self.sent {
				return Err(io::Error::other("pipe went away"));
			}
			self.sent = true;
			buf[..4].copy_from_slice(b"part");
			Ok(4)
		}
	}

	#[test]
	fn read_errors_keep_what_was_captured() {
		let captured = drain(BrokenPipe { sent: false }).join().unwrap();
		assert_eq!(captured, b"part");
	}

	#[test]
	fn zero_timeout_means_no_bound() {
		let spec = sh("exit 0").timeout(Duration::ZERO);
		assert_eq!(spec.deadline(), None);
		let report = ProcessRunner::new().run(&group(), &[], &spec).unwrap();
		assert_eq!(report.termination, Termination::Exited(0));
	}

	#[test]
	fn run_as_switches_user_and_keeps_environment() {
		if !nix::unistd::geteuid().is_root() {
			return;
		}
		let Ok(nobody) = Identity::lookup("nobody") else {
			return;
		};
		std::env::set_var("CGRUN_PROBE", "visible");
		let spec = sh("id -u; echo \"$CGRUN_PROBE\"").run_as(nobody.clone()).output(OutputPolicy::Capture);
		let report = ProcessRunner::new().run(&group(), &[], &spec).unwrap();
		let stdout = String::from_utf8(report.stdout.unwrap()).unwrap();
		assert_eq!(stdout, format!("{}\nvisible\n", nobody.uid()));
	}
}
