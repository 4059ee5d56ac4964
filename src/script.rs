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

//! Writes the lifecycle down as a libcgroup shell script instead of performing it.

use std::borrow::Cow;
use std::fmt;
use std::io;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::process::Command;
use std::process::Stdio;
use std::thread;

use tracing::debug;

use crate::error::BackendError;
use crate::error::RunError;
use crate::identity::GroupIdentity;
use crate::identity::Identity;
use crate::limits::Controller;
use crate::limits::LimitSet;
use crate::orchestrator::GroupDriver;
use crate::runner::ExecutionSpec;
use crate::runner::ExitReport;
use crate::runner::Termination;

/// Characters that never need quoting, which keeps `cpu.shares=500` readable.
fn is_bare(token: &str) -> bool {
	!token.is_empty()
		&& token.bytes().all(|b| b.is_ascii_alphanumeric() || b",._+:@%/=-".contains(&b))
}

fn quote(token: &str) -> io::Result<Cow<'_, str>> {
	if is_bare(token) {
		return Ok(Cow::Borrowed(token));
	}
	shlex::try_quote(token).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn quote_line<S: AsRef<str>>(tokens: &[S]) -> io::Result<String> {
	let quoted = tokens.iter().map(|t| quote(t.as_ref())).collect::<io::Result<Vec<_>>>()?;
	Ok(quoted.join(" "))
}

/// `cpu,memory:cgrun/task_42`
fn group_arg(group: &GroupIdentity, controllers: &[Controller]) -> String {
	let names: Vec<&str> = controllers.iter().map(Controller::as_str).collect();
	format!("{}:{}", names.join(","), group.path)
}

fn account(identity: &Identity) -> String {
	format!("{}:{}", identity.name(), identity.group_name())
}

/// A rendered lifecycle, one command per line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
	lines: Vec<String>,
}

/// Result of running a [`Script`] as one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutput {
	pub code: i32,
	pub stdout: Vec<u8>,
	pub stderr: Vec<u8>,
}

impl Script {
	pub fn lines(&self) -> &[String] {
		&self.lines
	}

	pub fn render(&self) -> String {
		let mut out = String::new();
		for line in &self.lines {
			out.push_str(line);
			out.push('\n');
		}
		out
	}

	/// Runs the whole script with `sh -c`, feeding `input` to its stdin.
	pub fn execute(&self, input: &[u8]) -> io::Result<BatchOutput> {
		let script = self.render();
		debug!(lines = self.lines.len(), "executing script");
		let mut child = Command::new("/bin/sh")
			.arg("-c")
			.arg(&script)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.spawn()?;

		let stdin = child.stdin.take();
		let input = input.to_vec();
		let feeder = thread::spawn(move || -> io::Result<()> {
			if let Some(mut stdin) = stdin {
				match stdin.write_all(&input) {
					Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
					other => other?,
				}
			}
			Ok(())
		});
		let output = child.wait_with_output()?;
		feeder.join().map_err(|_| io::Error::other("stdin feeder panicked"))??;

		let code = match output.status.code() {
			Some(code) => code,
			None => 128 + output.status.signal().unwrap_or(0),
		};
		Ok(BatchOutput {
			code,
			stdout: output.stdout,
			stderr: output.stderr,
		})
	}
}

impl fmt::Display for Script {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.render())
	}
}

/// A [`GroupDriver`] that appends a libcgroup command for every operation.
#[derive(Debug, Default)]
pub struct ScriptEmitter {
	script: Script,
}

impl ScriptEmitter {
	pub fn new() -> Self {
		Self::default()
	}

	/// The finished script. It exits with the command's status, or 1 when only the cleanup failed.
	pub fn finish(mut self) -> Script {
		if !self.script.lines.is_empty() {
			self.script.lines.insert(0, "status=0".to_string());
			self.script.lines.push("exit \"$status\"".to_string());
		}
		self.script
	}

	fn push(&mut self, line: String) {
		debug!(%line, "emit");
		self.script.lines.push(line);
	}
}

fn quoting_failed(group: &GroupIdentity, source: io::Error) -> BackendError {
	BackendError::Io {
		path: group.path.as_path().to_path_buf(),
		source,
	}
}

impl GroupDriver for ScriptEmitter {
	fn create(&mut self, group: &GroupIdentity, controllers: &[Controller]) -> Result<(), BackendError> {
		let line = quote_line(&[
			"cgcreate".to_string(),
			"-t".to_string(),
			account(&group.task),
			"-a".to_string(),
			account(&group.owner),
			"-g".to_string(),
			group_arg(group, controllers),
		])
		.map_err(|e| quoting_failed(group, e))?;
		self.push(line);
		Ok(())
	}

	fn configure(&mut self, group: &GroupIdentity, _controllers: &[Controller], limits: &LimitSet) -> Result<(), BackendError> {
		if limits.is_empty() {
			return Ok(());
		}
		let mut tokens = vec!["cgset".to_string()];
		for (controller, limit) in limits.iter() {
			tokens.push("-r".to_string());
			tokens.push(format!("{controller}.{}={}", limit.key, limit.value));
		}
		tokens.push(group.path.to_string());
		let line = quote_line(&tokens).map_err(|e| quoting_failed(group, e))?;
		self.push(line);
		Ok(())
	}

	fn run(&mut self, group: &GroupIdentity, controllers: &[Controller], spec: &ExecutionSpec) -> Result<ExitReport, RunError> {
		let Some(program) = spec.program() else {
			return Ok(ExitReport::without_output(Termination::Skipped));
		};
		let spawn_err = |source| RunError::SpawnFailed {
			program: program.to_string_lossy().into_owned(),
			source,
		};

		let mut tokens = vec!["cgexec".to_string(), "-g".to_string(), group_arg(group, controllers), "--sticky".to_string()];
		if let Some(deadline) = spec.deadline() {
			tokens.push("timeout".to_string());
			tokens.push("--signal=KILL".to_string());
			tokens.push(deadline.as_secs_f64().to_string());
		}
		let argv: Vec<String> = spec.command.iter().map(|a| a.to_string_lossy().into_owned()).collect();
		match &spec.run_as {
			Some(user) => {
				tokens.push("su".to_string());
				tokens.push(user.name().to_string());
				tokens.push("--preserve-environment".to_string());
				tokens.push("-c".to_string());
				tokens.push(quote_line(&argv).map_err(spawn_err)?);
			}
			None => tokens.extend(argv),
		}
		let line = quote_line(&tokens).map_err(spawn_err)?;
		self.push(line);
		self.push("status=$?".to_string());
		Ok(ExitReport::without_output(Termination::Deferred))
	}

	fn delete(&mut self, group: &GroupIdentity, controllers: &[Controller]) -> Result<(), BackendError> {
		let line = quote_line(&["cgdelete", "-r", "-g", group_arg(group, controllers).as_str()]).map_err(|e| quoting_failed(group, e))?;
		self.push(format!("{line} || [ \"$status\" -ne 0 ] || status=1"));
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cgroup::CGroup;
	use crate::orchestrator::GroupState;
	use crate::orchestrator::Orchestrator;
	use crate::orchestrator::Plan;
	use nix::unistd::Gid;
	use nix::unistd::Uid;
	use std::time::Duration;

	fn root() -> Identity {
		Identity::new("root", Uid::from_raw(0), Gid::from_raw(0))
	}

	fn plan(exec: ExecutionSpec) -> Plan {
		let mut builder = LimitSet::builder();
		builder.inline("cpu.shares=500").unwrap().inline("memory.limit_in_bytes=1000000").unwrap();
		let group = GroupIdentity::new(CGroup::new("cgrun/task_42").unwrap(), root(), root());
		Plan::new(group, builder.build().unwrap(), exec)
	}

	fn emit(plan: &Plan) -> Script {
		let mut orchestrator = Orchestrator::new(ScriptEmitter::new());
		let report = orchestrator.execute(plan);
		assert_eq!(report.state, GroupState::TornDown);
		assert_eq!(report.exit_code(), 0);
		orchestrator.into_driver().finish()
	}

	#[test]
	fn renders_the_whole_lifecycle() {
		let script = emit(&plan(ExecutionSpec::new(["/bin/echo", "hello world"])));
		insta::assert_snapshot!(script.render(), @r###"
		status=0
		cgcreate -t root:root -a root:root -g cpu,memory:cgrun/task_42
		cgset -r cpu.shares=500 -r memory.limit_in_bytes=1000000 cgrun/task_42
		cgexec -g cpu,memory:cgrun/task_42 --sticky /bin/echo 'hello world'
		status=$?
		cgdelete -r -g cpu,memory:cgrun/task_42 || [ "$status" -ne 0 ] || status=1
		exit "$status"
		"###);
	}

	fn commands(script: &Script) -> Vec<&str> {
		script.lines().iter().filter(|l| l.starts_with("cg")).filter_map(|l| l.split(' ').next()).collect()
	}

	#[test]
	fn operations_come_out_in_lifecycle_order() {
		let script = emit(&plan(ExecutionSpec::new(["/bin/true"])));
		assert_eq!(commands(&script), ["cgcreate", "cgset", "cgexec", "cgdelete"]);
	}

	#[test]
	fn timeout_and_user_wrap_the_command() {
		let alice = Identity::new("alice", Uid::from_raw(1000), Gid::from_raw(1000));
		let exec = ExecutionSpec::new(["/bin/echo", "hi"]).run_as(alice).timeout(Duration::from_secs(5));
		let script = emit(&plan(exec));
		assert_eq!(
			script.lines()[3],
			"cgexec -g cpu,memory:cgrun/task_42 --sticky timeout --signal=KILL 5 su alice --preserve-environment -c '/bin/echo hi'"
		);
	}

	#[test]
	fn timeout_only_group_has_no_cgset_line() {
		let mut builder = LimitSet::builder();
		builder.require(crate::limits::ACCOUNTING_CONTROLLER).unwrap();
		let group = GroupIdentity::new(CGroup::new("cgrun/task_42").unwrap(), root(), root());
		let exec = ExecutionSpec::new(["/bin/true"]).timeout(Duration::from_secs(5));
		let script = emit(&Plan::new(group, builder.build().unwrap(), exec));
		assert_eq!(commands(&script), ["cgcreate", "cgexec", "cgdelete"]);
		assert_eq!(script.lines()[2], "cgexec -g cpuacct:cgrun/task_42 --sticky timeout --signal=KILL 5 /bin/true");
	}

	#[test]
	fn empty_command_emits_no_exec_line() {
		let script = emit(&plan(ExecutionSpec::default()));
		assert_eq!(commands(&script), ["cgcreate", "cgset", "cgdelete"]);
		assert!(script.lines().iter().all(|l| !l.starts_with("status=$?")));
	}

	/// Shell functions standing in for the libcgroup tools. `cgexec` runs whatever follows
	/// `--sticky`.
	fn with_fake_tools(script: Script, cgdelete_status: i32) -> Script {
		let mut lines = vec![
			"cgcreate() { :; }".to_string(),
			"cgset() { :; }".to_string(),
			"cgexec() { while [ \"$1\" != --sticky ]; do shift; done; shift; \"$@\"; }".to_string(),
			format!("cgdelete() {{ return {cgdelete_status}; }}"),
		];
		lines.extend(script.lines);
		Script { lines }
	}

	fn batch_code(command: &[&str], cgdelete_status: i32) -> i32 {
		let script = with_fake_tools(emit(&plan(ExecutionSpec::new(command.iter().copied()))), cgdelete_status);
		script.execute(b"").unwrap().code
	}

	#[test]
	fn batch_exits_with_the_command_status() {
		assert_eq!(batch_code(&["/bin/sh", "-c", "exit 3"], 0), 3);
		assert_eq!(batch_code(&["/bin/true"], 0), 0);
	}

	#[test]
	fn failed_cleanup_shows_only_when_the_command_succeeded() {
		assert_eq!(batch_code(&["/bin/true"], 1), 1);
		assert_eq!(batch_code(&["/bin/sh", "-c", "exit 3"], 1), 3);
	}

	#[test]
	fn execute_pipes_input_and_captures_both_streams() {
		let script = Script {
			lines: vec![
				"read line".to_string(),
				"echo \"got $line\"".to_string(),
				"echo oops >&2".to_string(),
				"exit 3".to_string(),
			],
		};
		let output = script.execute(b"ping\n").unwrap();
		assert_eq!(output.code, 3);
		assert_eq!(output.stdout, b"got ping\n");
		assert_eq!(output.stderr, b"oops\n");
	}
}
