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

use cgrun::backend;
use cgrun::error::Error;
use cgrun::logging;
use cgrun::logging::LoggerConfig;
use cgrun::runner::OutputPolicy;
use cgrun::runner::Termination;
use cgrun::CgroupFs;
use cgrun::Hierarchy;
use cgrun::Invocation;
use cgrun::LiveDriver;
use cgrun::Orchestrator;
use cgrun::Plan;
use cgrun::ScriptEmitter;
use clap::ArgAction;
use clap::Parser;
use clap::ValueEnum;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::io::Write;
use std::path::PathBuf;
use std::process;

#[derive(Parser, Debug)]
#[command(
	version,
	about = "Runs a command inside a throwaway, resource-limited control group",
	after_help = "Limits can also be given inline as -c.<controller>.<key>=<value>, such as \"-c.memory.max=512M\"."
)]
struct Cli {
	/// Path of the control group, relative to the hierarchy root. Defaults to "cgrun/task_<pid>".
	#[arg(short = 'p', long = "path")]
	path: Option<String>,

	/// INI file of limits, with [controller] sections and key = value entries. May be repeated; later files win.
	#[arg(short = 'c', long = "config", value_name = "FILE")]
	config: Vec<PathBuf>,

	/// Run the command as this user, given by name or uid.
	#[arg(short = 'r', long = "run-as", value_name = "USER")]
	run_as: Option<String>,

	/// Kill the command and everything it started after this many seconds.
	#[arg(short = 't', long = "timeout", value_name = "SECS")]
	timeout: Option<u64>,

	/// Mount point of the cgroup filesystem.
	#[arg(long, env = "CGRUN_CGROUP_ROOT", value_name = "DIR", default_value = backend::DEFAULT_ROOT)]
	cgroup_root: PathBuf,

	#[arg(long, value_enum, default_value_t = HierarchyArg::Auto)]
	hierarchy: HierarchyArg,

	/// Collect the command's output and print it once the group is gone.
	#[arg(long)]
	capture: bool,

	/// Print the equivalent libcgroup script instead of running anything.
	#[arg(long, conflicts_with = "emit_run")]
	emit: bool,

	/// Run the equivalent libcgroup script as one shell batch.
	#[arg(long)]
	emit_run: bool,

	/// Feed this file to the batch's stdin.
	#[arg(long, requires = "emit_run", value_name = "FILE")]
	batch_input: Option<PathBuf>,

	/// More diagnostics on stderr. Repeat for more.
	#[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
	verbose: u8,

	/// `<controller>.<key>=<value>` tokens lifted out of argv before parsing.
	#[arg(skip)]
	inline: Vec<String>,

	/// The command to run, after "--".
	#[arg(last = true, value_name = "CMD")]
	cmd: Vec<OsString>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum HierarchyArg {
	Auto,
	/// cgroups v2
	Unified,
	/// cgroups v1
	Legacy,
}

/// Splits `-c.<controller>.<key>=<value>` tokens off the arguments before "--".
fn lift_inline_limits<I, T>(args: I) -> (Vec<OsString>, Vec<String>)
where
	I: IntoIterator<Item = T>,
	T: Into<OsString>,
{
	let raw = clap_lex::RawArgs::new(args);
	let mut cursor = raw.cursor();
	let mut kept = Vec::new();
	let mut inline = Vec::new();
	while let Some(arg) = raw.next(&mut cursor) {
		if arg.is_escape() {
			kept.push(arg.to_value_os().to_owned());
			kept.extend(raw.remaining(&mut cursor).map(|a| a.to_owned()));
			break;
		}
		if let Some(mut shorts) = arg.to_short() {
			if let Some(Ok('c')) = shorts.next_flag() {
				let token = shorts.next_value_os().and_then(|rest| rest.to_str()).and_then(|rest| rest.strip_prefix('.'));
				if let Some(token) = token {
					inline.push(token.to_string());
					continue;
				}
			}
		}
		kept.push(arg.to_value_os().to_owned());
	}
	(kept, inline)
}

impl Cli {
	fn parse_args<I, T>(args: I) -> Result<Self, clap::Error>
	where
		I: IntoIterator<Item = T>,
		T: Into<OsString>,
	{
		let (kept, inline) = lift_inline_limits(args);
		let mut cli = Self::try_parse_from(kept)?;
		cli.inline = inline;
		Ok(cli)
	}

	fn invocation(&mut self) -> Invocation {
		Invocation {
			group_path: self.path.take(),
			limit_files: std::mem::take(&mut self.config),
			inline_limits: std::mem::take(&mut self.inline),
			run_as: self.run_as.take(),
			timeout_secs: self.timeout,
			command: std::mem::take(&mut self.cmd),
			output: if self.capture { OutputPolicy::Capture } else { OutputPolicy::Inherit },
		}
	}

	fn backend(&self) -> Result<CgroupFs, cgrun::error::BackendError> {
		match self.hierarchy {
			HierarchyArg::Auto => CgroupFs::detect(&self.cgroup_root),
			HierarchyArg::Unified => Ok(CgroupFs::new(&self.cgroup_root, Hierarchy::Unified)),
			HierarchyArg::Legacy => Ok(CgroupFs::new(&self.cgroup_root, Hierarchy::Legacy)),
		}
	}
}

fn emit(cli: &Cli, plan: &Plan) -> i32 {
	let mut orchestrator = Orchestrator::new(ScriptEmitter::new());
	let report = orchestrator.execute(plan);
	if report.failures().next().is_some() {
		for failure in report.failures() {
			eprintln!("cgrun: {failure}");
		}
		return report.exit_code();
	}
	let script = orchestrator.into_driver().finish();
	if !cli.emit_run {
		print!("{script}");
		return 0;
	}

	let input = match &cli.batch_input {
		Some(path) => match fs::read(path) {
			Ok(input) => input,
			Err(e) => {
				eprintln!("cgrun: cannot read {}: {e}", path.display());
				return 1;
			}
		},
		None => Vec::new(),
	};
	match script.execute(&input) {
		Ok(output) => {
			forward(&output.stdout, &output.stderr);
			output.code
		}
		Err(e) => {
			eprintln!("cgrun: cannot run script: {e}");
			1
		}
	}
}

fn forward(stdout: &[u8], stderr: &[u8]) {
	// Nowhere left to report a broken pipe.
	let _ = io::stdout().write_all(stdout);
	let _ = io::stderr().write_all(stderr);
}

fn run(mut cli: Cli) -> i32 {
	let plan = match cli.invocation().into_plan() {
		Ok(plan) => plan,
		Err(e) => {
			eprintln!("cgrun: {}", Error::Config(e));
			return 1;
		}
	};
	if cli.emit || cli.emit_run {
		return emit(&cli, &plan);
	}

	let backend = match cli.backend() {
		Ok(backend) => backend,
		Err(e) => {
			eprintln!("cgrun: create failed: {e}");
			return 1;
		}
	};
	let report = Orchestrator::new(LiveDriver::new(backend)).execute(&plan);
	if let Ok(exit) = &report.outcome {
		if let (Some(stdout), Some(stderr)) = (&exit.stdout, &exit.stderr) {
			forward(stdout, stderr);
		}
		if matches!(exit.termination, Termination::TimedOut(_)) {
			eprintln!("cgrun: command {}", exit.termination);
		}
	}
	for failure in report.failures() {
		eprintln!("cgrun: {failure}");
	}
	report.exit_code()
}

fn main() {
	let cli = match Cli::parse_args(std::env::args_os()) {
		Ok(cli) => cli,
		Err(e) => e.exit(),
	};
	if let Err(e) = logging::init(&LoggerConfig::default().verbosity(cli.verbose)) {
		eprintln!("cgrun: {e}");
	}
	process::exit(run(cli))
}

#[cfg(test)]
fn cli(input: &str) -> Result<Cli, String> {
	Cli::parse_args(shlex::split(input).unwrap()).map_err(|e| format!("{e}"))
}

#[test]
fn test_inline_limits() {
	let args = cli("cgrun -c.cpu.shares=500 -c.memory.limit_in_bytes=1000000 -- /bin/true").unwrap();
	assert_eq!(args.inline, ["cpu.shares=500", "memory.limit_in_bytes=1000000"]);
	assert_eq!(args.cmd, ["/bin/true"]);
	assert!(args.config.is_empty());

	insta::assert_debug_snapshot!(lift_inline_limits(["cgrun", "-c", "a.ini", "-c.pids.max=5", "--", "sh", "-c.x.y=1"]), @r###"
	(
	    [
	        "cgrun",
	        "-c",
	        "a.ini",
	        "--",
	        "sh",
	        "-c.x.y=1",
	    ],
	    [
	        "pids.max=5",
	    ],
	)
	"###);
}

#[test]
fn test_cli() {
	let args = cli("cgrun -c limits.ini -cother.ini -c.cpu.shares=5 -t 10 -r nobody -p jobs/one -vv -- sh -c 'echo hi'").unwrap();
	assert_eq!(args.config, [PathBuf::from("limits.ini"), PathBuf::from("other.ini")]);
	assert_eq!(args.inline, ["cpu.shares=5"]);
	assert_eq!(args.timeout, Some(10));
	assert_eq!(args.run_as.as_deref(), Some("nobody"));
	assert_eq!(args.path.as_deref(), Some("jobs/one"));
	assert_eq!(args.verbose, 2);
	assert_eq!(args.cmd, ["sh", "-c", "echo hi"]);
	assert_eq!(args.hierarchy, HierarchyArg::Auto);

	let args = cli("cgrun --hierarchy legacy --cgroup-root /tmp/cg --capture").unwrap();
	assert_eq!(args.hierarchy, HierarchyArg::Legacy);
	assert_eq!(args.cgroup_root, PathBuf::from("/tmp/cg"));
	assert!(args.capture);
	assert!(args.cmd.is_empty());

	assert!(cli("cgrun --emit --emit-run").is_err());
	assert!(cli("cgrun --batch-input in.txt").is_err());
	assert!(cli("cgrun --emit-run --batch-input in.txt").is_ok());
	assert!(cli("cgrun -t soon").is_err());
	assert!(cli("cgrun --hierarchy v3").is_err());
	assert!(cli("cgrun /bin/true").is_err());
}

#[test]
fn test_run_without_limits() {
	assert_eq!(run(cli("cgrun -- /bin/true").unwrap()), 1);
}

#[test]
fn test_emit() {
	assert_eq!(run(cli("cgrun --emit -c.cpu.shares=500 -p jobs/one -- /bin/true").unwrap()), 0);
}

#[test]
fn test_unavailable_hierarchy() {
	let root = tempfile::tempdir().unwrap();
	let input = format!("cgrun --cgroup-root {} -c.cpu.weight=50 -- /bin/true", root.path().join("missing").display());
	assert_eq!(run(cli(&input).unwrap()), 1);
}
