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

//! The create → configure → run → delete lifecycle of one control group.
//!
//! [`Orchestrator`] drives any [`GroupDriver`]: [`LiveDriver`] performs the operations on the
//! host, [`ScriptEmitter`](crate::ScriptEmitter) writes them down. Once `create` has succeeded,
//! `delete` is attempted exactly once, whatever happens in between.

use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::backend::ResourceGroupBackend;
use crate::error::BackendError;
use crate::error::Error;
use crate::error::RunError;
use crate::error::Stage;
use crate::error::StageFailure;
use crate::identity::GroupIdentity;
use crate::limits::Controller;
use crate::limits::LimitSet;
use crate::runner::ExecutionSpec;
use crate::runner::ExitReport;
use crate::runner::ProcessRunner;

/// The four lifecycle operations, in the order the [`Orchestrator`] calls them.
pub trait GroupDriver {
	fn create(&mut self, group: &GroupIdentity, controllers: &[Controller]) -> Result<(), BackendError>;

	fn configure(&mut self, group: &GroupIdentity, controllers: &[Controller], limits: &LimitSet) -> Result<(), BackendError>;

	fn run(&mut self, group: &GroupIdentity, controllers: &[Controller], spec: &ExecutionSpec) -> Result<ExitReport, RunError>;

	fn delete(&mut self, group: &GroupIdentity, controllers: &[Controller]) -> Result<(), BackendError>;
}

impl<D: GroupDriver + ?Sized> GroupDriver for &mut D {
	fn create(&mut self, group: &GroupIdentity, controllers: &[Controller]) -> Result<(), BackendError> {
		(**self).create(group, controllers)
	}

	fn configure(&mut self, group: &GroupIdentity, controllers: &[Controller], limits: &LimitSet) -> Result<(), BackendError> {
		(**self).configure(group, controllers, limits)
	}

	fn run(&mut self, group: &GroupIdentity, controllers: &[Controller], spec: &ExecutionSpec) -> Result<ExitReport, RunError> {
		(**self).run(group, controllers, spec)
	}

	fn delete(&mut self, group: &GroupIdentity, controllers: &[Controller]) -> Result<(), BackendError> {
		(**self).delete(group, controllers)
	}
}

/// Performs the lifecycle on the host: group operations through a backend, the command through a
/// [`ProcessRunner`] that spawns it straight into the group.
#[derive(Debug)]
pub struct LiveDriver<B> {
	backend: B,
	runner: ProcessRunner,
}

impl<B: ResourceGroupBackend> LiveDriver<B> {
	pub fn new(backend: B) -> Self {
		Self {
			backend,
			runner: ProcessRunner::new(),
		}
	}

	pub fn backend(&self) -> &B {
		&self.backend
	}
}

impl<B: ResourceGroupBackend> GroupDriver for LiveDriver<B> {
	fn create(&mut self, group: &GroupIdentity, controllers: &[Controller]) -> Result<(), BackendError> {
		self.backend.create(group, controllers)
	}

	fn configure(&mut self, group: &GroupIdentity, controllers: &[Controller], limits: &LimitSet) -> Result<(), BackendError> {
		self.backend.configure(group, controllers, limits)
	}

	fn run(&mut self, group: &GroupIdentity, controllers: &[Controller], spec: &ExecutionSpec) -> Result<ExitReport, RunError> {
		let targets = self.backend.attach_targets(group, controllers);
		self.runner.run(group, &targets, spec)
	}

	fn delete(&mut self, group: &GroupIdentity, controllers: &[Controller]) -> Result<(), BackendError> {
		self.backend.delete(group, controllers)
	}
}

/// Everything one invocation needs. Built by [`Invocation::into_plan`](crate::Invocation::into_plan).
#[derive(Debug, Clone)]
pub struct Plan {
	pub group: GroupIdentity,
	pub controllers: Vec<Controller>,
	pub limits: LimitSet,
	pub exec: ExecutionSpec,
}

impl Plan {
	pub fn new(group: GroupIdentity, limits: LimitSet, exec: ExecutionSpec) -> Self {
		Self {
			group,
			controllers: limits.controllers(),
			limits,
			exec,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
	Absent,
	Created,
	/// Created, but the limits could not be applied. Cleanup is still pending.
	ConfigureFailed,
	Configured,
	Running,
	Ran,
	TornDown,
	/// Cleanup ran and failed.
	TornDownDegraded,
}

fn advance(state: &mut GroupState, next: GroupState) {
	debug!(from = ?*state, to = ?next, "group state");
	*state = next;
}

/// What happened to one group: the outcome of create/configure/run, and the cleanup failure if
/// there was one.
#[derive(Debug)]
pub struct Report {
	pub state: GroupState,
	pub outcome: Result<ExitReport, StageFailure>,
	pub cleanup: Option<StageFailure>,
}

impl Report {
	/// The status to exit with. A failing command wins over a failing cleanup.
	pub fn exit_code(&self) -> i32 {
		match &self.outcome {
			Err(failure) => failure.exit_code(),
			Ok(report) if report.exit_code() != 0 => report.exit_code(),
			Ok(_) if self.cleanup.is_some() => 1,
			Ok(_) => 0,
		}
	}

	pub fn failures(&self) -> impl Iterator<Item = &StageFailure> {
		self.outcome.as_ref().err().into_iter().chain(self.cleanup.as_ref())
	}

	pub fn into_result(self) -> Result<ExitReport, Error> {
		match (self.outcome, self.cleanup) {
			(Ok(report), None) => Ok(report),
			(Err(failure), None) => Err(Error::Stage(failure)),
			(primary, Some(cleanup)) => Err(Error::Compound { primary, cleanup }),
		}
	}
}

/// Deletes the group when dropped, unless [`release`](Self::release) already did.
struct GroupScope<'a, D: GroupDriver> {
	driver: &'a mut D,
	group: &'a GroupIdentity,
	controllers: &'a [Controller],
	released: bool,
}

impl<'a, D: GroupDriver> GroupScope<'a, D> {
	fn new(driver: &'a mut D, group: &'a GroupIdentity, controllers: &'a [Controller]) -> Self {
		Self {
			driver,
			group,
			controllers,
			released: false,
		}
	}

	fn driver(&mut self) -> &mut D {
		self.driver
	}

	fn release(mut self) -> Result<(), BackendError> {
		self.released = true;
		self.driver.delete(self.group, self.controllers)
	}
}

impl<D: GroupDriver> Drop for GroupScope<'_, D> {
	fn drop(&mut self) {
		if self.released {
			return;
		}
		warn!(group = %self.group.path, "unwinding with a live control group, deleting it");
		if let Err(e) = self.driver.delete(self.group, self.controllers) {
			error!(group = %self.group.path, error = %e, "cleanup failed");
		}
	}
}

/// Runs [`Plan`]s through a driver, tracking the group's [`GroupState`].
pub struct Orchestrator<D> {
	driver: D,
	state: GroupState,
}

impl<D: GroupDriver> Orchestrator<D> {
	pub fn new(driver: D) -> Self {
		Self {
			driver,
			state: GroupState::Absent,
		}
	}

	pub fn state(&self) -> GroupState {
		self.state
	}

	pub fn into_driver(self) -> D {
		self.driver
	}

	pub fn execute(&mut self, plan: &Plan) -> Report {
		let group = &plan.group;
		let controllers = plan.controllers.as_slice();
		self.state = GroupState::Absent;

		let names: Vec<&str> = controllers.iter().map(Controller::as_str).collect();
		info!(group = %group.path, controllers = ?names, "creating control group");
		if let Err(e) = self.driver.create(group, controllers) {
			let failure = StageFailure::new(Stage::Create, e);
			error!(%failure);
			return Report {
				state: self.state,
				outcome: Err(failure),
				cleanup: None,
			};
		}
		advance(&mut self.state, GroupState::Created);

		let mut scope = GroupScope::new(&mut self.driver, group, controllers);
		let outcome = match scope.driver().configure(group, controllers, &plan.limits) {
			Err(e) => {
				advance(&mut self.state, GroupState::ConfigureFailed);
				Err(StageFailure::new(Stage::Configure, e))
			}
			Ok(()) => {
				advance(&mut self.state, GroupState::Configured);
				advance(&mut self.state, GroupState::Running);
				let ran = scope.driver().run(group, controllers, &plan.exec);
				advance(&mut self.state, GroupState::Ran);
				ran.map_err(|e| StageFailure::new(Stage::Run, e))
			}
		};
		match &outcome {
			Ok(report) => info!(group = %group.path, termination = %report.termination, "command finished"),
			Err(failure) => error!(%failure),
		}

		let cleanup = scope.release().err().map(|e| StageFailure::new(Stage::Delete, e));
		match &cleanup {
			None => advance(&mut self.state, GroupState::TornDown),
			Some(failure) => {
				error!(%failure);
				advance(&mut self.state, GroupState::TornDownDegraded);
			}
		}
		Report {
			state: self.state,
			outcome,
			cleanup,
		}
	}
}
