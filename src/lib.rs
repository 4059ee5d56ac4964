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

//! This package runs a command inside a throwaway control group: the group is created, given its
//! resource limits, the command is run in it, and the group is removed again, even when one of
//! the steps fails.
//!
//! Both cgroup hierarchies are supported: the unified one (cgroups v2) and the legacy
//! per-controller one (cgroups v1). Instead of touching the host, the same lifecycle can also be
//! rendered as a libcgroup shell script (`cgcreate`, `cgset`, `cgexec`, `cgdelete`).
//!
//! The `cgrun` binary is the command line front end; see `cgrun --help`.

pub mod backend;
mod cgroup;
pub mod error;
pub mod identity;
pub mod invocation;
pub mod limits;
pub mod logging;
pub mod orchestrator;
pub mod runner;
pub mod script;

pub use backend::CgroupFs;
pub use backend::Hierarchy;
pub use backend::ResourceGroupBackend;
pub use cgroup::CGroup;
pub use error::Error;
pub use invocation::Invocation;
pub use limits::LimitSet;
pub use orchestrator::GroupDriver;
pub use orchestrator::LiveDriver;
pub use orchestrator::Orchestrator;
pub use orchestrator::Plan;
pub use orchestrator::Report;
pub use runner::ExecutionSpec;
pub use runner::ProcessRunner;
pub use script::Script;
pub use script::ScriptEmitter;
