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

use nix::unistd::getegid;
use nix::unistd::geteuid;
use nix::unistd::Gid;
use nix::unistd::Group;
use nix::unistd::Uid;
use nix::unistd::User;

use crate::cgroup::CGroup;
use crate::error::ConfigError;

/// A user account: name, uid and primary gid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
	name: String,
	uid: Uid,
	gid: Gid,
}

impl Identity {
	pub fn new(name: impl Into<String>, uid: Uid, gid: Gid) -> Self {
		Self {
			name: name.into(),
			uid,
			gid,
		}
	}

	/// The effective user of this process.
	pub fn current() -> Result<Self, ConfigError> {
		let uid = geteuid();
		let user = User::from_uid(uid).map_err(|source| ConfigError::UserLookup {
			user: uid.to_string(),
			source,
		})?;
		Ok(match user {
			Some(user) => Self::new(user.name, user.uid, getegid()),
			None => Self::new(uid.to_string(), uid, getegid()),
		})
	}

	/// Looks up a user by name, or by numeric uid.
	pub fn lookup(user: &str) -> Result<Self, ConfigError> {
		let lookup_err = |source| ConfigError::UserLookup {
			user: user.to_string(),
			source,
		};
		let found = match user.parse::<u32>() {
			Ok(uid) => User::from_uid(Uid::from_raw(uid)).map_err(lookup_err)?,
			Err(_) => User::from_name(user).map_err(lookup_err)?,
		};
		let found = found.ok_or_else(|| ConfigError::UnknownUser(user.to_string()))?;
		Ok(Self::new(found.name, found.uid, found.gid))
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn uid(&self) -> Uid {
		self.uid
	}

	pub fn gid(&self) -> Gid {
		self.gid
	}

	/// Name of the primary group, or the numeric gid when it has no entry.
	pub fn group_name(&self) -> String {
		match Group::from_gid(self.gid) {
			Ok(Some(group)) => group.name,
			_ => self.gid.to_string(),
		}
	}

	/// Whether files created by this process already belong to this identity.
	pub fn is_effective(&self) -> bool {
		self.uid == geteuid() && self.gid == getegid()
	}
}

impl fmt::Display for Identity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.name)
	}
}

/// Everything the backend needs to know about the group it manages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupIdentity {
	pub path: CGroup,
	/// Owns the group directory and its control files.
	pub owner: Identity,
	/// May attach processes to the group.
	pub task: Identity,
}

impl GroupIdentity {
	pub fn new(path: CGroup, owner: Identity, task: Identity) -> Self {
		Self { path, owner, task }
	}
}
