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

//! Resource limits, grouped by controller.
//!
//! Limits come from two places: an INI-style limits file, parsed into a [`LimitTable`], and inline
//! `<controller>.<key>=<value>` tokens. [`LimitSetBuilder`] merges them (inline tokens last, so
//! they win) into an immutable [`LimitSet`].

use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::error::ConfigError;

/// Controller that is added when a timeout is requested.
pub const ACCOUNTING_CONTROLLER: &str = "cpuacct";

/// Name of a resource controller, such as `cpu` or `memory`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Controller(String);

impl Controller {
	pub fn new(name: &str) -> Result<Self, ConfigError> {
		if name.is_empty() {
			return Err(ConfigError::InvalidName {
				name: name.to_string(),
				reason: "controller name is empty",
			});
		}
		if !name.chars().all(|c| matches!(c, '_' | 'a'..='z' | '0'..='9')) {
			return Err(ConfigError::InvalidName {
				name: name.to_string(),
				reason: "controller names may only contain a-z, 0-9 and _",
			});
		}
		Ok(Self(name.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for Controller {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl AsRef<str> for Controller {
	fn as_ref(&self) -> &str {
		&self.0
	}
}

/// Checks a limit key. Keys name a file inside the group directory, so anything that could
/// escape it is refused.
fn check_key(key: &str) -> Result<(), ConfigError> {
	let reason = if key.is_empty() {
		"limit key is empty"
	} else if key.contains('/') || key.contains("..") {
		"limit key may not contain '/' or '..'"
	} else if key.chars().any(char::is_whitespace) {
		"limit key may not contain whitespace"
	} else {
		return Ok(());
	};
	Err(ConfigError::InvalidName {
		name: key.to_string(),
		reason,
	})
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limit {
	pub key: String,
	pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Section {
	controller: Controller,
	limits: Vec<Limit>,
}

/// The validated set of limits for one invocation.
///
/// Iteration order is the write order: controllers in the order they first appeared, then keys
/// in the order they were authored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimitSet {
	sections: Vec<Section>,
}

impl LimitSet {
	pub fn builder() -> LimitSetBuilder {
		LimitSetBuilder::default()
	}

	pub fn controllers(&self) -> Vec<Controller> {
		self.sections.iter().map(|s| s.controller.clone()).collect()
	}

	pub fn get(&self, controller: &str, key: &str) -> Option<&str> {
		self.sections
			.iter()
			.find(|s| s.controller.as_str() == controller)?
			.limits
			.iter()
			.find(|l| l.key == key)
			.map(|l| l.value.as_str())
	}

	pub fn iter(&self) -> impl Iterator<Item = (&Controller, &Limit)> {
		self.sections
			.iter()
			.flat_map(|s| s.limits.iter().map(move |l| (&s.controller, l)))
	}

	/// Number of key/value limits, not counting controllers without any.
	pub fn len(&self) -> usize {
		self.sections.iter().map(|s| s.limits.len()).sum()
	}

	/// True when there is nothing to write, even if some controllers were required.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// Splits an inline `<controller>.<key>=<value>` token.
///
/// # Examples
///
/// ```
/// use cgrun::limits::parse_inline;
///
/// let (controller, limit) = parse_inline("memory.limit_in_bytes=1M").unwrap();
/// assert_eq!(controller.as_str(), "memory");
/// assert_eq!(limit.key, "limit_in_bytes");
/// assert_eq!(limit.value, "1M");
/// assert!(parse_inline("memory.memsw.limit_in_bytes=1M").is_err());
/// ```
pub fn parse_inline(token: &str) -> Result<(Controller, Limit), ConfigError> {
	let malformed = || ConfigError::MalformedToken(token.to_string());
	let mut kv = token.split('=');
	let (Some(lhs), Some(value), None) = (kv.next(), kv.next(), kv.next()) else {
		return Err(malformed());
	};
	let mut ck = lhs.split('.');
	let (Some(controller), Some(key), None) = (ck.next(), ck.next(), ck.next()) else {
		return Err(malformed());
	};
	if controller.is_empty() || key.is_empty() {
		return Err(malformed());
	}
	let controller = Controller::new(controller)?;
	let key = key.to_ascii_lowercase();
	check_key(&key)?;
	Ok((
		controller,
		Limit {
			key,
			value: value.to_string(),
		},
	))
}

/// Limits as read from an INI-style limits file:
///
/// ```text
/// [cpu]
/// shares = 500
/// [memory]
/// limit_in_bytes = 1M
/// ```
///
/// `key: value` is accepted as well as `key = value`, lines starting with `#` or `;` are comments,
/// and keys are lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimitTable {
	sections: Vec<(String, Vec<(String, String)>)>,
}

impl LimitTable {
	pub fn parse(text: &str) -> Result<Self, ConfigError> {
		let mut table = Self::default();
		let mut current: Option<usize> = None;
		for (idx, raw) in text.lines().enumerate() {
			let line_no = idx + 1;
			let syntax = |reason: &str| ConfigError::LimitsSyntax {
				line: line_no,
				reason: reason.to_string(),
			};
			let line = raw.trim();
			if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
				continue;
			}
			if let Some(rest) = line.strip_prefix('[') {
				let name = rest.strip_suffix(']').ok_or_else(|| syntax("unterminated section header"))?.trim();
				Controller::new(name).map_err(|e| syntax(&e.to_string()))?;
				current = Some(match table.sections.iter().position(|(n, _)| n == name) {
					Some(pos) => pos,
					None => {
						table.sections.push((name.to_string(), Vec::new()));
						table.sections.len() - 1
					}
				});
				continue;
			}
			let Some(split) = line.find(['=', ':']) else {
				return Err(syntax("expected `key = value`"));
			};
			let Some(section) = current else {
				return Err(syntax("entry outside of a [controller] section"));
			};
			let key = line[..split].trim().to_ascii_lowercase();
			let value = line[split + 1..].trim().to_string();
			check_key(&key).map_err(|e| syntax(&e.to_string()))?;
			let entries = &mut table.sections[section].1;
			match entries.iter_mut().find(|(k, _)| *k == key) {
				Some(entry) => entry.1 = value,
				None => entries.push((key, value)),
			}
		}
		Ok(table)
	}

	pub fn sections(&self) -> impl Iterator<Item = (&str, &[(String, String)])> {
		self.sections.iter().map(|(name, entries)| (name.as_str(), entries.as_slice()))
	}
}

impl FromStr for LimitTable {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse(s)
	}
}

/// Merges limits tables and inline tokens into a [`LimitSet`].
#[derive(Debug, Default)]
pub struct LimitSetBuilder {
	sections: Vec<Section>,
	poisoned: bool,
}

impl LimitSetBuilder {
	fn insert(&mut self, controller: Controller, limit: Limit) {
		let section = match self.sections.iter().position(|s| s.controller == controller) {
			Some(pos) => &mut self.sections[pos],
			None => {
				self.sections.push(Section {
					controller,
					limits: Vec::new(),
				});
				let last = self.sections.len() - 1;
				&mut self.sections[last]
			}
		};
		debug!(controller = %section.controller, key = %limit.key, value = %limit.value, "limit");
		match section.limits.iter_mut().find(|l| l.key == limit.key) {
			Some(existing) => existing.value = limit.value,
			None => section.limits.push(limit),
		}
	}

	/// Adds every entry of a parsed limits file. Sections without entries are ignored.
	///
	/// The table is validated as a whole first, so an invalid entry leaves the builder untouched.
	pub fn table(&mut self, table: &LimitTable) -> Result<&mut Self, ConfigError> {
		let mut checked = Vec::new();
		for (name, entries) in table.sections() {
			let controller = Controller::new(name)?;
			for (key, value) in entries {
				check_key(key)?;
				checked.push((
					controller.clone(),
					Limit {
						key: key.clone(),
						value: value.clone(),
					},
				));
			}
		}
		for (controller, limit) in checked {
			self.insert(controller, limit);
		}
		Ok(self)
	}

	/// Adds one inline `<controller>.<key>=<value>` token. A malformed token is returned as an
	/// error and leaves the builder untouched.
	pub fn inline(&mut self, token: &str) -> Result<&mut Self, ConfigError> {
		let (controller, limit) = parse_inline(token)?;
		self.insert(controller, limit);
		Ok(self)
	}

	/// Makes sure `controller` is part of the group even if it has no limits.
	pub fn require(&mut self, controller: &str) -> Result<&mut Self, ConfigError> {
		let controller = Controller::new(controller)?;
		if !self.sections.iter().any(|s| s.controller == controller) {
			self.sections.push(Section {
				controller,
				limits: Vec::new(),
			});
		}
		Ok(self)
	}

	/// Discards everything: a limits file that failed to load must not be applied partially.
	pub fn poison(&mut self) -> &mut Self {
		self.poisoned = true;
		self.sections.clear();
		self
	}

	pub fn build(self) -> Result<LimitSet, ConfigError> {
		if self.poisoned || self.sections.is_empty() {
			return Err(ConfigError::NoLimits);
		}
		Ok(LimitSet {
			sections: self.sections,
		})
	}
}
