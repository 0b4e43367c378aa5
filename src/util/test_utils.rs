// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Test implementations of the collaborator traits.

use crate::chain::chaininterface;
use crate::util::logger::{Level, Logger, Record};
use crate::util::time::TimeSource;
use crate::wallet::ExtensionHost;

use bitcoin::Transaction;

use core::time::Duration;
use std::collections::HashMap;
use std::sync::Mutex;

/// A [`chaininterface::BroadcasterInterface`] which records every transaction handed to it.
pub struct TestBroadcaster {
	/// Every transaction broadcast so far, in submission order.
	pub txn_broadcasted: Mutex<Vec<Transaction>>,
}

impl TestBroadcaster {
	/// Creates a broadcaster which has seen no transactions.
	pub fn new() -> TestBroadcaster {
		TestBroadcaster { txn_broadcasted: Mutex::new(Vec::new()) }
	}
}

impl chaininterface::BroadcasterInterface for TestBroadcaster {
	fn broadcast_transaction(&self, tx: &Transaction) {
		self.txn_broadcasted.lock().unwrap().push(tx.clone());
	}
}

/// An [`ExtensionHost`] which counts change notifications per extension id.
pub struct TestWallet {
	/// The extension ids of every notification received, in order.
	pub notifications: Mutex<Vec<String>>,
}

impl TestWallet {
	/// Creates a wallet which has seen no notifications.
	pub fn new() -> TestWallet {
		TestWallet { notifications: Mutex::new(Vec::new()) }
	}

	/// Returns the number of change notifications received so far.
	pub fn notification_count(&self) -> usize {
		self.notifications.lock().unwrap().len()
	}
}

impl ExtensionHost for TestWallet {
	fn extension_changed(&self, extension_id: &str) {
		self.notifications.lock().unwrap().push(extension_id.to_owned());
	}
}

/// A manually-advanced [`TimeSource`].
pub struct TestTime {
	now: Mutex<Duration>,
}

impl TestTime {
	/// Creates a clock frozen at `start` seconds past the UNIX epoch.
	pub fn new(start: Duration) -> TestTime {
		TestTime { now: Mutex::new(start) }
	}

	/// Moves the clock forward by `duration`.
	pub fn advance(&self, duration: Duration) {
		*self.now.lock().unwrap() += duration;
	}
}

impl TimeSource for TestTime {
	fn now(&self) -> Duration {
		*self.now.lock().unwrap()
	}
}

/// A [`Logger`] which records every line logged for later assertion.
pub struct TestLogger {
	level: Level,
	id: String,
	/// Count of logged lines keyed by (module path, message).
	pub lines: Mutex<HashMap<(String, String), usize>>,
}

impl TestLogger {
	/// Creates a logger with an empty id printing everything.
	pub fn new() -> TestLogger {
		Self::with_id("".to_owned())
	}

	/// Creates a logger whose console output is tagged with `id`.
	pub fn with_id(id: String) -> TestLogger {
		TestLogger { level: Level::Trace, id, lines: Mutex::new(HashMap::new()) }
	}

	/// Raises the minimum level printed to the console. All lines are recorded regardless.
	pub fn enable(&mut self, level: Level) {
		self.level = level;
	}

	/// Asserts that a line exactly matching `line` was logged `count` times from `module`.
	pub fn assert_log(&self, module: String, line: String, count: usize) {
		let log_entries = self.lines.lock().unwrap();
		assert_eq!(log_entries.get(&(module, line)), Some(&count));
	}

	/// Search for the number of occurrences of the logged lines which
	/// 1. belong to the specified module and
	/// 2. contain `line` in them.
	/// And asserts if the number of occurrences is the same with the given `count`
	pub fn assert_log_contains(&self, module: String, line: String, count: usize) {
		let log_entries = self.lines.lock().unwrap();
		let l: usize = log_entries
			.iter()
			.filter(|&(&(ref m, ref l), _c)| m == &module && l.contains(line.as_str()))
			.map(|(_, c)| c)
			.sum();
		assert_eq!(l, count)
	}

	/// Search for the number of occurrences of logged lines which
	/// 1. belong to the specified module and
	/// 2. match the given regex pattern.
	/// Assert that the number of occurrences equals the given `count`
	pub fn assert_log_regex(&self, module: String, pattern: regex::Regex, count: usize) {
		let log_entries = self.lines.lock().unwrap();
		let l: usize = log_entries
			.iter()
			.filter(|&(&(ref m, ref l), _c)| m == &module && pattern.is_match(l))
			.map(|(_, c)| c)
			.sum();
		assert_eq!(l, count)
	}
}

impl Logger for TestLogger {
	fn log(&self, record: &Record) {
		*self
			.lines
			.lock()
			.unwrap()
			.entry((record.module_path.to_string(), format!("{}", record.args)))
			.or_insert(0) += 1;
		if record.level >= self.level {
			println!(
				"{:<5} {} [{} : {}, {}] {}",
				record.level.to_string(),
				self.id,
				record.module_path,
				record.file,
				record.line,
				record.args
			);
		}
	}
}
