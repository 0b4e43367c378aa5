// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! A source of the current time, injectable so that tests can substitute a mock clock and get
//! deterministic expiry behavior.

use core::time::Duration;
use std::time::SystemTime;

/// Provides the logical "now" used for all expiry computations.
///
/// Channel refund lock times are expressed in seconds since the UNIX epoch, so implementations
/// return the current time on the same scale. Production code uses [`SystemTimeSource`]; tests
/// substitute a manually-advanced clock.
pub trait TimeSource {
	/// Returns the duration since the UNIX epoch.
	fn now(&self) -> Duration;
}

/// A [`TimeSource`] backed by the system wall clock.
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
	fn now(&self) -> Duration {
		SystemTime::now()
			.duration_since(SystemTime::UNIX_EPOCH)
			.expect("system time before UNIX epoch")
	}
}
