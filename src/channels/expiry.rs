// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Tracking of per-channel broadcast deadlines.
//!
//! Every stored channel is armed with a deadline derived from its refund transaction's lock
//! time. Deadlines are held in an ordered queue with a per-channel cancellation handle, so a
//! cooperative close deterministically prevents the pending broadcast from ever firing. The
//! queue itself knows nothing about the registry or the network; the store's worker thread
//! parks on it and acts on whatever falls due.

use crate::channels::store::StoredClientChannel;
use crate::util::time::TimeSource;

use bitcoin::Transaction;

use core::time::Duration;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Extra seconds past the refund lock time before we give up on a cooperative close and
/// broadcast.
pub(crate) const EXPIRY_GRACE_SECS: u64 = 60 * 5;

/// The logical time at which `refund`'s channel should be force-closed.
pub(crate) fn expiry_time(refund: &Transaction) -> u64 {
	refund.lock_time.to_consensus_u32() as u64 + EXPIRY_GRACE_SECS
}

// Queue keys order by deadline; the sequence number disambiguates equal deadlines.
type QueueKey = (u64, u64);

struct ExpiryState {
	pending: BTreeMap<QueueKey, Arc<StoredClientChannel>>,
	// Channel identity (address of the record inside its Arc) to queue key, for cancellation.
	// An entry exists here iff the same channel is in `pending`, whose Arc keeps the address
	// stable for as long as the handle lives.
	handles: HashMap<usize, QueueKey>,
	next_seq: u64,
}

/// An ordered set of armed channel deadlines plus the parking spot for the worker thread.
///
/// Lock order: this queue's mutex is a leaf; nothing else is acquired while holding it.
pub(crate) struct ExpiryQueue {
	state: Mutex<ExpiryState>,
	condvar: Condvar,
	stopped: AtomicBool,
}

fn channel_key(channel: &StoredClientChannel) -> usize {
	channel as *const StoredClientChannel as usize
}

impl ExpiryQueue {
	pub fn new() -> Self {
		Self {
			state: Mutex::new(ExpiryState {
				pending: BTreeMap::new(),
				handles: HashMap::new(),
				next_seq: 0,
			}),
			condvar: Condvar::new(),
			stopped: AtomicBool::new(false),
		}
	}

	/// Arms `channel`'s deadline. A channel which is already armed is left untouched, keeping
	/// its original deadline and a single pending entry.
	pub fn arm(&self, deadline: u64, channel: Arc<StoredClientChannel>) {
		let mut state = self.state.lock().unwrap();
		let key = channel_key(&channel);
		if state.handles.contains_key(&key) {
			return;
		}
		let seq = state.next_seq;
		state.next_seq += 1;
		state.handles.insert(key, (deadline, seq));
		state.pending.insert((deadline, seq), channel);
		// The new deadline may be earlier than whatever the worker is currently parked on.
		self.condvar.notify_all();
	}

	/// Disarms `channel`'s deadline, if armed. After this returns the channel can no longer be
	/// handed out by [`Self::pop_due`].
	pub fn cancel(&self, channel: &StoredClientChannel) {
		let mut state = self.state.lock().unwrap();
		if let Some(key) = state.handles.remove(&channel_key(channel)) {
			state.pending.remove(&key);
		}
	}

	/// Removes and returns every channel whose deadline is at or before `now`.
	pub fn pop_due(&self, now: u64) -> Vec<Arc<StoredClientChannel>> {
		let mut state = self.state.lock().unwrap();
		let mut due = Vec::new();
		while let Some(&key) = state.pending.keys().next() {
			if key.0 > now {
				break;
			}
			let channel = state.pending.remove(&key).expect("key was just observed");
			state.handles.remove(&channel_key(&channel));
			due.push(channel);
		}
		due
	}

	/// Blocks until the earliest armed deadline falls due per `time`, returning `false` once
	/// [`Self::shutdown`] has been called.
	///
	/// The wait converts the logical remainder into a real-time park, so a mock clock which is
	/// already past a deadline makes this return immediately.
	pub fn wait_until_due<TS: TimeSource + ?Sized>(&self, time: &TS) -> bool {
		let mut state = self.state.lock().unwrap();
		loop {
			if self.stopped.load(Ordering::Acquire) {
				return false;
			}
			let now = time.now().as_secs();
			match state.pending.keys().next().copied() {
				None => {
					state = self.condvar.wait(state).unwrap();
				},
				Some((deadline, _)) if deadline <= now => return true,
				Some((deadline, _)) => {
					let wait = Duration::from_secs(deadline - now);
					let (guard, _timed_out) = self.condvar.wait_timeout(state, wait).unwrap();
					state = guard;
				},
			}
		}
	}

	/// Permanently wakes the worker out of [`Self::wait_until_due`].
	pub fn shutdown(&self) {
		self.stopped.store(true, Ordering::Release);
		self.condvar.notify_all();
	}
}
