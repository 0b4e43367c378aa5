// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Traits which allow the channel store to interact with the Bitcoin network.

use bitcoin::Transaction;

/// An interface to send a transaction to the Bitcoin network.
///
/// Submission is fire-and-forget: implementations are responsible for any retry or rebroadcast
/// policy, and no confirmation feedback flows back to the caller. The channel store never blocks
/// on an implementation beyond issuing the call, so implementations should hand the transaction
/// off rather than wait on network I/O.
pub trait BroadcasterInterface: Sync + Send {
	/// Sends a transaction out to (hopefully) be mined.
	fn broadcast_transaction(&self, tx: &Transaction);
}
