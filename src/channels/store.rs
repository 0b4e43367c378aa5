// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! A [`ClientChannelStore`] maintains the set of [`StoredClientChannel`]s a client has open,
//! persisting them through the host wallet's extension mechanism and broadcasting the contract
//! and refund transactions of any channel which is never cooperatively closed.

use crate::chain::chaininterface::BroadcasterInterface;
use crate::channels::expiry::{self, ExpiryQueue};
use crate::channels::ChannelId;
use crate::util::errors::APIError;
use crate::util::logger::Logger;
use crate::util::ser::{
	DecodeError, FixedLengthReader, Readable, VecWriter, Writeable, Writer, MAX_BUF_SIZE,
};
use crate::util::time::TimeSource;
use crate::wallet::{ExtensionHost, WalletExtension};
use crate::{log_debug, log_info, log_trace};

use bitcoin::hash_types::Txid;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Transaction;

use core::ops::Deref;
use core::ptr;
use std::collections::HashMap;
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// The identifier under which the serialized channel set is stored by the host wallet. Stable
/// across versions; unique within the host's extension namespace.
pub const EXTENSION_ID: &str = "micropay::channels::ClientChannelStore";

const SERIALIZATION_VERSION: u8 = 1;
const MIN_SERIALIZATION_VERSION: u8 = 1;

/// The state of a channel once it has been opened, in a form that can be stored and used to
/// resume the channel after an interruption (e.g. a connection failure) or to broadcast its
/// refund transaction once the refund becomes valid.
///
/// The transactions and key are fixed at construction; only the value accounting may be updated,
/// by the channel protocol, as payments flow.
pub struct StoredClientChannel {
	/// The identifier this channel is filed under, shared with any other channels opened to the
	/// same counterparty.
	pub id: ChannelId,
	/// The latest mutually-signed transaction funding the channel.
	pub contract: Transaction,
	/// The time-locked transaction returning the channel's funds to the client, valid once its
	/// lock time passes.
	pub refund: Transaction,
	/// The public half of the key the client signs channel updates with. The wallet holding the
	/// corresponding private key is responsible for producing signatures.
	pub my_key: PublicKey,
	value_to_me_sat: AtomicU64,
	refund_fees_sat: AtomicU64,
	// In-memory flag to indicate intent to resume this channel (or that the channel is already
	// in use). Not persisted.
	active: AtomicBool,
}

impl StoredClientChannel {
	/// Creates a new stored channel.
	///
	/// The new channel starts marked in-use, as the caller constructing it is assumed to be the
	/// session currently operating it. Call [`Self::release`] to make it available for
	/// resumption via [`ClientChannelStore::get_inactive_channel_by_id`].
	pub fn new(
		id: ChannelId, contract: Transaction, refund: Transaction, my_key: PublicKey,
		value_to_me_sat: u64, refund_fees_sat: u64,
	) -> Self {
		Self {
			id,
			contract,
			refund,
			my_key,
			value_to_me_sat: AtomicU64::new(value_to_me_sat),
			refund_fees_sat: AtomicU64::new(refund_fees_sat),
			active: AtomicBool::new(true),
		}
	}

	/// The txid of the contract transaction, which disambiguates channels sharing an
	/// [`Self::id`].
	pub fn contract_txid(&self) -> Txid {
		self.contract.compute_txid()
	}

	/// The amount, in satoshis, currently owed back to the client by the latest channel state.
	pub fn value_to_me_sat(&self) -> u64 {
		self.value_to_me_sat.load(Ordering::Relaxed)
	}

	/// Updates the amount owed back to the client. Called by the channel protocol as payments
	/// are made; purely bookkeeping, the broadcast deadline is unaffected.
	pub fn update_value_to_me(&self, value_sat: u64) {
		self.value_to_me_sat.store(value_sat, Ordering::Relaxed);
	}

	/// The fee, in satoshis, reserved for the refund transaction.
	pub fn refund_fees_sat(&self) -> u64 {
		self.refund_fees_sat.load(Ordering::Relaxed)
	}

	/// Whether some session currently holds this channel.
	pub fn is_active(&self) -> bool {
		self.active.load(Ordering::Acquire)
	}

	/// Marks this channel as no longer in use by any session, making it eligible to be handed
	/// out again by [`ClientChannelStore::get_inactive_channel_by_id`].
	pub fn release(&self) {
		self.active.store(false, Ordering::Release);
	}

	// Atomically claims the channel for a session. At most one concurrent caller wins.
	pub(crate) fn try_activate(&self) -> bool {
		self.active.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
	}
}

// Each channel is written as a u32-length-prefixed body so readers can skip records with fields
// they don't understand. The `active` flag is process-local and deliberately absent.
impl Writeable for StoredClientChannel {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		let mut body = VecWriter(Vec::new());
		self.id.write(&mut body)?;
		self.contract.write(&mut body)?;
		self.refund.write(&mut body)?;
		self.my_key.write(&mut body)?;
		self.value_to_me_sat().write(&mut body)?;
		self.refund_fees_sat().write(&mut body)?;
		(body.0.len() as u32).write(w)?;
		w.write_all(&body.0)
	}
}

impl Readable for StoredClientChannel {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let len: u32 = Readable::read(r)?;
		// Two maximal transactions plus fixed-width fields bound any valid record body.
		if len as usize > 2 * MAX_BUF_SIZE + 1024 {
			return Err(DecodeError::BadLengthDescriptor);
		}
		let mut reader = FixedLengthReader::new(&mut *r, len as u64);
		let id = Readable::read(&mut reader)?;
		let contract = Readable::read(&mut reader)?;
		let refund = Readable::read(&mut reader)?;
		let my_key = Readable::read(&mut reader)?;
		let value_to_me_sat = Readable::read(&mut reader)?;
		let refund_fees_sat = Readable::read(&mut reader)?;
		// Later format revisions may have appended fields we don't know about.
		reader.eat_remaining()?;
		Ok(Self::new(id, contract, refund, my_key, value_to_me_sat, refund_fees_sat))
	}
}

struct StoreInner<B: Deref, W: Deref, T: Deref, L: Deref>
where
	B::Target: BroadcasterInterface,
	W::Target: ExtensionHost,
	T::Target: TimeSource,
	L::Target: Logger,
{
	// Maps a channel id to every stored channel sharing it. Lock order: this mutex may be held
	// while taking the expiry queue's internal lock, never the reverse. Neither lock is ever
	// held while broadcasting or notifying the wallet.
	channels: Mutex<HashMap<ChannelId, Vec<Arc<StoredClientChannel>>>>,
	expiry: ExpiryQueue,
	broadcaster: B,
	wallet: W,
	time_source: T,
	logger: L,
}

impl<B: Deref, W: Deref, T: Deref, L: Deref> StoreInner<B, W, T, L>
where
	B::Target: BroadcasterInterface,
	W::Target: ExtensionHost,
	T::Target: TimeSource,
	L::Target: Logger,
{
	fn notify_wallet(&self) {
		self.wallet.extension_changed(EXTENSION_ID);
	}

	// Inserts under the caller's map guard and arms the expiry deadline. Returns false if this
	// exact record is already stored, in which case nothing changes (and in particular the
	// existing deadline stands).
	fn insert_channel_locked(
		&self, map: &mut HashMap<ChannelId, Vec<Arc<StoredClientChannel>>>,
		channel: Arc<StoredClientChannel>,
	) -> bool {
		let set = map.entry(channel.id).or_default();
		if set.iter().any(|c| Arc::ptr_eq(c, &channel)) {
			log_debug!(self.logger, "Ignoring duplicate put of channel with id {}", channel.id);
			return false;
		}
		let deadline = expiry::expiry_time(&channel.refund);
		log_debug!(
			self.logger,
			"Storing client channel with id {} and contract {}, to be broadcast at {}",
			channel.id,
			channel.contract_txid(),
			deadline
		);
		set.push(Arc::clone(&channel));
		self.expiry.arm(deadline, channel);
		true
	}

	// Removes by record identity, disarming any pending deadline. Idempotent; returns whether
	// the record was present.
	fn remove_channel_by_identity(&self, channel: &StoredClientChannel) -> bool {
		let mut map = self.channels.lock().unwrap();
		self.expiry.cancel(channel);
		if let Some(set) = map.get_mut(&channel.id) {
			if let Some(pos) = set.iter().position(|c| ptr::eq(&**c, channel)) {
				set.remove(pos);
				if set.is_empty() {
					map.remove(&channel.id);
				}
				log_debug!(
					self.logger,
					"Removed client channel with id {} and contract {}",
					channel.id,
					channel.contract_txid()
				);
				return true;
			}
		}
		false
	}

	fn process_expired_channels(&self) {
		let now = self.time_source.now().as_secs();
		for channel in self.expiry.pop_due(now) {
			// A concurrent cooperative close may have beaten us to the registry; a channel we
			// cannot remove must not be broadcast.
			if !self.remove_channel_by_identity(&channel) {
				continue;
			}
			self.notify_wallet();
			log_info!(
				self.logger,
				"Channel with id {} expired without cooperative close, broadcasting contract {} and refund {}",
				channel.id,
				channel.contract_txid(),
				channel.refund.compute_txid()
			);
			self.broadcaster.broadcast_transaction(&channel.contract);
			self.broadcaster.broadcast_transaction(&channel.refund);
		}
	}
}

/// The durable registry of every payment channel a client has open.
///
/// Channels are filed by [`ChannelId`] and disambiguated by contract txid. Putting a channel
/// arms a broadcast deadline at its refund's lock time plus a grace period; a background worker
/// (spawned at construction, joined on drop) removes any channel still present at its deadline
/// and hands both of its transactions to the [`BroadcasterInterface`]. Removing a channel
/// cancels its deadline, so a cooperatively-closed channel is never broadcast.
///
/// Every structural change re-notifies the host wallet through [`ExtensionHost`] so it can
/// re-persist the [`WalletExtension`] payload. All collaborators are injected at construction
/// in owned or [`Arc`] form; the worker thread requires them to be shareable.
///
/// The injected [`TimeSource`] is consulted both by the worker and by
/// [`Self::process_expired_channels`], which hosts (and tests) may call directly to process
/// deadlines deterministically.
pub struct ClientChannelStore<B, W, T, L>
where
	B: Deref + Send + Sync + 'static,
	W: Deref + Send + Sync + 'static,
	T: Deref + Send + Sync + 'static,
	L: Deref + Send + Sync + 'static,
	B::Target: BroadcasterInterface,
	W::Target: ExtensionHost,
	T::Target: TimeSource,
	L::Target: Logger,
{
	inner: Arc<StoreInner<B, W, T, L>>,
	worker_thread: Option<JoinHandle<()>>,
}

impl<B, W, T, L> ClientChannelStore<B, W, T, L>
where
	B: Deref + Send + Sync + 'static,
	W: Deref + Send + Sync + 'static,
	T: Deref + Send + Sync + 'static,
	L: Deref + Send + Sync + 'static,
	B::Target: BroadcasterInterface,
	W::Target: ExtensionHost,
	T::Target: TimeSource,
	L::Target: Logger,
{
	/// Creates a new, empty store bound to the given wallet, and spawns the expiry worker.
	///
	/// The `broadcaster` receives the contract and refund transactions of expired channels; the
	/// `wallet` is notified whenever the serialized state goes stale.
	pub fn new(broadcaster: B, wallet: W, time_source: T, logger: L) -> Self {
		let inner = Arc::new(StoreInner {
			channels: Mutex::new(HashMap::new()),
			expiry: ExpiryQueue::new(),
			broadcaster,
			wallet,
			time_source,
			logger,
		});
		let worker_inner = Arc::clone(&inner);
		let worker_thread = Some(thread::spawn(move || {
			while worker_inner.expiry.wait_until_due(&*worker_inner.time_source) {
				worker_inner.process_expired_channels();
			}
		}));
		Self { inner, worker_thread }
	}

	/// Finds a channel with the given id which no session currently holds, atomically marks it
	/// in-use and returns it, or returns `None`.
	///
	/// No two concurrent callers ever receive the same channel: activation is a compare-and-set
	/// on the channel itself. The caller owns the channel until it calls
	/// [`StoredClientChannel::release`] or removes it.
	pub fn get_inactive_channel_by_id(&self, id: &ChannelId) -> Option<Arc<StoredClientChannel>> {
		let map = self.inner.channels.lock().unwrap();
		for channel in map.get(id)? {
			if channel.try_activate() {
				log_trace!(self.inner.logger, "Handing out channel with id {} for resumption", id);
				return Some(Arc::clone(channel));
			}
		}
		None
	}

	/// Finds the channel with the given id and contract txid and returns it, or returns `None`.
	///
	/// Does not affect whether the channel is marked in-use; callers who already know exactly
	/// which channel they want have no activation race to guard against.
	pub fn get_channel(
		&self, id: &ChannelId, contract_txid: &Txid,
	) -> Option<Arc<StoredClientChannel>> {
		let map = self.inner.channels.lock().unwrap();
		map.get(id)?.iter().find(|c| c.contract_txid() == *contract_txid).map(Arc::clone)
	}

	/// Adds the given channel to the store, arming its broadcast deadline, and notifies the
	/// wallet of an update to this extension.
	///
	/// Putting the very same channel twice is a no-op. Distinct channels sharing an id (or even
	/// an id and contract txid) are stored side by side.
	pub fn put_channel(&self, channel: Arc<StoredClientChannel>) {
		let inserted = {
			let mut map = self.inner.channels.lock().unwrap();
			self.inner.insert_channel_locked(&mut map, channel)
		};
		if inserted {
			self.inner.notify_wallet();
		}
	}

	/// Removes the given channel from the store and notifies the wallet of an update to this
	/// extension.
	///
	/// Any pending broadcast deadline for the channel is cancelled: a cooperatively-closed
	/// channel will not have its transactions broadcast later. Removing a channel which is not
	/// present is a no-op (the wallet is still nudged).
	pub fn remove_channel(&self, channel: &StoredClientChannel) {
		self.inner.remove_channel_by_identity(channel);
		self.inner.notify_wallet();
	}

	/// Removes every channel whose broadcast deadline has passed and submits its contract and
	/// refund transactions to the broadcaster.
	///
	/// The expiry worker calls this on its own schedule; it is exposed so hosts running with a
	/// substituted [`TimeSource`] can process deadlines deterministically. Broadcasting happens
	/// with no internal locks held.
	pub fn process_expired_channels(&self) {
		self.inner.process_expired_channels();
	}

	/// The number of channels currently stored, across all ids.
	pub fn channel_count(&self) -> usize {
		self.inner.channels.lock().unwrap().values().map(Vec::len).sum()
	}
}

impl<B, W, T, L> Drop for ClientChannelStore<B, W, T, L>
where
	B: Deref + Send + Sync + 'static,
	W: Deref + Send + Sync + 'static,
	T: Deref + Send + Sync + 'static,
	L: Deref + Send + Sync + 'static,
	B::Target: BroadcasterInterface,
	W::Target: ExtensionHost,
	T::Target: TimeSource,
	L::Target: Logger,
{
	fn drop(&mut self) {
		self.inner.expiry.shutdown();
		if let Some(handle) = self.worker_thread.take() {
			handle.join().unwrap();
		}
	}
}

impl<B, W, T, L> WalletExtension<W> for ClientChannelStore<B, W, T, L>
where
	B: Deref + Send + Sync + 'static,
	W: Deref + Send + Sync + 'static,
	T: Deref + Send + Sync + 'static,
	L: Deref + Send + Sync + 'static,
	B::Target: BroadcasterInterface,
	W::Target: ExtensionHost,
	T::Target: TimeSource,
	L::Target: Logger,
{
	fn extension_id(&self) -> &'static str {
		EXTENSION_ID
	}

	fn is_extension_mandatory(&self) -> bool {
		false
	}

	fn serialize_extension(&self) -> Vec<u8> {
		let map = self.inner.channels.lock().unwrap();
		let mut w = VecWriter(Vec::new());
		SERIALIZATION_VERSION.write(&mut w).unwrap();
		MIN_SERIALIZATION_VERSION.write(&mut w).unwrap();
		for channel in map.values().flatten() {
			channel.write(&mut w).unwrap();
		}
		w.0
	}

	fn deserialize_extension(&self, wallet: &W, data: &[u8]) -> Result<(), APIError> {
		if !ptr::eq(&*self.inner.wallet, &**wallet) {
			return Err(APIError::APIMisuseError {
				err: "Stored channels are already bound to a different wallet".to_owned(),
			});
		}
		// A host with no bytes persisted for this extension simply has no channels yet.
		if data.is_empty() {
			return Ok(());
		}
		let mut reader = Cursor::new(data);
		let _ver: u8 = Readable::read(&mut reader)?;
		let min_ver: u8 = Readable::read(&mut reader)?;
		if min_ver > SERIALIZATION_VERSION {
			return Err(DecodeError::UnknownVersion.into());
		}
		// Decode the full payload before touching the registry so a corrupt tail leaves the
		// in-memory state unchanged.
		let mut channels = Vec::new();
		while (reader.position() as usize) < data.len() {
			channels.push(Arc::new(StoredClientChannel::read(&mut reader)?));
		}
		let mut map = self.inner.channels.lock().unwrap();
		let count = channels.len();
		for channel in channels {
			// Inserting without wallet notification: the wallet is handing us its own bytes.
			self.inner.insert_channel_locked(&mut map, channel);
		}
		log_debug!(self.inner.logger, "Loaded {} stored client channel(s)", count);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::{ClientChannelStore, StoredClientChannel, EXTENSION_ID};
	use crate::channels::expiry::EXPIRY_GRACE_SECS;
	use crate::channels::ChannelId;
	use crate::util::errors::APIError;
	use crate::util::test_utils::{TestBroadcaster, TestLogger, TestTime, TestWallet};
	use crate::wallet::WalletExtension;

	use bitcoin::absolute::LockTime;
	use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
	use bitcoin::transaction::Version;
	use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

	use core::time::Duration;
	use std::sync::Arc;

	type TestStore =
		ClientChannelStore<Arc<TestBroadcaster>, Arc<TestWallet>, Arc<TestTime>, Arc<TestLogger>>;

	const START_TIME_SECS: u64 = 1_000_000;

	struct Harness {
		broadcaster: Arc<TestBroadcaster>,
		wallet: Arc<TestWallet>,
		time: Arc<TestTime>,
		logger: Arc<TestLogger>,
		store: TestStore,
	}

	fn new_harness() -> Harness {
		let broadcaster = Arc::new(TestBroadcaster::new());
		let wallet = Arc::new(TestWallet::new());
		let time = Arc::new(TestTime::new(Duration::from_secs(START_TIME_SECS)));
		let logger = Arc::new(TestLogger::new());
		let store = ClientChannelStore::new(
			Arc::clone(&broadcaster),
			Arc::clone(&wallet),
			Arc::clone(&time),
			Arc::clone(&logger),
		);
		Harness { broadcaster, wallet, time, logger, store }
	}

	fn dummy_tx(lock_time: u32, value_sat: u64) -> Transaction {
		Transaction {
			version: Version::TWO,
			lock_time: LockTime::from_consensus(lock_time),
			input: vec![TxIn {
				previous_output: OutPoint::null(),
				script_sig: ScriptBuf::new(),
				sequence: Sequence::ZERO,
				witness: Witness::new(),
			}],
			output: vec![TxOut {
				value: Amount::from_sat(value_sat),
				script_pubkey: ScriptBuf::new(),
			}],
		}
	}

	fn test_key(byte: u8) -> PublicKey {
		let secp_ctx = Secp256k1::new();
		PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[byte; 32]).unwrap())
	}

	// A channel whose refund locks at START_TIME_SECS + 100, i.e. which expires at
	// START_TIME_SECS + 100 + EXPIRY_GRACE_SECS.
	fn dummy_channel(id_byte: u8, value_sat: u64) -> Arc<StoredClientChannel> {
		Arc::new(StoredClientChannel::new(
			ChannelId::from_bytes([id_byte; 32]),
			dummy_tx(0, value_sat),
			dummy_tx(START_TIME_SECS as u32 + 100, value_sat + 1),
			test_key(42),
			value_sat,
			1000,
		))
	}

	fn advance_past_expiry(time: &TestTime) {
		time.advance(Duration::from_secs(100 + EXPIRY_GRACE_SECS + 1));
	}

	#[test]
	fn get_channel_matches_exactly() {
		let h = new_harness();
		let chan_a = dummy_channel(1, 10_000);
		let chan_b = dummy_channel(1, 20_000);
		let chan_c = dummy_channel(2, 30_000);
		h.store.put_channel(Arc::clone(&chan_a));
		h.store.put_channel(Arc::clone(&chan_b));
		h.store.put_channel(Arc::clone(&chan_c));
		assert_eq!(h.store.channel_count(), 3);

		for chan in [&chan_a, &chan_b, &chan_c] {
			let found = h.store.get_channel(&chan.id, &chan.contract_txid()).unwrap();
			assert!(Arc::ptr_eq(&found, chan));
		}
		// Right id, wrong contract; and a never-inserted id.
		assert!(h.store.get_channel(&chan_a.id, &chan_c.contract_txid()).is_none());
		assert!(h.store
			.get_channel(&ChannelId::from_bytes([9; 32]), &chan_a.contract_txid())
			.is_none());
	}

	#[test]
	fn channels_start_active() {
		let h = new_harness();
		let chan = dummy_channel(1, 10_000);
		assert!(chan.is_active());
		h.store.put_channel(Arc::clone(&chan));

		// Still held by the session which created it, so not available for resumption.
		assert!(h.store.get_inactive_channel_by_id(&chan.id).is_none());

		chan.release();
		let resumed = h.store.get_inactive_channel_by_id(&chan.id).unwrap();
		assert!(Arc::ptr_eq(&resumed, &chan));
		assert!(resumed.is_active());
		// And now it is held again.
		assert!(h.store.get_inactive_channel_by_id(&chan.id).is_none());
	}

	#[test]
	fn concurrent_activation_hands_out_once() {
		let h = new_harness();
		let chan = dummy_channel(1, 10_000);
		h.store.put_channel(Arc::clone(&chan));
		chan.release();

		let store = Arc::new(h.store);
		let id = chan.id;
		let threads: Vec<_> = (0..8)
			.map(|_| {
				let store = Arc::clone(&store);
				std::thread::spawn(move || store.get_inactive_channel_by_id(&id).is_some())
			})
			.collect();
		let wins = threads.into_iter().map(|t| t.join().unwrap()).filter(|won| *won).count();
		assert_eq!(wins, 1);
	}

	#[test]
	fn put_and_remove_notify_wallet() {
		let h = new_harness();
		let chan = dummy_channel(1, 10_000);
		h.store.put_channel(Arc::clone(&chan));
		assert_eq!(h.wallet.notification_count(), 1);
		assert_eq!(h.wallet.notifications.lock().unwrap()[0], EXTENSION_ID);

		h.store.remove_channel(&chan);
		assert_eq!(h.wallet.notification_count(), 2);
	}

	#[test]
	fn duplicate_put_is_a_noop() {
		let h = new_harness();
		let chan = dummy_channel(1, 10_000);
		h.store.put_channel(Arc::clone(&chan));
		h.store.put_channel(Arc::clone(&chan));
		assert_eq!(h.store.channel_count(), 1);
		assert_eq!(h.wallet.notification_count(), 1);

		// Two distinct records may share id and even contract, however.
		let twin = dummy_channel(1, 10_000);
		assert_eq!(twin.contract_txid(), chan.contract_txid());
		h.store.put_channel(Arc::clone(&twin));
		assert_eq!(h.store.channel_count(), 2);
	}

	#[test]
	fn remove_is_idempotent() {
		let h = new_harness();
		let chan = dummy_channel(1, 10_000);
		let never_inserted = dummy_channel(2, 20_000);
		h.store.put_channel(Arc::clone(&chan));

		h.store.remove_channel(&never_inserted);
		assert_eq!(h.store.channel_count(), 1);

		h.store.remove_channel(&chan);
		assert_eq!(h.store.channel_count(), 0);
		h.store.remove_channel(&chan);
		assert_eq!(h.store.channel_count(), 0);
	}

	#[test]
	fn expired_channel_is_removed_and_broadcast() {
		let h = new_harness();
		let chan = dummy_channel(1, 10_000);
		h.store.put_channel(Arc::clone(&chan));

		// Not due yet: nothing happens.
		h.store.process_expired_channels();
		assert!(h.broadcaster.txn_broadcasted.lock().unwrap().is_empty());

		advance_past_expiry(&h.time);
		h.store.process_expired_channels();

		let broadcasted = h.broadcaster.txn_broadcasted.lock().unwrap();
		assert_eq!(broadcasted.len(), 2);
		assert_eq!(broadcasted[0].compute_txid(), chan.contract_txid());
		assert_eq!(broadcasted[1].compute_txid(), chan.refund.compute_txid());
		drop(broadcasted);

		assert_eq!(h.store.channel_count(), 0);
		assert!(h.store.get_channel(&chan.id, &chan.contract_txid()).is_none());
		// put + expiry removal both re-persist.
		assert_eq!(h.wallet.notification_count(), 2);

		// A second pass must not broadcast again.
		h.store.process_expired_channels();
		assert_eq!(h.broadcaster.txn_broadcasted.lock().unwrap().len(), 2);

		h.logger.assert_log_regex(
			"micropay::channels::store".to_string(),
			regex::Regex::new(r"expired without cooperative close, broadcasting contract [0-9a-f]{64}").unwrap(),
			1,
		);
	}

	#[test]
	fn removed_channel_never_broadcasts() {
		let h = new_harness();
		let chan = dummy_channel(1, 10_000);
		h.store.put_channel(Arc::clone(&chan));
		h.store.remove_channel(&chan);

		advance_past_expiry(&h.time);
		h.store.process_expired_channels();
		assert!(h.broadcaster.txn_broadcasted.lock().unwrap().is_empty());
	}

	#[test]
	fn worker_fires_without_manual_processing() {
		let h = new_harness();
		// Already past its deadline the moment it is stored; the background worker should pick
		// it up on its own.
		advance_past_expiry(&h.time);
		let chan = dummy_channel(1, 10_000);
		h.store.put_channel(Arc::clone(&chan));

		let mut broadcast_count = 0;
		for _ in 0..50 {
			broadcast_count = h.broadcaster.txn_broadcasted.lock().unwrap().len();
			if broadcast_count == 2 {
				break;
			}
			std::thread::sleep(Duration::from_millis(100));
		}
		assert_eq!(broadcast_count, 2);
		assert_eq!(h.store.channel_count(), 0);
	}

	#[test]
	fn serialization_roundtrip() {
		let h = new_harness();
		let chan_a = dummy_channel(1, 10_000);
		let chan_b = dummy_channel(2, 20_000);
		h.store.put_channel(Arc::clone(&chan_a));
		h.store.put_channel(Arc::clone(&chan_b));
		chan_a.update_value_to_me(9_000);

		let data = h.store.serialize_extension();

		let h2 = new_harness();
		h2.store.deserialize_extension(&h2.wallet, &data).unwrap();
		assert_eq!(h2.store.channel_count(), 2);
		// Loading must not trigger persistence notifications.
		assert_eq!(h2.wallet.notification_count(), 0);

		for chan in [&chan_a, &chan_b] {
			let loaded = h2.store.get_channel(&chan.id, &chan.contract_txid()).unwrap();
			assert_eq!(loaded.id, chan.id);
			assert_eq!(loaded.contract_txid(), chan.contract_txid());
			assert_eq!(loaded.refund.compute_txid(), chan.refund.compute_txid());
			assert_eq!(loaded.my_key, chan.my_key);
			assert_eq!(loaded.value_to_me_sat(), chan.value_to_me_sat());
			assert_eq!(loaded.refund_fees_sat(), chan.refund_fees_sat());
			// Deserialized channels come back marked in-use and must be released before they
			// can be resumed.
			assert!(loaded.is_active());
		}

		// Reloaded channels are re-armed: they expire like the originals did.
		advance_past_expiry(&h2.time);
		h2.store.process_expired_channels();
		assert_eq!(h2.broadcaster.txn_broadcasted.lock().unwrap().len(), 4);
		assert_eq!(h2.store.channel_count(), 0);
	}

	#[test]
	fn empty_payload_loads_empty_store() {
		let h = new_harness();
		h.store.deserialize_extension(&h.wallet, &[]).unwrap();
		assert_eq!(h.store.channel_count(), 0);

		// An empty store's own serialization (just the version prefix) loads too.
		let data = h.store.serialize_extension();
		assert_eq!(data.len(), 2);
		h.store.deserialize_extension(&h.wallet, &data).unwrap();
		assert_eq!(h.store.channel_count(), 0);
	}

	#[test]
	fn extension_identity() {
		let h = new_harness();
		assert_eq!(h.store.extension_id(), EXTENSION_ID);
		assert!(!h.store.is_extension_mandatory());
	}

	#[test]
	fn deserialize_rejects_foreign_wallet() {
		let h = new_harness();
		let chan = dummy_channel(1, 10_000);
		h.store.put_channel(Arc::clone(&chan));
		let data = h.store.serialize_extension();

		let other_wallet = Arc::new(TestWallet::new());
		match h.store.deserialize_extension(&other_wallet, &data) {
			Err(APIError::APIMisuseError { .. }) => {},
			res => panic!("Unexpected result: {:?}", res),
		}
		// The registry was not touched.
		assert_eq!(h.store.channel_count(), 1);
	}

	#[test]
	fn corrupt_payload_leaves_store_unchanged() {
		let h = new_harness();
		let chan = dummy_channel(1, 10_000);
		h.store.put_channel(Arc::clone(&chan));
		let mut data = h.store.serialize_extension();
		data.truncate(data.len() - 3);

		let h2 = new_harness();
		match h2.store.deserialize_extension(&h2.wallet, &data) {
			Err(APIError::InvalidPayload { .. }) => {},
			res => panic!("Unexpected result: {:?}", res),
		}
		assert_eq!(h2.store.channel_count(), 0);

		// An unknown minimum version is also fatal.
		let data = vec![99, 99];
		match h2.store.deserialize_extension(&h2.wallet, &data) {
			Err(APIError::InvalidPayload { .. }) => {},
			res => panic!("Unexpected result: {:?}", res),
		}
	}
}
