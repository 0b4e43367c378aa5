// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The seam between the channel store and its host wallet.
//!
//! A wallet persists named "extensions" alongside its core data: opaque byte blobs it saves on
//! every change and hands back at load time. The channel store plugs into that mechanism via
//! [`WalletExtension`], and asks the wallet to re-persist via [`ExtensionHost`] whenever its
//! contents change.

use crate::util::errors::APIError;

/// A handle to the wallet containing an extension, used to signal that the extension's persisted
/// bytes are stale.
///
/// Implementations should schedule a save of the extension's current [`serialize_extension`]
/// output. Notifications are delivered with no store-internal locks held, so an implementation
/// may serialize the extension synchronously from inside the callback.
///
/// [`serialize_extension`]: WalletExtension::serialize_extension
pub trait ExtensionHost {
	/// Called after any change to the extension identified by `extension_id`.
	fn extension_changed(&self, extension_id: &str);
}

/// A unit of persisted state a wallet loads and saves alongside its core data.
///
/// The type parameter `W` is the handle through which the implementor reaches its containing
/// wallet, and is compared by identity in [`deserialize_extension`]: an extension bound to one
/// wallet instance may never be silently re-bound to another.
///
/// [`deserialize_extension`]: WalletExtension::deserialize_extension
pub trait WalletExtension<W> {
	/// Returns a string which uniquely identifies this extension within the wallet's extension
	/// namespace. Stable across versions and processes.
	fn extension_id(&self) -> &'static str;

	/// Whether a wallet can be loaded by software which does not understand this extension. If
	/// `true`, a host missing the extension's code must refuse to load the wallet; if `false`,
	/// the extension's data is simply carried along or dropped.
	fn is_extension_mandatory(&self) -> bool;

	/// Serializes the extension's current state into an opaque byte blob.
	fn serialize_extension(&self) -> Vec<u8>;

	/// Replays a previously serialized blob, rebuilding the extension's in-memory state.
	///
	/// `wallet` must be the same instance the extension is already bound to; passing a different
	/// one fails with [`APIError::APIMisuseError`]. Malformed bytes fail with
	/// [`APIError::InvalidPayload`] and leave the in-memory state unchanged.
	fn deserialize_extension(&self, wallet: &W, data: &[u8]) -> Result<(), APIError>;
}
