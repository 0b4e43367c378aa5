// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Client-side payment channel state which needs to survive restarts.
//!
//! The [`store::ClientChannelStore`] is the durable registry of every channel the client has
//! open; the expiry submodule holds the deadline machinery which force-broadcasts a channel's
//! transactions if it is never cooperatively closed.

pub mod store;

pub(crate) mod expiry;

use crate::util::ser::{DecodeError, Readable, Writeable, Writer};

use core::fmt;
use std::io;

/// A unique 32-byte identifier for a channel, shared by every record belonging to the same
/// logical counterparty or session.
///
/// How the identifier is derived is up to the channel protocol (typically a hash tied to the
/// server's identity); this crate treats it as opaque.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ChannelId(pub [u8; 32]);

impl ChannelId {
	/// Generic constructor; create a new channel ID from the provided data.
	pub fn from_bytes(data: [u8; 32]) -> Self {
		Self(data)
	}
}

impl Writeable for ChannelId {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.0.write(w)
	}
}

impl Readable for ChannelId {
	fn read<R: io::Read>(r: &mut R) -> Result<Self, DecodeError> {
		let buf: [u8; 32] = Readable::read(r)?;
		Ok(ChannelId(buf))
	}
}

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(&crate::util::logger::DebugBytes(&self.0), f)
	}
}
