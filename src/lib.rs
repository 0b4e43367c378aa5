// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Client-side Bitcoin micropayment channel state storage.
//!
//! A micropayment channel lets two parties incrementally update a mutually-signed transaction to
//! reflect a running balance, settling on-chain only when the channel closes. The client's side
//! of every open channel (the latest contract transaction, the time-locked refund transaction,
//! the channel key and the running balance) must survive restarts, or funds are lost the moment
//! the process does.
//!
//! This crate provides [`channels::store::ClientChannelStore`], which:
//! * files each [`channels::store::StoredClientChannel`] under its [`channels::ChannelId`] and
//!   hands it back out for session resumption, guaranteeing no two sessions resume the same
//!   channel concurrently;
//! * persists itself through a host wallet's extension mechanism (see [`wallet`]) in an
//!   explicit, versioned binary format, re-notifying the wallet after every change;
//! * watches each channel's refund lock time and, if the channel is never cooperatively closed,
//!   removes it and hands both of its transactions to a
//!   [`chain::chaininterface::BroadcasterInterface`] once the lock time plus a grace period has
//!   passed.
//!
//! The wallet, transaction broadcaster, clock and logger are all injected at construction, so
//! the crate enforces no specific wallet implementation, network stack or runtime.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

#[macro_use]
pub mod util;

pub mod chain;
pub mod channels;
pub mod wallet;
