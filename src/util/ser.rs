// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! A very simple serialization framework which is used to serialize the stored channel set into
//! the versioned wallet-extension payload and read it back.

use std::cmp;
use std::fmt;
use std::io::{self, Read};

use bitcoin::consensus::encode;
use bitcoin::hash_types::Txid;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Transaction;

/// The maximum number of bytes a single length-prefixed element may claim. Anything larger than
/// a consensus-maximal transaction is corrupt by definition.
pub(crate) const MAX_BUF_SIZE: usize = 1024 * 1024;

/// An error in decoding a serialized channel record or the payload framing around it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
	/// A version byte specified something we don't know how to handle.
	UnknownVersion,
	/// A value was invalid, e.g. a public key which was not a valid curve point or a transaction
	/// which did not round-trip the consensus codec.
	InvalidValue,
	/// Buffer too short.
	ShortRead,
	/// A length descriptor didn't describe the later data correctly.
	BadLengthDescriptor,
	/// Error from [`std::io`].
	Io(io::ErrorKind),
}

impl fmt::Display for DecodeError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			DecodeError::UnknownVersion => f.write_str("Unknown serialization version"),
			DecodeError::InvalidValue => f.write_str("Nonsense bytes didn't map to the type they were interpreted as"),
			DecodeError::ShortRead => f.write_str("Packet extended beyond the provided bytes"),
			DecodeError::BadLengthDescriptor => f.write_str("A length descriptor in the packet didn't describe the later data correctly"),
			DecodeError::Io(ref e) => fmt::Debug::fmt(e, f),
		}
	}
}

impl std::error::Error for DecodeError {}

impl From<io::Error> for DecodeError {
	fn from(e: io::Error) -> Self {
		if e.kind() == io::ErrorKind::UnexpectedEof {
			DecodeError::ShortRead
		} else {
			DecodeError::Io(e.kind())
		}
	}
}

/// A trait that is similar to [`std::io::Write`] but has one extra function which can be used to
/// size buffers being written into. An impl is provided for any type that also impls
/// [`std::io::Write`] which simply ignores size hints.
pub trait Writer {
	/// Writes the given buf out. See [`std::io::Write::write_all`] for more.
	fn write_all(&mut self, buf: &[u8]) -> Result<(), io::Error>;
	/// Hints that data of the given size is about to be written. This may not always be called
	/// prior to data being written and may be safely ignored.
	fn size_hint(&mut self, size: usize);
}

impl<W: io::Write> Writer for W {
	#[inline]
	fn write_all(&mut self, buf: &[u8]) -> Result<(), io::Error> {
		<Self as io::Write>::write_all(self, buf)
	}
	#[inline]
	fn size_hint(&mut self, _size: usize) {}
}

pub(crate) struct VecWriter(pub Vec<u8>);
impl Writer for VecWriter {
	fn write_all(&mut self, buf: &[u8]) -> Result<(), io::Error> {
		self.0.extend_from_slice(buf);
		Ok(())
	}
	fn size_hint(&mut self, size: usize) {
		self.0.reserve_exact(size);
	}
}

/// A trait that various types implement allowing them to be written out to a [`Writer`].
pub trait Writeable {
	/// Writes `self` out to the given [`Writer`].
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error>;

	/// Writes `self` out to a `Vec<u8>`.
	fn encode(&self) -> Vec<u8> {
		let mut msg = VecWriter(Vec::new());
		self.write(&mut msg).unwrap();
		msg.0
	}
}

/// A trait that various types implement allowing them to be read in from a [`Read`].
pub trait Readable
where
	Self: Sized,
{
	/// Reads a `Self` in from the given [`Read`].
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError>;
}

macro_rules! impl_writeable_primitive {
	($val_type:ty, $len: expr) => {
		impl Writeable for $val_type {
			#[inline]
			fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
				writer.write_all(&self.to_be_bytes())
			}
		}
		impl Readable for $val_type {
			#[inline]
			fn read<R: Read>(reader: &mut R) -> Result<$val_type, DecodeError> {
				let mut buf = [0; $len];
				reader.read_exact(&mut buf)?;
				Ok(<$val_type>::from_be_bytes(buf))
			}
		}
	};
}

impl_writeable_primitive!(u64, 8);
impl_writeable_primitive!(u32, 4);
impl_writeable_primitive!(u16, 2);

impl Writeable for u8 {
	#[inline]
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		writer.write_all(&[*self])
	}
}
impl Readable for u8 {
	#[inline]
	fn read<R: Read>(reader: &mut R) -> Result<u8, DecodeError> {
		let mut buf = [0; 1];
		reader.read_exact(&mut buf)?;
		Ok(buf[0])
	}
}

// u8 arrays
macro_rules! impl_array {
	($size:expr) => {
		impl Writeable for [u8; $size] {
			#[inline]
			fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
				w.write_all(self)
			}
		}

		impl Readable for [u8; $size] {
			#[inline]
			fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
				let mut buf = [0u8; $size];
				r.read_exact(&mut buf)?;
				Ok(buf)
			}
		}
	};
}

impl_array!(32); // for channel ids and txids
impl_array!(33); // for PublicKey

impl Writeable for Txid {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		w.write_all(&self.to_byte_array())
	}
}

impl Readable for Txid {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let buf: [u8; 32] = Readable::read(r)?;
		Ok(Txid::from_byte_array(buf))
	}
}

impl Writeable for PublicKey {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.serialize().write(w)
	}
}

impl Readable for PublicKey {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let buf: [u8; 33] = Readable::read(r)?;
		match PublicKey::from_slice(&buf) {
			Ok(key) => Ok(key),
			Err(_) => Err(DecodeError::InvalidValue),
		}
	}
}

// Transactions are stored as a u32-length-prefixed run of consensus bytes. The prefix lets a
// reader skip a record it cannot fully interpret, and the Vec round-trip through the consensus
// codec rejects trailing garbage for us.
impl Writeable for Transaction {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		let data = encode::serialize(self);
		debug_assert!(data.len() <= MAX_BUF_SIZE);
		(data.len() as u32).write(w)?;
		w.write_all(&data)
	}
}

impl Readable for Transaction {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let len: u32 = Readable::read(r)?;
		if len as usize > MAX_BUF_SIZE {
			return Err(DecodeError::BadLengthDescriptor);
		}
		let mut buf = vec![0; len as usize];
		r.read_exact(&mut buf)?;
		encode::deserialize(&buf).map_err(|_| DecodeError::InvalidValue)
	}
}

/// Essentially [`std::io::Take`] but with a method to walk the underlying stream forward to
/// ensure we always consume exactly the fixed length specified.
pub(crate) struct FixedLengthReader<R: Read> {
	read: R,
	bytes_read: u64,
	total_bytes: u64,
}
impl<R: Read> FixedLengthReader<R> {
	pub fn new(read: R, total_bytes: u64) -> Self {
		Self { read, bytes_read: 0, total_bytes }
	}

	pub fn eat_remaining(&mut self) -> Result<(), DecodeError> {
		io::copy(self, &mut io::sink())?;
		if self.bytes_read != self.total_bytes {
			Err(DecodeError::ShortRead)
		} else {
			Ok(())
		}
	}
}
impl<R: Read> Read for FixedLengthReader<R> {
	fn read(&mut self, dest: &mut [u8]) -> Result<usize, io::Error> {
		if self.total_bytes == self.bytes_read {
			Ok(0)
		} else {
			let read_len = cmp::min(dest.len() as u64, self.total_bytes - self.bytes_read);
			match self.read.read(&mut dest[0..(read_len as usize)]) {
				Ok(v) => {
					self.bytes_read += v as u64;
					Ok(v)
				},
				Err(e) => Err(e),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::{DecodeError, Readable, Writeable};
	use bitcoin::hashes::Hash;
	use bitcoin::hash_types::Txid;
	use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
	use bitcoin::Transaction;
	use std::io::Cursor;

	#[test]
	fn primitive_roundtrip() {
		let val = 0xdead_beef_0bad_f00du64;
		let encoded = val.encode();
		assert_eq!(encoded.len(), 8);
		let read: u64 = Readable::read(&mut Cursor::new(&encoded)).unwrap();
		assert_eq!(read, val);

		let txid = Txid::from_byte_array([0x42; 32]);
		let read: Txid = Readable::read(&mut Cursor::new(&txid.encode())).unwrap();
		assert_eq!(read, txid);
	}

	#[test]
	fn pubkey_roundtrip_and_rejection() {
		let secp_ctx = Secp256k1::new();
		let key = PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[42; 32]).unwrap());
		let read: PublicKey = Readable::read(&mut Cursor::new(&key.encode())).unwrap();
		assert_eq!(read, key);

		// 33 bytes which are not a curve point must not decode.
		let res: Result<PublicKey, _> = Readable::read(&mut Cursor::new(&[0xff; 33][..]));
		assert_eq!(res.unwrap_err(), DecodeError::InvalidValue);
	}

	#[test]
	fn short_read_is_detected() {
		let val = 0x1122_3344u32;
		let encoded = val.encode();
		let res: Result<u64, _> = Readable::read(&mut Cursor::new(&encoded));
		assert_eq!(res.unwrap_err(), DecodeError::ShortRead);
	}

	#[test]
	fn oversized_transaction_length_is_rejected() {
		// A length prefix claiming more than MAX_BUF_SIZE must fail before any allocation.
		let mut encoded = Vec::new();
		encoded.extend_from_slice(&(super::MAX_BUF_SIZE as u32 + 1).to_be_bytes());
		encoded.extend_from_slice(&[0; 16]);
		let res: Result<Transaction, _> = Readable::read(&mut Cursor::new(&encoded));
		assert_eq!(res.unwrap_err(), DecodeError::BadLengthDescriptor);
	}
}
