//! Error taxonomy (§7 / §10.2): explicit enums for the wire-level and
//! connection-level failure classes, each implementing `std::error::Error`
//! so test code can match on variant rather than message text.

use std::fmt;

/// A packet failed to decode from its wire representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
	/// A field bound to a required constant did not match (e.g. a version tag).
	WrongValue { field: &'static str },
	/// The buffer ran out before every field of the layout could be read.
	MissingData { field: &'static str, needed: usize, available: usize },
	/// A length-prefixed or bit-width-bound field's value could not fit.
	FieldOverflow { field: &'static str },
	/// A TLV group carried a tag with no known sub-layout and no wildcard fallback.
	InvalidTag { tag: u16 },
	/// Trailing bytes remained after a layout that does not end in a payload/TLV field.
	ExtraData { remaining: usize },
}

impl fmt::Display for DecodeError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::WrongValue { field } => write!(f, "field `{field}` did not match its required constant value"),
			Self::MissingData { field, needed, available } => {
				write!(f, "field `{field}` needs {needed} bytes but only {available} remain")
			}
			Self::FieldOverflow { field } => write!(f, "field `{field}` overflowed its declared width"),
			Self::InvalidTag { tag } => write!(f, "unrecognised TLV tag {tag}"),
			Self::ExtraData { remaining } => write!(f, "{remaining} unexpected trailing bytes"),
		}
	}
}

impl std::error::Error for DecodeError {}

/// A value could not be encoded into its wire representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
	/// The attribute's current value does not fit in the field's declared width.
	FieldOverflow { field: &'static str },
}

impl fmt::Display for EncodeError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::FieldOverflow { field } => write!(f, "field `{field}` does not fit in its declared width"),
		}
	}
}

impl std::error::Error for EncodeError {}

/// Link-state failures reported by the DDCMP framer (§4.E, §6 failure classes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
	/// Header CRC mismatch.
	Hcrc,
	/// Data CRC mismatch.
	Crc,
	/// A response timer expired with no reply.
	Rep,
	/// Receive buffer too small / assembly overflow.
	Buf,
	/// Sequence number or window overrun.
	Over,
	/// Message shorter than its declared framing requires.
	Shrt,
	/// Header parsed but carried an invalid combination of fields.
	Fmt,
}

impl LinkError {
	/// The DDCMP NAK reason code this failure is reported with, where applicable.
	pub const fn reason(self) -> u8 {
		match self {
			Self::Hcrc => 1,
			Self::Crc => 2,
			Self::Rep => 3,
			Self::Buf => 8,
			Self::Over => 4,
			Self::Shrt => 6,
			Self::Fmt => 5,
		}
	}
}

impl fmt::Display for LinkError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::Hcrc => "header CRC error",
			Self::Crc => "data CRC error",
			Self::Rep => "response timer expired (REP)",
			Self::Buf => "receive buffer error",
			Self::Over => "sequence/window overrun",
			Self::Shrt => "message too short",
			Self::Fmt => "format error",
		};
		f.write_str(s)
	}
}

impl std::error::Error for LinkError {}

/// Local API misuse (§7): raised synchronously to the calling application,
/// never placed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiError {
	/// The connection is not in a state that permits the requested operation.
	WrongState,
	/// An argument was outside its permitted range (e.g. a reserved reject code).
	RangeError,
	/// No free connection identifier remains in the port pool.
	ConnectionLimit,
	/// The operation would exceed the current flow-control credit.
	CantSend,
}

impl fmt::Display for ApiError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::WrongState => "operation not valid in the connection's current state",
			Self::RangeError => "argument out of range",
			Self::ConnectionLimit => "no free connection identifier available",
			Self::CantSend => "insufficient flow-control credit to send",
		};
		f.write_str(s)
	}
}

impl std::error::Error for ApiError {}

/// A line of the configuration grammar (§6, §10.3) could not be parsed or validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
	pub line: usize,
	pub message: String,
}

impl fmt::Display for ConfigError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "line {}: {}", self.line, self.message)
	}
}

impl std::error::Error for ConfigError {}
