//! DDCMP wire messages (§6 "DDCMP wire format", §3 "DDCMP message").
//!
//! Header is always 8 bytes: a start byte, 5 class-specific bytes (wire
//! offsets 1..5), and a 2-byte header CRC. Data and Maintenance messages
//! append a payload and a 2-byte data CRC. All integers are little-endian;
//! the CRC is CRC-16 with polynomial 0x8005 (table-driven in
//! [`crate::common::crc16`]).

use crate::common::crc16;
use crate::error::{DecodeError, LinkError};

pub const SOH: u8 = 0x81;
pub const ENQ: u8 = 0x05;
pub const DLE: u8 = 0x90;
pub const SYN: u8 = 0x96;
pub const DEL: u8 = 0xff;

/// Control-message type codes (offset 1 when the start byte is `ENQ`).
pub mod ctl_type {
	pub const ACK: u8 = 1;
	pub const NAK: u8 = 2;
	pub const REP: u8 = 3;
	pub const STRT: u8 = 6;
	pub const STACK: u8 = 7;
}

/// NAK reason codes (offset 2, "subtype" position, when type is NAK).
pub mod nak_reason {
	pub const R_HCRC: u8 = 1;
	pub const R_CRC: u8 = 2;
	pub const R_REP: u8 = 3;
	pub const R_OVER: u8 = 4;
	pub const R_FMT: u8 = 5;
	pub const R_SHRT: u8 = 6;
	pub const R_BUF: u8 = 8;
}

impl From<LinkError> for u8 {
	fn from(e: LinkError) -> Self {
		e.reason()
	}
}

/// A parsed DDCMP message. `addr` is the station address (always 1 on a
/// point-to-point link, but preserved since the wire carries it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
	Ack { resp: u8, addr: u8 },
	Nak { reason: u8, resp: u8, addr: u8 },
	Rep { num: u8, addr: u8 },
	/// STRT always sets the QSYNC and SELECT bits (§8 scenario 1).
	Strt { addr: u8 },
	/// STACK always sets the QSYNC and SELECT bits (§8 scenario 1).
	Stack { addr: u8 },
	Data { qsync: bool, select: bool, resp: u8, num: u8, addr: u8, payload: Vec<u8> },
	Maint { qsync: bool, select: bool, addr: u8, payload: Vec<u8> },
}

impl Message {
	pub fn addr(&self) -> u8 {
		match self {
			Self::Ack { addr, .. }
			| Self::Nak { addr, .. }
			| Self::Rep { addr, .. }
			| Self::Strt { addr }
			| Self::Stack { addr }
			| Self::Data { addr, .. }
			| Self::Maint { addr, .. } => *addr,
		}
	}

	fn payload(&self) -> Option<&Vec<u8>> {
		match self {
			Self::Data { payload, .. } | Self::Maint { payload, .. } => Some(payload),
			_ => None,
		}
	}

	/// Encode the full message, including header CRC and (for Data/Maint) data CRC.
	pub fn encode(&self) -> Vec<u8> {
		// `class` holds wire offsets 1..=5: type/count_lo, subtype-or-flags,
		// resp, num, addr.
		let mut class = [0u8; 5];
		let start;

		match self {
			Self::Ack { resp, addr } => {
				start = ENQ;
				class[0] = ctl_type::ACK;
				class[2] = *resp;
				class[4] = *addr;
			}
			Self::Nak { reason, resp, addr } => {
				start = ENQ;
				class[0] = ctl_type::NAK;
				class[1] = *reason;
				class[2] = *resp;
				class[4] = *addr;
			}
			Self::Rep { num, addr } => {
				start = ENQ;
				class[0] = ctl_type::REP;
				class[3] = *num;
				class[4] = *addr;
			}
			Self::Strt { addr } => {
				start = ENQ;
				class[0] = ctl_type::STRT;
				class[1] = 0xc0;
				class[4] = *addr;
			}
			Self::Stack { addr } => {
				start = ENQ;
				class[0] = ctl_type::STACK;
				class[1] = 0xc0;
				class[4] = *addr;
			}
			Self::Data { qsync, select, resp, num, addr, payload } => {
				start = SOH;
				let count = payload.len() as u16;
				class[0] = (count & 0xff) as u8;
				class[1] = ((count >> 8) & 0x3f) as u8 | if *qsync { 0x40 } else { 0 } | if *select { 0x80 } else { 0 };
				class[2] = *resp;
				class[3] = *num;
				class[4] = *addr;
			}
			Self::Maint { qsync, select, addr, payload } => {
				start = DLE;
				let count = payload.len() as u16;
				class[0] = (count & 0xff) as u8;
				class[1] = ((count >> 8) & 0x3f) as u8 | if *qsync { 0x40 } else { 0 } | if *select { 0x80 } else { 0 };
				class[4] = *addr;
			}
		}

		let mut out = Vec::with_capacity(10 + self.payload().map_or(0, Vec::len));
		out.push(start);
		out.extend_from_slice(&class);
		out.extend_from_slice(&header_crc(start, &class).to_le_bytes());

		if let Some(payload) = self.payload() {
			out.extend_from_slice(payload);
			out.extend_from_slice(&crc16(payload).to_le_bytes());
		}

		out
	}

	/// Decode a message whose 8-byte header (and, for Data/Maint, payload +
	/// data CRC) are already known to be present in `buf`. The caller
	/// ([`crate::ddcmp::link`]) is responsible for locating the start byte
	/// and verifying the header CRC before calling this; a bad header CRC is
	/// reported as [`LinkError::Hcrc`] at that layer, not here.
	///
	/// Returns the parsed message, the total number of bytes consumed, and
	/// (for Data/Maint) whether the data CRC was valid — a bad data CRC does
	/// not prevent the `resp` field from being read (§4.E).
	pub fn decode(buf: &[u8]) -> Result<(Message, usize, bool), DecodeError> {
		if buf.len() < 8 {
			return Err(DecodeError::MissingData { field: "header", needed: 8, available: buf.len() });
		}

		let start = buf[0];
		let b1 = buf[1];
		let b2 = buf[2];
		let b3 = buf[3];
		let b4 = buf[4];
		let addr = buf[5];

		let msg = match start {
			ENQ => match b1 {
				ctl_type::ACK => Message::Ack { resp: b3, addr },
				ctl_type::NAK => Message::Nak { reason: b2, resp: b3, addr },
				ctl_type::REP => Message::Rep { num: b4, addr },
				ctl_type::STRT => Message::Strt { addr },
				ctl_type::STACK => Message::Stack { addr },
				_ => return Err(DecodeError::WrongValue { field: "ddcmp.type" }),
			},
			SOH | DLE => {
				let count = (b1 as usize) | (((b2 & 0x3f) as usize) << 8);
				let qsync = b2 & 0x40 != 0;
				let select = b2 & 0x80 != 0;

				if buf.len() < 8 + count + 2 {
					return Err(DecodeError::MissingData { field: "ddcmp.payload", needed: 8 + count + 2, available: buf.len() });
				}

				let payload = buf[8..8 + count].to_vec();
				let data_crc = u16::from_le_bytes([buf[8 + count], buf[9 + count]]);
				let crc_ok = crc16(&payload) == data_crc;

				let msg = if start == SOH {
					Message::Data { qsync, select, resp: b3, num: b4, addr, payload }
				} else {
					Message::Maint { qsync, select, addr, payload }
				};

				return Ok((msg, 10 + count, crc_ok));
			}
			_ => return Err(DecodeError::WrongValue { field: "ddcmp.start" }),
		};

		Ok((msg, 8, true))
	}
}

/// Compute the header CRC over the start byte plus the 5 class-specific bytes.
pub fn header_crc(start: u8, class: &[u8; 5]) -> u16 {
	let mut buf = [0u8; 6];
	buf[0] = start;
	buf[1..].copy_from_slice(class);
	crc16(&buf)
}

/// Verify the header CRC of an already-located 8-byte header.
pub fn header_crc_ok(header: &[u8]) -> bool {
	debug_assert!(header.len() >= 8);
	let mut class = [0u8; 5];
	class.copy_from_slice(&header[1..6]);
	let expect = u16::from_le_bytes([header[6], header[7]]);
	header_crc(header[0], &class) == expect
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strt_stack_scenario_bytes() {
		let strt = Message::Strt { addr: 1 };
		assert_eq!(strt.encode(), vec![0x05, 0x06, 0xc0, 0x00, 0x00, 0x01, 0x75, 0x95]);

		let stack = Message::Stack { addr: 1 };
		assert_eq!(stack.encode(), vec![0x05, 0x07, 0xc0, 0x00, 0x00, 0x01, 0x48, 0x55]);
	}

	#[test]
	fn roundtrip_control_messages() {
		for msg in [
			Message::Ack { resp: 5, addr: 1 },
			Message::Nak { reason: nak_reason::R_CRC, resp: 3, addr: 1 },
			Message::Rep { num: 9, addr: 1 },
		] {
			let bytes = msg.encode();
			let (decoded, consumed, crc_ok) = Message::decode(&bytes).unwrap();
			assert_eq!(decoded, msg);
			assert_eq!(consumed, bytes.len());
			assert!(crc_ok);
		}
	}

	#[test]
	fn data_message_roundtrip_and_prefix() {
		let msg = Message::Data { qsync: false, select: true, resp: 2, num: 3, addr: 1, payload: vec![1, 2, 3, 4] };
		let bytes = msg.encode();
		let (decoded, consumed, crc_ok) = Message::decode(&bytes).unwrap();
		assert_eq!(decoded, msg);
		assert_eq!(consumed, bytes.len());
		assert!(crc_ok);
	}

	#[test]
	fn bad_data_crc_detected_but_resp_still_readable() {
		let msg = Message::Data { qsync: false, select: false, resp: 7, num: 1, addr: 1, payload: vec![9, 9] };
		let mut bytes = msg.encode();
		let last = bytes.len() - 1;
		bytes[last] ^= 0xff;

		let (decoded, _, crc_ok) = Message::decode(&bytes).unwrap();
		assert!(!crc_ok);
		match decoded {
			Message::Data { resp, .. } => assert_eq!(resp, 7),
			_ => panic!("wrong variant"),
		}
	}

	#[test]
	fn header_crc_single_bit_flip_detected() {
		let msg = Message::Strt { addr: 1 };
		let bytes = msg.encode();
		for bit in 0..8 * 8 {
			let mut h = bytes[..8].to_vec();
			h[bit / 8] ^= 1 << (bit % 8);
			assert!(!header_crc_ok(&h), "bit {bit} flip should break header CRC");
		}
	}
}
