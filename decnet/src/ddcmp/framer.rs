//! Byte-stream framing and resync (§4.E): recovers the message boundary
//! DDCMP relies on purely from the header CRC, since TCP and serial carry an
//! undelimited byte stream. UDP needs none of this — each datagram already
//! carries exactly one message — so callers on that transport decode
//! directly with [`Message::decode`].

use std::collections::VecDeque;

use super::packet::{header_crc_ok, Message, DEL, DLE, ENQ, SOH, SYN};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramerEvent {
	Message { message: Message, data_crc_ok: bool },
	HeaderCrcError,
}

pub struct Framer {
	buf: VecDeque<u8>,
	in_sync: bool,
	telnet: bool,
}

impl Framer {
	pub fn new(telnet: bool) -> Self {
		Self { buf: VecDeque::new(), in_sync: false, telnet }
	}

	/// Append newly-read transport bytes and return every complete event
	/// (message or resync error) now extractable from the buffer.
	pub fn feed(&mut self, data: &[u8]) -> Vec<FramerEvent> {
		self.buf.extend(data.iter().copied());
		self.telnet_undouble();

		let mut events = Vec::new();

		loop {
			while matches!(self.buf.front(), Some(&SYN) | Some(&DEL)) {
				self.buf.pop_front();
			}

			let Some(&start) = self.buf.front() else { break };

			if !matches!(start, SOH | ENQ | DLE) {
				self.buf.pop_front();
				continue;
			}

			if self.buf.len() < 8 {
				break;
			}

			let header: Vec<u8> = self.buf.iter().take(8).copied().collect();

			if !header_crc_ok(&header) {
				if self.in_sync {
					events.push(FramerEvent::HeaderCrcError);
					self.in_sync = false;
				}
				self.buf.pop_front();
				continue;
			}

			self.in_sync = true;

			let total_len = if start == ENQ {
				8
			} else {
				let count = (header[1] as usize) | (((header[2] & 0x3f) as usize) << 8);
				10 + count
			};

			if self.buf.len() < total_len {
				break;
			}

			let bytes: Vec<u8> = self.buf.iter().take(total_len).copied().collect();
			self.buf.drain(..total_len);

			if let Ok((message, _, data_crc_ok)) = Message::decode(&bytes) {
				events.push(FramerEvent::Message { message, data_crc_ok });
			}
		}

		events
	}

	/// Collapse `DEL DEL` escape pairs introduced by telnet-mode transparency.
	/// A trailing unpaired `DEL` is left in the buffer in case its partner
	/// hasn't arrived yet.
	fn telnet_undouble(&mut self) {
		if !self.telnet {
			return;
		}
		let mut i = 0;
		while i + 1 < self.buf.len() {
			if self.buf[i] == DEL && self.buf[i + 1] == DEL {
				self.buf.remove(i + 1);
			}
			i += 1;
		}
	}
}

/// Wrap an already-encoded message for transmission on a TCP or serial byte
/// stream: four `SYN` fill bytes, the message (with any `DEL` byte doubled
/// in telnet mode), and a trailing `DEL`.
pub fn wrap(body: &[u8], telnet: bool) -> Vec<u8> {
	let mut out = Vec::with_capacity(body.len() + 5);
	out.extend_from_slice(&[SYN; 4]);
	if telnet {
		for &b in body {
			out.push(b);
			if b == DEL {
				out.push(DEL);
			}
		}
	} else {
		out.extend_from_slice(body);
	}
	out.push(DEL);
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decodes_message_split_across_two_feeds() {
		let mut framer = Framer::new(false);
		let bytes = Message::Strt { addr: 1 }.encode();

		assert!(framer.feed(&bytes[..4]).is_empty());
		let events = framer.feed(&bytes[4..]);
		assert_eq!(events, vec![FramerEvent::Message { message: Message::Strt { addr: 1 }, data_crc_ok: true }]);
	}

	#[test]
	fn skips_syn_and_del_fill_bytes() {
		let mut framer = Framer::new(false);
		let mut stream = vec![SYN, SYN, SYN, SYN];
		stream.extend_from_slice(&Message::Strt { addr: 1 }.encode());
		stream.push(DEL);

		let events = framer.feed(&stream);
		assert_eq!(events, vec![FramerEvent::Message { message: Message::Strt { addr: 1 }, data_crc_ok: true }]);
	}

	#[test]
	fn loses_sync_on_bad_header_then_resyncs() {
		let mut framer = Framer::new(false);
		let mut stream = Message::Strt { addr: 1 }.encode();
		stream[3] ^= 0xff; // corrupt a class byte, breaking the header CRC
		stream.extend_from_slice(&Message::Ack { resp: 0, addr: 1 }.encode());

		let events = framer.feed(&stream);
		assert!(events.contains(&FramerEvent::HeaderCrcError));
		assert!(events.contains(&FramerEvent::Message { message: Message::Ack { resp: 0, addr: 1 }, data_crc_ok: true }));
	}

	#[test]
	fn telnet_mode_undoubles_embedded_del() {
		let mut framer = Framer::new(true);
		let msg = Message::Data { qsync: false, select: false, resp: 0, num: 1, addr: 1, payload: vec![0xff, 1, 2] };
		let encoded = wrap(&msg.encode(), true);

		let events = framer.feed(&encoded);
		assert_eq!(events, vec![FramerEvent::Message { message: msg, data_crc_ok: true }]);
	}
}
