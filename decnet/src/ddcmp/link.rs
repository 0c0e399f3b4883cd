//! DDCMP sliding-window ARQ and startup/running state machine (§4.E).
//!
//! This is deliberately *not* a stakker actor: it is pure sequence-number
//! and window bookkeeping, called into by the owning circuit (which is an
//! actor and therefore owns the socket, the timers, and the upcalls to
//! routing-init). Every method returns the wire messages and upcalls the
//! caller must act on; the caller decides what timer to arm next.

use std::collections::VecDeque;
use std::time::Duration;

use super::packet::{nak_reason, Message};
use crate::datalink::DlStatus;

pub const ACKTMR: Duration = Duration::from_secs(1);
pub const STACKTMR: Duration = Duration::from_secs(3);
pub const UDPTMR_LOW: Duration = Duration::from_secs(60);
pub const UDPTMR_HIGH: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
	Halted,
	/// Sent STRT, waiting for STRT or STACK from the peer.
	Istart,
	/// Received STRT and replied STACK, waiting for the peer's STACK.
	Astart,
	Running,
	Maint,
}

/// What the caller must do after feeding a message or a local send into the
/// link state machine.
#[derive(Default)]
pub struct Outcome {
	/// Wire messages to transmit, in order.
	pub sends: Vec<Message>,
	/// Payloads delivered to the upper layer (routing-init), in order.
	pub delivered: Vec<Vec<u8>>,
	/// A datalink status change to report upward.
	pub status: Option<DlStatus>,
	/// The response timer should be (re)armed because there is now at least
	/// one unacknowledged outstanding send.
	pub arm_response_timer: bool,
	/// The response timer should be cancelled because nothing is outstanding.
	pub cancel_response_timer: bool,
}

pub struct DdcmpLink {
	pub state: LinkState,
	addr: u8,
	qmax: u8,
	/// Last sequence number accepted from the peer.
	r: u8,
	/// Last sequence number acknowledged by the peer.
	a: u8,
	/// Last sequence number we have sent.
	n: u8,
	xon: bool,
	pending: VecDeque<(u8, Vec<u8>)>,
	notsent: VecDeque<Vec<u8>>,
}

impl DdcmpLink {
	pub fn new(addr: u8, qmax: u8) -> Self {
		Self { state: LinkState::Halted, addr, qmax, r: 0, a: 0, n: 0, xon: true, pending: VecDeque::new(), notsent: VecDeque::new() }
	}

	/// Number of unacknowledged outstanding sends (mod 256).
	pub fn outstanding(&self) -> u8 {
		self.n.wrapping_sub(self.a)
	}

	/// Call when the underlying transport reports `DlStatus::Up`: move to
	/// `Istart` and emit the first STRT.
	pub fn link_up(&mut self) -> Outcome {
		self.state = LinkState::Istart;
		self.r = 0;
		self.a = 0;
		self.n = 0;
		self.pending.clear();
		self.notsent.clear();
		Outcome { sends: vec![Message::Strt { addr: self.addr }], ..Default::default() }
	}

	/// Call when the underlying transport drops (socket error, peer close).
	pub fn link_down(&mut self) -> Outcome {
		self.state = LinkState::Halted;
		Outcome { status: Some(DlStatus::Down), cancel_response_timer: true, ..Default::default() }
	}

	/// Call when the startup timer (`STACKTMR`/`UDPTMR`) fires while we are
	/// still in `Istart`/`Astart`.
	pub fn startup_timeout(&mut self) -> Outcome {
		match self.state {
			LinkState::Istart => Outcome { sends: vec![Message::Strt { addr: self.addr }], ..Default::default() },
			LinkState::Astart => Outcome { sends: vec![Message::Stack { addr: self.addr }], ..Default::default() },
			_ => Outcome::default(),
		}
	}

	/// Call when `ACKTMR` fires with at least one unacknowledged send: probe
	/// with REP instead of blindly retransmitting.
	pub fn response_timeout(&mut self) -> Outcome {
		if self.pending.is_empty() {
			return Outcome::default();
		}
		Outcome { sends: vec![Message::Rep { num: self.n, addr: self.addr }], arm_response_timer: true, ..Default::default() }
	}

	/// Queue `payload` for transmission on the running link. Returns the
	/// `Data` message to send immediately if the window allows, or `None` if
	/// it was queued on `notsent`.
	pub fn send(&mut self, payload: Vec<u8>) -> Outcome {
		if self.state != LinkState::Running {
			self.notsent.push_back(payload);
			return Outcome::default();
		}

		if self.xon && self.outstanding() < self.qmax {
			let msg = self.transmit(payload);
			Outcome { sends: vec![msg], arm_response_timer: self.pending.len() == 1, ..Default::default() }
		} else {
			self.notsent.push_back(payload);
			Outcome::default()
		}
	}

	fn transmit(&mut self, payload: Vec<u8>) -> Message {
		self.n = self.n.wrapping_add(1);
		self.pending.push_back((self.n, payload.clone()));
		Message::Data { qsync: false, select: false, resp: self.r, num: self.n, addr: self.addr, payload }
	}

	/// Drain as much of `notsent` as the window currently allows, after an
	/// ACK opened up credit.
	fn drain_notsent(&mut self, out: &mut Outcome) {
		while self.xon && self.outstanding() < self.qmax {
			let Some(payload) = self.notsent.pop_front() else { break };
			out.sends.push(self.transmit(payload));
			out.arm_response_timer = true;
		}
	}

	/// Feed a received message (header CRC already validated by the caller)
	/// through the ARQ/startup state machine.
	pub fn receive(&mut self, msg: Message, data_crc_ok: bool) -> Outcome {
		match msg {
			Message::Strt { .. } => self.on_strt(),
			Message::Stack { .. } => self.on_stack(),
			Message::Ack { resp, .. } => self.on_ack_nak(resp, false),
			Message::Nak { resp, .. } => self.on_ack_nak(resp, true),
			Message::Rep { num, .. } => self.on_rep(num),
			Message::Data { resp, num, payload, .. } => self.on_data(resp, num, payload, data_crc_ok),
			Message::Maint { .. } => {
				self.state = LinkState::Maint;
				Outcome::default()
			}
		}
	}

	fn on_strt(&mut self) -> Outcome {
		match self.state {
			LinkState::Istart | LinkState::Astart | LinkState::Halted => {
				self.state = LinkState::Astart;
				Outcome { sends: vec![Message::Stack { addr: self.addr }], ..Default::default() }
			}
			_ => {
				// A running peer restarting: follow it back down to startup.
				self.state = LinkState::Astart;
				Outcome { sends: vec![Message::Stack { addr: self.addr }], status: Some(DlStatus::Down), ..Default::default() }
			}
		}
	}

	fn on_stack(&mut self) -> Outcome {
		match self.state {
			LinkState::Istart | LinkState::Astart => {
				self.state = LinkState::Running;
				self.r = 0;
				self.a = 0;
				self.n = 0;
				Outcome { sends: vec![Message::Ack { resp: 0, addr: self.addr }], status: Some(DlStatus::Up), ..Default::default() }
			}
			_ => Outcome::default(),
		}
	}

	fn on_rep(&mut self, their_num: u8) -> Outcome {
		let msg = if self.r == their_num {
			Message::Ack { resp: self.r, addr: self.addr }
		} else {
			Message::Nak { reason: nak_reason::R_REP, resp: self.r, addr: self.addr }
		};
		Outcome { sends: vec![msg], ..Default::default() }
	}

	fn on_ack_nak(&mut self, resp: u8, is_nak: bool) -> Outcome {
		let mut out = Outcome::default();

		// Acknowledge every pending entry up to and including `resp`.
		while let Some((seq, _)) = self.pending.front() {
			if seq.wrapping_sub(self.a) == 0 {
				break;
			}
			if resp.wrapping_sub(self.a) >= seq.wrapping_sub(self.a) {
				self.a = *seq;
				self.pending.pop_front();
			} else {
				break;
			}
		}

		if is_nak {
			// Retransmit everything still outstanding, in order.
			for (seq, payload) in self.pending.iter() {
				out.sends.push(Message::Data { qsync: false, select: false, resp: self.r, num: *seq, addr: self.addr, payload: payload.clone() });
			}
			if !self.pending.is_empty() {
				out.arm_response_timer = true;
			}
		}

		if self.pending.is_empty() {
			out.cancel_response_timer = true;
		}

		self.drain_notsent(&mut out);
		out
	}

	fn on_data(&mut self, resp: u8, num: u8, payload: Vec<u8>, data_crc_ok: bool) -> Outcome {
		let mut out = self.on_ack_nak(resp, false);

		if !data_crc_ok {
			out.sends.push(Message::Nak { reason: nak_reason::R_CRC, resp: self.r, addr: self.addr });
			return out;
		}

		if num == self.r.wrapping_add(1) {
			self.r = num;
			out.delivered.push(payload);
			out.sends.push(Message::Ack { resp: self.r, addr: self.addr });
		}
		// else: out-of-order/duplicate, silently dropped per §4.E.

		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn startup_scenario() {
		let mut link = DdcmpLink::new(1, 255);
		let out = link.link_up();
		assert_eq!(out.sends, vec![Message::Strt { addr: 1 }]);
		assert_eq!(link.state, LinkState::Istart);

		let out = link.receive(Message::Stack { addr: 1 }, true);
		assert_eq!(link.state, LinkState::Running);
		assert_eq!(out.status, Some(DlStatus::Up));
		assert_eq!(out.sends, vec![Message::Ack { resp: 0, addr: 1 }]);
	}

	#[test]
	fn peer_initiates_startup() {
		let mut link = DdcmpLink::new(1, 255);
		let out = link.receive(Message::Strt { addr: 1 }, true);
		assert_eq!(link.state, LinkState::Astart);
		assert_eq!(out.sends, vec![Message::Stack { addr: 1 }]);

		let out = link.receive(Message::Stack { addr: 1 }, true);
		assert_eq!(link.state, LinkState::Running);
		assert_eq!(out.status, Some(DlStatus::Up));
	}

	#[test]
	fn data_send_and_ack_window() {
		let mut link = DdcmpLink::new(1, 2);
		link.state = LinkState::Running;

		let out = link.send(vec![1, 2, 3]);
		assert_eq!(out.sends.len(), 1);
		assert!(out.arm_response_timer);
		assert_eq!(link.outstanding(), 1);

		let out = link.send(vec![4, 5]);
		assert_eq!(out.sends.len(), 1);
		assert_eq!(link.outstanding(), 2);

		// Window full: third send queues on notsent.
		let out = link.send(vec![6]);
		assert!(out.sends.is_empty());

		let out = link.receive(Message::Ack { resp: 1, addr: 1 }, true);
		assert_eq!(link.outstanding(), 1);
		// Draining notsent should have sent the third payload.
		assert_eq!(out.sends.len(), 1);
	}

	#[test]
	fn data_received_in_order_is_delivered_and_acked() {
		let mut link = DdcmpLink::new(1, 255);
		link.state = LinkState::Running;

		let out = link.receive(Message::Data { qsync: false, select: false, resp: 0, num: 1, addr: 1, payload: vec![9, 9] }, true);
		assert_eq!(out.delivered, vec![vec![9, 9]]);
		assert_eq!(out.sends, vec![Message::Ack { resp: 1, addr: 1 }]);
	}

	#[test]
	fn bad_data_crc_naks() {
		let mut link = DdcmpLink::new(1, 255);
		link.state = LinkState::Running;

		let out = link.receive(Message::Data { qsync: false, select: false, resp: 0, num: 1, addr: 1, payload: vec![9] }, false);
		assert!(out.delivered.is_empty());
		assert_eq!(out.sends, vec![Message::Nak { reason: nak_reason::R_CRC, resp: 0, addr: 1 }]);
	}

	#[test]
	fn nak_retransmits_pending_in_order() {
		let mut link = DdcmpLink::new(1, 255);
		link.state = LinkState::Running;
		link.send(vec![1]);
		link.send(vec![2]);

		let out = link.receive(Message::Nak { reason: nak_reason::R_REP, resp: 0, addr: 1 }, true);
		assert_eq!(out.sends.len(), 2);
		assert!(out.arm_response_timer);
	}
}
