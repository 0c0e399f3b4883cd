//! Point-to-point routing-init state machine (Module F, §4.F).
//!
//! Like [`crate::ddcmp::link`], this is pure state: the owning circuit actor
//! feeds it `DlStatus` changes and received datalink frames and acts on the
//! returned [`Outcome`] (send bytes, arm/cancel the listen and hello timers,
//! hand payloads up to NSP, tell the datalink to restart).

use std::time::Duration;

use crate::common::{NodeId, Version, BCT3MULT, PTP_T3MULT};
use super::packet::{NodeInit, NodeType, NodeVerify, PtpHello, PtpInit, PtpVerify, RoutingData, MSGFLAG_PHASE2, MSGFLAG_PTP_HELLO, MSGFLAG_PTP_INIT, MSGFLAG_PTP_VERIFY, PHASE2_STARTTYPE_INIT, PHASE2_STARTTYPE_VERIFY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
	Two,
	Three,
	Four,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	Ha,
	Ds,
	Ri,
	Rv,
	Ru,
}

pub struct Config {
	pub local: NodeId,
	pub phase: Phase,
	pub ntype: NodeType,
	pub blksize: u16,
	pub t3: Duration,
	pub hello_time: Duration,
	/// When set, we require the peer to answer our init with a `PtpVerify`
	/// whose `fcnval` matches this value.
	pub inbound_verification: Option<Vec<u8>>,
}

#[derive(Default)]
pub struct Outcome {
	pub sends: Vec<Vec<u8>>,
	pub delivered: Vec<Vec<u8>>,
	/// `Some(true)` when the adjacency just came up, `Some(false)` when it
	/// just went down (either a restart or a clean `DlStatus::Down`).
	pub running_changed: Option<bool>,
	pub restart_listen_timer: bool,
	pub arm_hello_timer: bool,
	pub fmt_error: bool,
}

pub struct PtpRouting {
	cfg: Config,
	pub state: State,
	peer: Option<NodeId>,
	peer_phase: Option<Phase>,
	t4: Duration,
}

impl PtpRouting {
	pub fn new(cfg: Config) -> Self {
		Self { cfg, state: State::Ha, peer: None, peer_phase: None, t4: Duration::from_secs(1) }
	}

	pub fn start(&mut self) -> Outcome {
		self.state = State::Ds;
		Outcome { restart_listen_timer: true, ..Default::default() }
	}

	pub fn datalink_up(&mut self) -> Outcome {
		self.state = State::Ri;
		Outcome { sends: vec![self.our_init(self.cfg.phase)], restart_listen_timer: true, ..Default::default() }
	}

	pub fn datalink_down(&mut self) -> Outcome {
		let was_running = self.state == State::Ru;
		self.state = State::Ha;
		self.peer = None;
		self.peer_phase = None;
		Outcome { running_changed: was_running.then_some(false), ..Default::default() }
	}

	/// Call when the listen timer (`t4`) expires with no intervening traffic.
	pub fn listen_timeout(&mut self) -> Outcome {
		let was_running = self.state == State::Ru;
		self.state = State::Ds;
		self.peer = None;
		self.peer_phase = None;
		Outcome { fmt_error: false, running_changed: was_running.then_some(false), ..Default::default() }
	}

	fn our_init(&self, phase: Phase) -> Vec<u8> {
		match phase {
			Phase::Four | Phase::Three => PtpInit {
				srcnode: self.cfg.local,
				verif: self.cfg.inbound_verification.is_some(),
				blo: false,
				ntype: self.cfg.ntype,
				blksize: self.cfg.blksize,
				tiver: if phase == Phase::Four { Version::PHASE4 } else { Version::PHASE3 },
				timer: self.cfg.t3.as_secs() as u16,
				data: Vec::new(),
			}
			.encode()
			.expect("fixed-width init fields never overflow"),
			Phase::Two => NodeInit {
				srcnode: self.cfg.local.raw(),
				nodename: Vec::new(),
				int: 0,
				verif: self.cfg.inbound_verification.is_some(),
				rint: 0,
				blksize: self.cfg.blksize,
				nspsize: self.cfg.blksize,
				maxlnks: 32,
				routver: Version::PHASE2,
				commver: Version::PHASE2,
				sysver: Vec::new(),
			}
			.encode()
			.expect("fixed-width init fields never overflow"),
		}
	}

	/// Feed one received datalink-dependent-layer frame through the state
	/// machine.
	pub fn receive(&mut self, buf: &[u8]) -> Outcome {
		let Some(&first) = buf.first() else { return Outcome::default() };

		match first {
			MSGFLAG_PTP_INIT => self.on_init(buf, Phase::Four),
			MSGFLAG_PTP_VERIFY => self.on_verify(buf),
			MSGFLAG_PTP_HELLO => self.on_hello(buf),
			MSGFLAG_PHASE2 => self.on_phase2(buf),
			_ if self.state == State::Ru => self.on_data(buf),
			_ => Outcome::default(),
		}
	}

	fn on_phase2(&mut self, buf: &[u8]) -> Outcome {
		match buf.get(1).copied() {
			Some(PHASE2_STARTTYPE_INIT) => self.on_node_init(buf),
			Some(PHASE2_STARTTYPE_VERIFY) => self.on_verify_common(NodeVerify::decode(buf).ok().map(|v| v.password.to_vec())),
			_ => {
				let mut out = Outcome::default();
				out.fmt_error = true;
				out
			}
		}
	}

	fn on_node_init(&mut self, buf: &[u8]) -> Outcome {
		let Ok(init) = NodeInit::decode(buf) else {
			return Outcome { fmt_error: true, ..Default::default() };
		};
		let Some(src) = NodeId::from_raw(init.srcnode, false) else {
			return Outcome { fmt_error: true, ..Default::default() };
		};
		// NodeInit carries no hello-interval field; fall back to our own t3.
		self.accept_peer(src, NodeType::Endnode, Phase::Two, self.cfg.t3.as_secs())
	}

	fn on_init(&mut self, buf: &[u8], peer_phase: Phase) -> Outcome {
		let Ok(init) = PtpInit::decode(buf) else {
			return Outcome { fmt_error: true, ..Default::default() };
		};

		let l2_allowed = self.cfg.phase == Phase::Four;
		let ntype_ok = match init.ntype {
			NodeType::L2Router => l2_allowed,
			NodeType::L1Router | NodeType::Endnode => true,
			NodeType::Unknown(_) => false,
		};
		if !ntype_ok || init.blo {
			self.state = State::Ds;
			return Outcome { fmt_error: true, running_changed: Some(false), restart_listen_timer: true, ..Default::default() };
		}

		self.accept_peer(init.srcnode, init.ntype, peer_phase, init.timer as u64)
	}

	fn accept_peer(&mut self, src: NodeId, _ntype: NodeType, peer_phase: Phase, peer_timer_secs: u64) -> Outcome {
		self.peer = Some(src);
		self.peer_phase = Some(peer_phase);

		let mult = if self.cfg.phase == Phase::Four { PTP_T3MULT } else { BCT3MULT };
		self.t4 = Duration::from_secs_f64(peer_timer_secs as f64 * mult);

		let mut out = Outcome { restart_listen_timer: true, ..Default::default() };

		// A lower-phase peer makes us downgrade what we offer, even if we
		// already announced a higher phase on datalink-up.
		let reply_phase = peer_phase.min(self.cfg.phase);
		if reply_phase != self.cfg.phase {
			out.sends.push(self.our_init(reply_phase));
		}

		if self.cfg.inbound_verification.is_some() {
			self.state = State::Rv;
		} else {
			self.state = State::Ru;
			out.running_changed = Some(true);
			out.arm_hello_timer = true;
		}
		out
	}

	fn on_verify(&mut self, buf: &[u8]) -> Outcome {
		let fcnval = PtpVerify::decode(buf).ok().map(|v| v.fcnval);
		self.on_verify_common(fcnval)
	}

	fn on_verify_common(&mut self, fcnval: Option<Vec<u8>>) -> Outcome {
		if self.state != State::Rv {
			return Outcome::default();
		}

		let expected = self.cfg.inbound_verification.as_ref();
		let ok = matches!((expected, &fcnval), (Some(want), Some(got)) if want == got);

		if ok {
			self.state = State::Ru;
			Outcome { running_changed: Some(true), arm_hello_timer: true, restart_listen_timer: true, ..Default::default() }
		} else {
			self.state = State::Ds;
			Outcome { fmt_error: true, running_changed: Some(false), restart_listen_timer: true, ..Default::default() }
		}
	}

	fn on_hello(&mut self, buf: &[u8]) -> Outcome {
		if self.state != State::Ru {
			return Outcome::default();
		}
		if let Ok(hello) = PtpHello::decode(buf) {
			if !hello.testdata_valid() {
				return Outcome { fmt_error: true, ..Default::default() };
			}
		}
		Outcome { restart_listen_timer: true, ..Default::default() }
	}

	fn on_data(&mut self, buf: &[u8]) -> Outcome {
		match RoutingData::strip(buf) {
			Ok((_, payload)) => Outcome { delivered: vec![payload.to_vec()], restart_listen_timer: true, ..Default::default() },
			Err(_) => Outcome { fmt_error: true, ..Default::default() },
		}
	}

	/// Build a periodic `PtpHello` for the hello timer to send.
	pub fn make_hello(&self, testdata_len: usize) -> Vec<u8> {
		PtpHello { srcnode: self.cfg.local, testdata: vec![0xaa; testdata_len] }.encode()
	}

	/// Wrap an NSP-bound payload in the short-format routing data header for
	/// transmission to the current peer.
	pub fn wrap_data(&self, payload: &[u8]) -> Option<Vec<u8>> {
		let peer = self.peer?;
		Some(RoutingData { dst: peer, src: self.cfg.local, visits: 0 }.wrap(payload))
	}

	/// The node currently on the other end of this adjacency, once the
	/// handshake has identified it.
	pub fn peer(&self) -> Option<NodeId> {
		self.peer
	}

	pub fn listen_interval(&self) -> Duration {
		self.t4
	}

	pub fn hello_interval(&self) -> Duration {
		self.cfg.hello_time
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cfg() -> Config {
		Config {
			local: NodeId::new(1, 1).unwrap(),
			phase: Phase::Four,
			ntype: NodeType::L2Router,
			blksize: 576,
			t3: Duration::from_secs(10),
			hello_time: Duration::from_secs(60),
			inbound_verification: None,
		}
	}

	#[test]
	fn handshake_without_verification_reaches_ru() {
		let mut r = PtpRouting::new(cfg());
		r.start();
		let out = r.datalink_up();
		assert_eq!(r.state, State::Ri);
		assert_eq!(out.sends.len(), 1);

		let peer_init = PtpInit {
			srcnode: NodeId::new(1, 2).unwrap(),
			verif: false,
			blo: false,
			ntype: NodeType::L2Router,
			blksize: 528,
			tiver: Version::PHASE4,
			timer: 10,
			data: Vec::new(),
		}
		.encode()
		.unwrap();

		let out = r.receive(&peer_init);
		assert_eq!(r.state, State::Ru);
		assert_eq!(out.running_changed, Some(true));
	}

	#[test]
	fn handshake_with_verification_checks_fcnval() {
		let mut c = cfg();
		c.inbound_verification = Some(b"SECRET".to_vec());
		let mut r = PtpRouting::new(c);
		r.start();
		r.datalink_up();

		let peer_init = PtpInit {
			srcnode: NodeId::new(1, 2).unwrap(),
			verif: false,
			blo: false,
			ntype: NodeType::Endnode,
			blksize: 528,
			tiver: Version::PHASE4,
			timer: 10,
			data: Vec::new(),
		}
		.encode()
		.unwrap();
		r.receive(&peer_init);
		assert_eq!(r.state, State::Rv);

		let bad = PtpVerify { srcnode: NodeId::new(1, 2).unwrap(), fcnval: b"WRONG".to_vec() }.encode().unwrap();
		let out = r.receive(&bad);
		assert_eq!(r.state, State::Ds);
		assert!(out.fmt_error);

		r.datalink_up();
		r.receive(&peer_init);
		let good = PtpVerify { srcnode: NodeId::new(1, 2).unwrap(), fcnval: b"SECRET".to_vec() }.encode().unwrap();
		let out = r.receive(&good);
		assert_eq!(r.state, State::Ru);
		assert_eq!(out.running_changed, Some(true));
	}

	#[test]
	fn bad_ntype_restarts_to_ds() {
		let mut r = PtpRouting::new(cfg());
		r.start();
		r.datalink_up();

		let peer_init = PtpInit {
			srcnode: NodeId::new(1, 2).unwrap(),
			verif: false,
			blo: false,
			ntype: NodeType::Unknown(3),
			blksize: 528,
			tiver: Version::PHASE4,
			timer: 10,
			data: Vec::new(),
		}
		.encode()
		.unwrap();

		let out = r.receive(&peer_init);
		assert_eq!(r.state, State::Ds);
		assert!(out.fmt_error);
	}

	#[test]
	fn data_delivered_once_running() {
		let mut r = PtpRouting::new(cfg());
		r.start();
		r.datalink_up();
		let peer_init = PtpInit {
			srcnode: NodeId::new(1, 2).unwrap(),
			verif: false,
			blo: false,
			ntype: NodeType::Endnode,
			blksize: 528,
			tiver: Version::PHASE4,
			timer: 10,
			data: Vec::new(),
		}
		.encode()
		.unwrap();
		r.receive(&peer_init);

		let wrapped = r.wrap_data(b"hello nsp").unwrap();
		let out = r.receive(&wrapped);
		assert_eq!(out.delivered, vec![b"hello nsp".to_vec()]);
	}
}
