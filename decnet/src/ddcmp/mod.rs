//! DDCMP point-to-point data link (Module E, §4.E).
//!
//! A `DdcmpCircuit` owns one physical connection (TCP or UDP — see
//! [`datalink`](crate::datalink) for the port contract it implements) and
//! drives [`link::DdcmpLink`]'s ARQ/startup state machine from whatever
//! bytes the transport hands it. Serial backends are not wired up here: this
//! crate's reactor (`runtime::Io`) talks to sockets via `recv(2)`/`send(2)`,
//! which isn't a legal operation on a tty file descriptor, so a serial
//! transport needs its own byte-channel adapter rather than reusing `Io`
//! as-is (see DESIGN.md).

pub mod framer;
pub mod link;
pub mod packet;

use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::time::Duration;

use collections::bytes::Slice;
use log::{debug, error, trace, warn};
use rand::Rng;
use runtime::Io;
use stakker::{fwd, fwd_to, timer_max, Fwd, MaxTimerKey, CX};

use crate::datalink::{DatalinkPort, DlStatus};
use crate::timer::{Generation, Guard};
use framer::{Framer, FramerEvent};
use link::{LinkState, ACKTMR, STACKTMR, UDPTMR_HIGH, UDPTMR_LOW};
use packet::Message;

enum Transport {
	Tcp(Io<TcpStream>),
	Udp(Io<UdpSocket>),
}

impl Transport {
	fn write(&self, bytes: &[u8]) {
		let result = match self {
			Self::Tcp(io) => io.write(|cursor| {
				cursor.push(bytes);
			}),
			Self::Udp(io) => io.write(|cursor| {
				cursor.push(bytes);
			}),
		};
		if result.is_err() {
			error!("Failed to write DDCMP frame to transport");
		}
	}

	fn is_udp(&self) -> bool {
		matches!(self, Self::Udp(_))
	}
}

/// One DDCMP point-to-point circuit: a transport, the framer that recovers
/// message boundaries from it (TCP only — UDP preserves datagram boundaries
/// already), and the ARQ/startup state machine.
pub struct DdcmpCircuit {
	transport: Transport,
	framer: Option<Framer>,
	link: link::DdcmpLink,
	generation: Generation,
	startup_timer: MaxTimerKey,
	response_timer: MaxTimerKey,
	up: Fwd<Vec<u8>>,
	status: Fwd<DlStatus>,
	/// Set by [`DatalinkPort::send`], which has no `cx` to arm a timer with;
	/// consumed by [`Self::poll_timers`], which the owning actor calls right
	/// after it submits a frame for the same reason.
	pending_response_arm: bool,
}

impl DdcmpCircuit {
	pub fn init_tcp(cx: CX![], addr: SocketAddr, circuit_addr: u8, qmax: u8, telnet: bool, up: Fwd<Vec<u8>>, status: Fwd<DlStatus>) -> Option<Self> {
		let socket = TcpStream::connect(addr)
			.and_then(|s| {
				s.set_nonblocking(true)?;
				Ok(s)
			})
			.map_err(|err| error!("Failed to connect DDCMP TCP circuit to {addr}: {err}"))
			.ok()?;

		let read_fwd = fwd_to!([cx], read() as (Slice));
		let io = Io::new(socket, read_fwd);

		Some(Self::new(Transport::Tcp(io), Some(Framer::new(telnet)), circuit_addr, qmax, up, status))
	}

	pub fn init_udp(cx: CX![], addr: SocketAddr, circuit_addr: u8, qmax: u8, up: Fwd<Vec<u8>>, status: Fwd<DlStatus>) -> Option<Self> {
		let bind: SocketAddr = if addr.is_ipv4() { "0.0.0.0:0".parse().unwrap() } else { "[::]:0".parse().unwrap() };

		let socket = UdpSocket::bind(bind)
			.and_then(|s| {
				s.set_nonblocking(true)?;
				s.connect(addr)?;
				Ok(s)
			})
			.map_err(|err| error!("Failed to set up DDCMP UDP circuit to {addr}: {err}"))
			.ok()?;

		let read_fwd = fwd_to!([cx], read() as (Slice));
		let io = Io::new(socket, read_fwd);

		Some(Self::new(Transport::Udp(io), None, circuit_addr, qmax, up, status))
	}

	fn new(transport: Transport, framer: Option<Framer>, addr: u8, qmax: u8, up: Fwd<Vec<u8>>, status: Fwd<DlStatus>) -> Self {
		Self {
			transport,
			framer,
			link: link::DdcmpLink::new(addr, qmax),
			generation: Generation::default(),
			startup_timer: MaxTimerKey::default(),
			response_timer: MaxTimerKey::default(),
			up,
			status,
			pending_response_arm: false,
		}
	}

	/// Arm the response timer if a send since the last call needs one. Must
	/// be called by the owner right after routing a frame through the
	/// [`DatalinkPort`] impl, since that trait has no `cx` of its own.
	pub fn poll_timers(&mut self, cx: CX![]) {
		if std::mem::take(&mut self.pending_response_arm) {
			self.arm_response_timer(cx);
		}
	}

	/// Call once after construction to send the first STRT and arm the
	/// startup timer.
	pub fn start(&mut self, cx: CX![]) {
		let outcome = self.link.link_up();
		self.apply(cx, outcome);
		self.arm_startup_timer(cx);
	}

	fn read(&mut self, cx: CX![], buf: Slice) {
		let events = match (&mut self.framer, self.transport.is_udp()) {
			(Some(framer), false) => framer.feed(&buf),
			_ => match Message::decode(&buf) {
				Ok((message, _, data_crc_ok)) => vec![FramerEvent::Message { message, data_crc_ok }],
				Err(err) => {
					trace!("Dropping malformed DDCMP datagram: {err}");
					Vec::new()
				}
			},
		};

		for event in events {
			match event {
				FramerEvent::Message { message, data_crc_ok } => {
					trace!("DDCMP received {message:?}");
					let outcome = self.link.receive(message, data_crc_ok);
					self.apply(cx, outcome);
				}
				FramerEvent::HeaderCrcError => {
					warn!("DDCMP header CRC error, losing sync");
				}
			}
		}
	}

	fn apply(&mut self, cx: CX![], outcome: link::Outcome) {
		for message in outcome.sends {
			self.transmit(&message);
		}
		for payload in outcome.delivered {
			fwd!([self.up], payload);
		}
		if let Some(status) = outcome.status {
			fwd!([self.status], status);
			if status == DlStatus::Up {
				self.generation.bump();
				cx.timer_max_del(self.startup_timer);
			}
		}
		if outcome.arm_response_timer {
			self.arm_response_timer(cx);
		}
		if outcome.cancel_response_timer {
			cx.timer_max_del(self.response_timer);
		}
	}

	fn transmit(&mut self, message: &Message) {
		let bytes = message.encode();
		match &self.framer {
			Some(_) => self.transport.write(&framer::wrap(&bytes, false)),
			None => self.transport.write(&bytes),
		}
	}

	fn arm_startup_timer(&mut self, cx: &mut stakker::Cx<Self>) {
		let interval = match &self.transport {
			Transport::Udp(_) => Duration::from_secs(rand::thread_rng().gen_range(UDPTMR_LOW.as_secs()..=UDPTMR_HIGH.as_secs())),
			Transport::Tcp(_) => STACKTMR,
		};
		let guard = self.generation.guard();
		timer_max!(&mut self.startup_timer, cx.now() + interval, [cx], on_startup_timeout(guard));
	}

	fn arm_response_timer(&mut self, cx: &mut stakker::Cx<Self>) {
		let guard = self.generation.guard();
		timer_max!(&mut self.response_timer, cx.now() + ACKTMR, [cx], on_response_timeout(guard));
	}

	fn on_startup_timeout(&mut self, cx: CX![], guard: Guard) {
		if !guard.is_current(&self.generation) {
			return;
		}
		if !matches!(self.link.state, LinkState::Istart | LinkState::Astart) {
			return;
		}
		debug!("DDCMP startup timer expired, retrying handshake");
		let outcome = self.link.startup_timeout();
		self.apply(cx, outcome);
		self.arm_startup_timer(cx);
	}

	fn on_response_timeout(&mut self, cx: CX![], guard: Guard) {
		if !guard.is_current(&self.generation) {
			return;
		}
		let outcome = self.link.response_timeout();
		self.apply(cx, outcome);
	}

	/// Actor-method equivalent of [`DatalinkPort::send`], for callers that
	/// only hold an [`stakker::ActorOwn`]/[`stakker::Actor`] handle rather
	/// than this struct directly (the owning [`crate::node::Node`]).
	pub fn send_frame(&mut self, cx: CX![], frame: Vec<u8>) {
		self.send(&frame, None);
		self.poll_timers(cx);
	}
}

impl DatalinkPort for DdcmpCircuit {
	fn send(&mut self, frame: &[u8], _dest: Option<crate::common::Macaddr>) {
		let outcome = self.link.send(frame.to_vec());
		for message in &outcome.sends {
			self.transmit(message);
		}
		self.pending_response_arm |= outcome.arm_response_timer;
	}

	fn mtu(&self) -> usize {
		crate::common::MTU
	}
}
