//! Node scheduler (Module C, §5): the single actor that owns every DDCMP
//! circuit, drives point-to-point routing-init per circuit, and feeds
//! delivered traffic through one [`Nsp`] connection table and [`Session`].
//!
//! Circuits are spawned as their own `DdcmpCircuit` actors (§5's "one
//! background pump per active datalink", realized as a reactor task rather
//! than an OS thread — see SPEC_FULL.md §5); `Nsp` and `Session` are plain
//! state owned directly by `Node`, the same way `wireguard::Wireguard` owns
//! its `Peer`s as embedded structs rather than sub-actors.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use collections::bytes::Slice;
use log::{info, warn};
use rand::Rng;
use stakker::{actor, call, fwd_to, ret_nop, timer_max, ActorOwn, Fwd, MaxTimerKey, CX};

use crate::common::{NodeId, MTU};
use crate::config::{CircuitConfig, CircuitKind, NodeConfig};
use crate::datalink::DlStatus;
use crate::ddcmp::DdcmpCircuit;
use crate::nsp::{self, Nsp};
use crate::routing::packet::NodeType;
use crate::routing::ptp::{self, PtpRouting};
use crate::session::Session;

/// Window size DDCMP point-to-point circuits advertise; the config grammar
/// has no knob for it, so this follows the classic DDCMP default.
const DDCMP_QMAX: u8 = 7;
/// Periodic routing-init `Hello` test pattern length (§6, `PtpHello`).
const HELLO_TESTDATA_LEN: usize = 10;

struct Circuit {
	name: String,
	actor: ActorOwn<DdcmpCircuit>,
	routing: PtpRouting,
	listen_timer: MaxTimerKey,
	hello_timer: MaxTimerKey,
}

pub struct Node {
	circuits: Vec<Circuit>,
	nsp: Nsp,
	session: Session,
	retransmit_timers: HashMap<u16, MaxTimerKey>,
}

impl Node {
	pub fn init(cx: CX![], cfg: NodeConfig) -> Option<Self> {
		let routing_cfg = cfg.node.clone().unwrap_or_default();
		let local = routing_cfg.id;
		let phase = routing_cfg.ntype.phase();
		let ntype = routing_cfg.ntype.ntype().unwrap_or(NodeType::Endnode);

		let mut node = Self {
			circuits: Vec::new(),
			nsp: Nsp::new(nsp::Config {
				max_connections: cfg.nsp.max_connections,
				port_base: 1,
				version: 1,
				info: 0,
				segsize: MTU as u16,
				retransmit_floor: Duration::from_secs(5),
				nsp_delay_factor: cfg.nsp.delay,
			}),
			session: Session::new(cfg.objects),
			retransmit_timers: HashMap::new(),
		};

		for circuit_cfg in &cfg.circuits {
			if circuit_cfg.kind != CircuitKind::Ddcmp {
				warn!("Circuit `{}`: only DDCMP circuits are implemented, skipping", circuit_cfg.name);
				continue;
			}
			node.spawn_circuit(cx, circuit_cfg, local, phase, ntype);
		}

		Some(node)
	}

	fn spawn_circuit(&mut self, cx: CX![], cfg: &CircuitConfig, local: NodeId, phase: ptp::Phase, ntype: NodeType) {
		let Some(device) = &cfg.device else {
			warn!("Circuit `{}` has no --device, skipping", cfg.name);
			return;
		};
		let Some((addr, transport_kind)) = parse_device(device) else {
			warn!("Circuit `{}`: unusable --device `{device}`, skipping", cfg.name);
			return;
		};

		let idx = self.circuits.len();
		let station: u8 = if cfg.random_address { rand::thread_rng().gen() } else { 1 };

		let up: Fwd<Vec<u8>> = fwd_to!([cx], on_circuit_frame(idx) as (Vec<u8>));
		let status: Fwd<DlStatus> = fwd_to!([cx], on_circuit_status(idx) as (DlStatus));

		let actor = match transport_kind {
			DeviceKind::Tcp => actor!(cx, DdcmpCircuit::init_tcp(addr, station, DDCMP_QMAX, false, up, status), ret_nop!()),
			DeviceKind::Telnet => actor!(cx, DdcmpCircuit::init_tcp(addr, station, DDCMP_QMAX, true, up, status), ret_nop!()),
			DeviceKind::Udp => actor!(cx, DdcmpCircuit::init_udp(addr, station, DDCMP_QMAX, up, status), ret_nop!()),
		};
		call!([actor], start());

		let routing = PtpRouting::new(ptp::Config {
			local,
			phase,
			ntype,
			blksize: MTU as u16,
			t3: cfg.t3,
			hello_time: Duration::from_secs(60),
			inbound_verification: None,
		});

		self.circuits.push(Circuit { name: cfg.name.clone(), actor, routing, listen_timer: MaxTimerKey::default(), hello_timer: MaxTimerKey::default() });

		let out = self.circuits[idx].routing.start();
		self.apply_routing_outcome(cx, idx, out);
	}

	fn on_circuit_frame(&mut self, cx: CX![], idx: usize, payload: Vec<u8>) {
		let Some(circuit) = self.circuits.get_mut(idx) else { return };
		let out = circuit.routing.receive(&payload);
		self.apply_routing_outcome(cx, idx, out);
	}

	fn on_circuit_status(&mut self, cx: CX![], idx: usize, status: DlStatus) {
		let Some(circuit) = self.circuits.get_mut(idx) else { return };
		match status {
			DlStatus::Up => {
				let out = circuit.routing.datalink_up();
				self.apply_routing_outcome(cx, idx, out);
			}
			DlStatus::Down | DlStatus::Halted => {
				let old_peer = circuit.routing.peer();
				let out = circuit.routing.datalink_down();
				self.apply_routing_outcome(cx, idx, out);
				if let Some(peer) = old_peer {
					self.abort_connections_to(cx, peer);
				}
			}
		}
	}

	fn on_listen_timeout(&mut self, cx: CX![], idx: usize) {
		let Some(circuit) = self.circuits.get_mut(idx) else { return };
		let old_peer = circuit.routing.peer();
		let out = circuit.routing.listen_timeout();
		self.apply_routing_outcome(cx, idx, out);
		if let Some(peer) = old_peer {
			self.abort_connections_to(cx, peer);
		}
	}

	fn on_hello_timeout(&mut self, cx: CX![], idx: usize) {
		let Some(circuit) = self.circuits.get_mut(idx) else { return };
		let hello = circuit.routing.make_hello(HELLO_TESTDATA_LEN);
		call!([circuit.actor], send_frame(hello));
		let interval = circuit.routing.hello_interval();
		timer_max!(&mut circuit.hello_timer, cx.now() + interval, [cx], on_hello_timeout(idx));
	}

	fn apply_routing_outcome(&mut self, cx: CX![], idx: usize, out: ptp::Outcome) {
		if let Some(circuit) = self.circuits.get(idx) {
			for bytes in out.sends {
				call!([circuit.actor], send_frame(bytes));
			}
		}

		for payload in out.delivered {
			let Some(circuit) = self.circuits.get(idx) else { break };
			let Some(remote) = circuit.routing.peer() else { continue };
			let nsp_out = self.nsp.receive(remote, &payload);
			self.apply_nsp_outcomes(cx, vec![nsp_out]);
		}

		if let Some(up) = out.running_changed {
			let name = self.circuits.get(idx).map(|c| c.name.clone()).unwrap_or_default();
			if up {
				info!("Circuit `{name}` routing-init adjacency up");
			} else {
				info!("Circuit `{name}` routing-init adjacency down");
			}
		}

		if out.fmt_error {
			if let Some(circuit) = self.circuits.get(idx) {
				warn!("Circuit `{}`: malformed routing-init frame, restarting adjacency", circuit.name);
			}
		}

		if out.restart_listen_timer {
			if let Some(circuit) = self.circuits.get_mut(idx) {
				let interval = circuit.routing.listen_interval();
				timer_max!(&mut circuit.listen_timer, cx.now() + interval, [cx], on_listen_timeout(idx));
			}
		}

		if out.arm_hello_timer {
			if let Some(circuit) = self.circuits.get_mut(idx) {
				let interval = circuit.routing.hello_interval();
				timer_max!(&mut circuit.hello_timer, cx.now() + interval, [cx], on_hello_timeout(idx));
			}
		}
	}

	/// Route an `Nsp`-addressed payload to whatever circuit currently holds
	/// that remote's adjacency. There is no area/level routing in scope
	/// (§1 non-goals): an unreachable remote is simply dropped with a log.
	fn send_to_remote(&mut self, remote: NodeId, payload: Vec<u8>) {
		let Some(circuit) = self.circuits.iter().find(|c| c.routing.peer() == Some(remote)) else {
			warn!("No circuit reaches node {remote}, dropping NSP frame");
			return;
		};
		let Some(wrapped) = circuit.routing.wrap_data(&payload) else {
			warn!("No circuit reaches node {remote}, dropping NSP frame");
			return;
		};
		call!([circuit.actor], send_frame(wrapped));
	}

	fn abort_connections_to(&mut self, cx: CX![], remote: NodeId) {
		let srcaddrs = self.nsp.connections_to(remote);
		let mut outcomes = Vec::with_capacity(srcaddrs.len());
		for srcaddr in srcaddrs {
			if let Ok(out) = self.nsp.abort(srcaddr, nsp::REASON_NO_LINK) {
				outcomes.push(out);
			}
		}
		self.apply_nsp_outcomes(cx, outcomes);
	}

	fn apply_nsp_outcomes(&mut self, cx: CX![], mut outcomes: Vec<nsp::Outcome>) {
		while let Some(out) = outcomes.pop() {
			for (remote, bytes) in out.sends {
				self.send_to_remote(remote, bytes);
			}
			for (srcaddr, interval) in out.arm_retransmit {
				let key = self.retransmit_timers.entry(srcaddr).or_default();
				timer_max!(key, cx.now() + interval, [cx], on_retransmit_timeout(srcaddr));
			}
			for srcaddr in out.cancel_retransmit {
				if let Some(key) = self.retransmit_timers.remove(&srcaddr) {
					cx.timer_max_del(key);
				}
			}
			for srcaddr in out.closed {
				self.retransmit_timers.remove(&srcaddr);
				self.session.on_connection_closed(srcaddr);
			}
			for event in out.events {
				let more = self.session.handle_event(&mut self.nsp, cx, event);
				outcomes.extend(more);
			}
		}
	}

	fn on_retransmit_timeout(&mut self, cx: CX![], srcaddr: u16) {
		let out = self.nsp.retransmit_timeout(srcaddr);
		self.apply_nsp_outcomes(cx, vec![out]);
	}

	fn on_connector_wake(&mut self, cx: CX![], object: u16, _buf: Slice) {
		let outcomes = self.session.on_connector_wake(&mut self.nsp, object);
		self.apply_nsp_outcomes(cx, outcomes);
	}
}

enum DeviceKind {
	Tcp,
	Telnet,
	Udp,
}

/// Parses a circuit's `--device` value into a transport kind and address.
/// The config grammar (§6, §10.3) has no explicit transport field, so this
/// reads a `tcp:`/`telnet:`/`udp:` scheme prefix (defaulting to `tcp:`),
/// matching the TCP/UDP-only backends `ddcmp::DdcmpCircuit` implements.
fn parse_device(device: &str) -> Option<(SocketAddr, DeviceKind)> {
	let (kind, rest) = match device.split_once(':') {
		Some(("tcp", rest)) => (DeviceKind::Tcp, rest),
		Some(("telnet", rest)) => (DeviceKind::Telnet, rest),
		Some(("udp", rest)) => (DeviceKind::Udp, rest),
		_ => (DeviceKind::Tcp, device),
	};
	rest.parse().ok().map(|addr| (addr, kind))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_device_defaults_to_tcp() {
		let (addr, kind) = parse_device("127.0.0.1:700").unwrap();
		assert_eq!(addr.port(), 700);
		assert!(matches!(kind, DeviceKind::Tcp));
	}

	#[test]
	fn parse_device_reads_scheme() {
		let (_, kind) = parse_device("udp:127.0.0.1:700").unwrap();
		assert!(matches!(kind, DeviceKind::Udp));
		let (_, kind) = parse_device("telnet:127.0.0.1:700").unwrap();
		assert!(matches!(kind, DeviceKind::Telnet));
	}

	#[test]
	fn parse_device_rejects_garbage() {
		assert!(parse_device("not-an-address").is_none());
	}
}
