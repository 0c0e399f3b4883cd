//! Session Control (Module H, §4.H): the object table, `ConnInit` payload
//! parsing, and dispatch to in-process module objects or subprocess "file"
//! objects over the JSON pipe protocol (§6).
//!
//! A [`Session`] is not itself a `stakker` actor — like `wireguard::Peer`, it
//! is plain state embedded in [`crate::node::Node`], and its methods that
//! need to register I/O (spawning a subprocess connector) take the owning
//! node's `cx` the same way `tunnel::Peer`'s methods take `CX![Wireguard]`.

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::thread;

use collections::bytes::Slice;
use log::{debug, error, trace, warn};
use runtime::Io;
use serde::{Deserialize, Serialize};
use stakker::{fwd_to, CX};

use crate::config::{ObjectConfig, ObjectHandler};
use crate::common::NodeId;
use crate::nsp::{self, Nsp, SessionEvent, REASON_NO_OBJ};
use crate::node::Node;

/// How a `ConnInit` payload named its destination object (§4.H).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Destination {
	number: Option<u16>,
	name: Option<String>,
}

/// Splits the object selector, then the optional user/password/account
/// fields, off the front of a `ConnInit` payload, per §4.H's three formats
/// plus the trailing credential fields every format may carry. Returns the
/// destination and whatever bytes remain (the caller's own connect data).
///
/// Grounded on pydecnet's `test_mirror.py` vector `00 19 01 00 04 PAUL 00`
/// (object 25 = MIRROR): a leading zero byte means an extended one-byte
/// object number follows; a nonzero leading byte is the number itself
/// (format 0). There is no surviving reference decoder for the by-name
/// formats (pydecnet's own `session.py` was not present in the retrieved
/// source), so format 1/2 are read the same way spec.md's grammar lays
/// them out literally; only the numbered path is exercised by a known
/// wire vector.
fn parse_destination(payload: &[u8]) -> Option<(Destination, &[u8])> {
	let mut rest = payload;
	let first = *rest.first()?;
	rest = &rest[1..];

	let dest = if first != 0 {
		Destination { number: Some(first as u16), name: None }
	} else {
		match rest.first().copied() {
			// format 2: <0><obj_num><fmt=2><object-name...> — number plus a
			// trailing name, kept only for diagnostics.
			Some(num) if rest.get(1) == Some(&2) => {
				rest = &rest[2..];
				let (name, after) = take_counted_string(rest)?;
				rest = after;
				Destination { number: Some(num as u16), name: Some(name) }
			}
			// format 0 extended: <0><num>, no name.
			Some(num) => {
				rest = &rest[1..];
				Destination { number: Some(num as u16), name: None }
			}
			// format 1: <0><name_len><name...>, no number.
			None => return None,
		}
	};

	// Optional flag byte gates the user/password/account triple.
	if let Some(&flags) = rest.first() {
		rest = &rest[1..];
		if flags & 0x01 != 0 {
			let (_user, after) = take_counted_bytes(rest)?;
			rest = after;
			let (_password, after) = take_counted_bytes(rest)?;
			rest = after;
			let (_account, after) = take_counted_bytes(rest)?;
			rest = after;
		}
	}

	Some((dest, rest))
}

fn take_counted_bytes(buf: &[u8]) -> Option<(&[u8], &[u8])> {
	let &len = buf.first()?;
	let len = len as usize;
	let buf = &buf[1..];
	if buf.len() < len {
		return None;
	}
	Some((&buf[..len], &buf[len..]))
}

fn take_counted_string(buf: &[u8]) -> Option<(String, &[u8])> {
	let (bytes, rest) = take_counted_bytes(buf)?;
	Some((bytes.iter().map(|&b| b as char).collect(), rest))
}

/// What object owns a live connection, so inbound `SessionEvent`s for it
/// can be routed without repeating the object lookup.
enum Owner {
	/// The built-in loopback test object (object 25, MIRROR).
	Mirror,
	/// A subprocess connector, identified by its object number and the
	/// handle that connector assigned this connection.
	File { object: u16, handle: u32 },
}

/// One line read from a subprocess's stdout or stderr pipe, handed across
/// the wake socket from the reader thread to the node thread.
enum Line {
	Out(String),
	Err(String),
}

/// Inbound JSON message from a subprocess object (§6): `{mtype, handle?, data?, ...}`.
#[derive(Deserialize)]
struct AppRequest {
	mtype: String,
	#[serde(default)]
	handle: u32,
	#[serde(default)]
	data: String,
	#[serde(default)]
	reason: u16,
}

#[derive(Deserialize)]
struct StderrLine {
	level: i32,
	message: String,
	#[serde(default)]
	args: Vec<serde_json::Value>,
}

/// Outbound JSON message to a subprocess object (§6).
#[derive(Serialize)]
struct AppMessage<'a> {
	#[serde(rename = "type")]
	kind: &'a str,
	handle: u32,
	data: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	reason: Option<u16>,
}

/// A spawned "file" object: one subprocess per configured object, reused
/// across every connection routed to it (pydecnet's `ProcessConnector`).
struct Connector {
	child: Child,
	wake: Io<UnixStream>,
	rx: Receiver<Line>,
	handles: HashMap<u32, u16>,
	next_handle: u32,
}

impl Connector {
	fn spawn(cfg: &ObjectConfig, path: &str, cx: CX![Node]) -> Option<Self> {
		let mut child = Command::new(path)
			.args(&cfg.argument)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.spawn()
			.map_err(|err| error!("Failed to start object `{}` ({path}): {err}", cfg.name))
			.ok()?;

		let stdout = child.stdout.take().expect("stdout was piped");
		let stderr = child.stderr.take().expect("stderr was piped");

		let (tx, rx) = std::sync::mpsc::channel();
		let (wake_local, wake_remote) = UnixStream::pair().map_err(|err| error!("Failed to create connector wake socket: {err}")).ok()?;
		wake_remote.set_nonblocking(true).ok();

		spawn_reader(stdout, tx.clone(), wake_local.try_clone().ok()?, Line::Out);
		spawn_reader(stderr, tx, wake_local, Line::Err);

		let fwd = fwd_to!([cx], on_connector_wake(cfg.number) as (Slice));
		let wake = Io::new(wake_remote, fwd);

		Some(Self { child, wake, rx, handles: HashMap::new(), next_handle: 1 })
	}

	fn alloc_handle(&mut self, srcaddr: u16) -> u32 {
		let handle = self.next_handle;
		self.next_handle += 1;
		self.handles.insert(handle, srcaddr);
		handle
	}

	fn handle_for(&self, srcaddr: u16) -> Option<u32> {
		self.handles.iter().find(|(_, &s)| s == srcaddr).map(|(&h, _)| h)
	}

	fn send(&mut self, kind: &str, handle: u32, data: &[u8], reason: Option<u16>) {
		let msg = AppMessage { kind, handle, data: data.iter().map(|&b| b as char).collect(), reason };
		let Ok(mut line) = serde_json::to_string(&msg) else { return };
		line.push('\n');
		let Some(stdin) = self.child.stdin.as_mut() else { return };
		if let Err(err) = stdin.write_all(line.as_bytes()) {
			error!("Failed to write to subprocess object pipe: {err}");
		}
	}
}

fn spawn_reader<R: std::io::Read + Send + 'static>(pipe: R, tx: Sender<Line>, mut wake: UnixStream, wrap: fn(String) -> Line) {
	thread::spawn(move || {
		let mut reader = std::io::BufReader::new(pipe);
		loop {
			let mut line = String::new();
			match std::io::BufRead::read_line(&mut reader, &mut line) {
				Ok(0) => break,
				Ok(_) => {
					let line = line.trim_end_matches(['\r', '\n']).to_string();
					if line.is_empty() {
						continue;
					}
					if tx.send(wrap(line)).is_err() {
						break;
					}
					if wake.write_all(&[0]).is_err() {
						break;
					}
				}
				Err(_) => break,
			}
		}
	});
}

fn stderr_level(level: i32) -> log::Level {
	match level {
		l if l >= 40 => log::Level::Error,
		l if l >= 30 => log::Level::Warn,
		l if l >= 20 => log::Level::Info,
		l if l >= 10 => log::Level::Debug,
		_ => log::Level::Trace,
	}
}

pub struct Session {
	objects: Vec<ObjectConfig>,
	connections: HashMap<u16, Owner>,
	connectors: HashMap<u16, Connector>,
}

impl Session {
	pub fn new(objects: Vec<ObjectConfig>) -> Self {
		Self { objects, connections: HashMap::new(), connectors: HashMap::new() }
	}

	fn lookup(&self, dest: &Destination) -> Option<&ObjectConfig> {
		if let Some(number) = dest.number {
			if let Some(obj) = self.objects.iter().find(|o| o.number == number) {
				return Some(obj);
			}
		}
		if let Some(name) = &dest.name {
			return self.objects.iter().find(|o| &o.name == name);
		}
		None
	}

	/// Feed one event handed up from NSP through Session Control, returning
	/// any further NSP-level outcomes it triggers.
	pub fn handle_event(&mut self, nsp: &mut Nsp, cx: CX![Node], event: SessionEvent) -> Vec<nsp::Outcome> {
		match event {
			SessionEvent::ConnectInit { srcaddr, remote, payload } => self.on_connect_init(nsp, cx, srcaddr, remote, payload),
			SessionEvent::Accepted { srcaddr, .. } => {
				debug!("Outbound connection {srcaddr} accepted by peer (no local object awaiting it)");
				Vec::new()
			}
			SessionEvent::Data { srcaddr, payload } => self.on_data(nsp, srcaddr, payload),
			SessionEvent::Interrupt { srcaddr, payload } => self.on_interrupt(srcaddr, payload),
			SessionEvent::Disconnected { srcaddr, reason, payload } => self.on_disconnected(srcaddr, reason, payload),
			SessionEvent::Unreachable { srcaddr } => {
				self.connections.remove(&srcaddr);
				warn!("Outbound connection {srcaddr} could not reach its destination node");
				Vec::new()
			}
		}
	}

	fn on_connect_init(&mut self, nsp: &mut Nsp, cx: CX![Node], srcaddr: u16, remote: NodeId, payload: Vec<u8>) -> Vec<nsp::Outcome> {
		let Some((dest, data)) = parse_destination(&payload) else {
			warn!("Malformed ConnInit payload from {remote}, rejecting");
			return reject(nsp, srcaddr, REASON_NO_OBJ);
		};

		let Some(object) = self.lookup(&dest) else {
			debug!("ConnInit from {remote} for unknown object {dest:?}, rejecting NO_OBJ");
			return reject(nsp, srcaddr, REASON_NO_OBJ);
		};
		let object = object.clone();

		match &object.handler {
			ObjectHandler::Module if object.name.eq_ignore_ascii_case("mirror") => {
				self.connections.insert(srcaddr, Owner::Mirror);
				match nsp.accept(srcaddr, vec![0xff, 0xff]) {
					Ok(out) => vec![out],
					Err(err) => {
						error!("Failed to accept MIRROR connection: {err}");
						Vec::new()
					}
				}
			}
			ObjectHandler::Module => {
				debug!("ConnInit for module object `{}` has no in-process handler, rejecting NO_OBJ", object.name);
				reject(nsp, srcaddr, REASON_NO_OBJ)
			}
			ObjectHandler::File { path } => {
				let connector = match self.connectors.entry(object.number) {
					std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
					std::collections::hash_map::Entry::Vacant(e) => match Connector::spawn(&object, path, cx) {
						Some(c) => e.insert(c),
						None => return reject(nsp, srcaddr, REASON_NO_OBJ),
					},
				};
				let handle = connector.alloc_handle(srcaddr);
				connector.send("connect", handle, data, None);
				self.connections.insert(srcaddr, Owner::File { object: object.number, handle });
				// Acceptance is asynchronous: the subprocess calls back with
				// its own `accept`/`reject` once it has decided.
				Vec::new()
			}
		}
	}

	fn on_data(&mut self, nsp: &mut Nsp, srcaddr: u16, payload: Vec<u8>) -> Vec<nsp::Outcome> {
		match self.connections.get(&srcaddr) {
			Some(Owner::Mirror) => {
				let mut reply = vec![0x01];
				reply.extend_from_slice(payload.get(1..).unwrap_or(&[]));
				match nsp.send(srcaddr, reply) {
					Ok(out) => vec![out],
					Err(err) => {
						warn!("MIRROR echo on {srcaddr} failed: {err}");
						Vec::new()
					}
				}
			}
			Some(&Owner::File { object, handle }) => {
				if let Some(connector) = self.connectors.get_mut(&object) {
					connector.send("data", handle, &payload, None);
				}
				Vec::new()
			}
			None => {
				trace!("Data on connection {srcaddr} with no registered owner");
				Vec::new()
			}
		}
	}

	fn on_interrupt(&mut self, srcaddr: u16, payload: Vec<u8>) -> Vec<nsp::Outcome> {
		if let Some(&Owner::File { object, handle }) = self.connections.get(&srcaddr) {
			if let Some(connector) = self.connectors.get_mut(&object) {
				connector.send("interrupt", handle, &payload, None);
			}
		}
		Vec::new()
	}

	fn on_disconnected(&mut self, srcaddr: u16, reason: u16, payload: Vec<u8>) -> Vec<nsp::Outcome> {
		if let Some(Owner::File { object, handle }) = self.connections.remove(&srcaddr) {
			if let Some(connector) = self.connectors.get_mut(&object) {
				connector.send("disconnect", handle, &payload, Some(reason));
				connector.handles.remove(&handle);
			}
		}
		Vec::new()
	}

	/// Called by [`crate::node::Node`] when a connector's wake socket fires:
	/// drain its reader-thread queue and act on every buffered line.
	pub fn on_connector_wake(&mut self, nsp: &mut Nsp, object: u16) -> Vec<nsp::Outcome> {
		let Some(connector) = self.connectors.get_mut(&object) else { return Vec::new() };

		let mut lines = Vec::new();
		loop {
			match connector.rx.try_recv() {
				Ok(line) => lines.push(line),
				Err(TryRecvError::Empty) => break,
				Err(TryRecvError::Disconnected) => break,
			}
		}

		let mut outcomes = Vec::new();
		let mut abort_all = false;

		for line in lines {
			match line {
				Line::Err(text) => match serde_json::from_str::<StderrLine>(&text) {
					Ok(parsed) => log::log!(stderr_level(parsed.level), "{}", format_args_message(&parsed.message, &parsed.args)),
					Err(_) => debug!("object {object} (stderr): {text}"),
				},
				Line::Out(text) => match serde_json::from_str::<AppRequest>(&text) {
					Ok(req) => outcomes.extend(self.dispatch_app_request(nsp, object, req)),
					Err(err) => {
						error!("Malformed request from object {object}: {err}");
						abort_all = true;
					}
				},
			}
		}

		if abort_all {
			outcomes.extend(self.abort_connector(nsp, object));
		}

		outcomes
	}

	fn dispatch_app_request(&mut self, nsp: &mut Nsp, object: u16, req: AppRequest) -> Vec<nsp::Outcome> {
		let Some(connector) = self.connectors.get_mut(&object) else { return Vec::new() };
		let Some(&srcaddr) = connector.handles.get(&req.handle) else {
			warn!("object {object} referenced unknown handle {}", req.handle);
			return Vec::new();
		};
		let data = req.data.chars().map(|c| c as u8).collect::<Vec<u8>>();

		let result = match req.mtype.as_str() {
			"accept" => nsp.accept(srcaddr, data),
			"reject" => {
				connector.handles.remove(&req.handle);
				self.connections.remove(&srcaddr);
				nsp.reject(srcaddr, req.reason, data)
			}
			"disconnect" => {
				connector.handles.remove(&req.handle);
				self.connections.remove(&srcaddr);
				nsp.disconnect(srcaddr, req.reason, data)
			}
			"abort" => {
				connector.handles.remove(&req.handle);
				self.connections.remove(&srcaddr);
				nsp.abort(srcaddr, req.reason)
			}
			"interrupt" => nsp.interrupt(srcaddr, data),
			"data" => nsp.send(srcaddr, data),
			"setsockopt" | "connect" => {
				debug!("object {object} issued unsupported API request `{}`", req.mtype);
				return Vec::new();
			}
			other => {
				error!("object {object} issued unknown API request `{other}`, aborting its connections");
				return self.abort_connector(nsp, object);
			}
		};

		match result {
			Ok(out) => vec![out],
			Err(err) => {
				warn!("object {object} request `{}` on connection {srcaddr} failed: {err}", req.mtype);
				Vec::new()
			}
		}
	}

	/// On an unhandled connector error (§7): abort every connection it still
	/// owns (graceful abort if running, reject if still connecting) and drop
	/// its handle table.
	fn abort_connector(&mut self, nsp: &mut Nsp, object: u16) -> Vec<nsp::Outcome> {
		let Some(connector) = self.connectors.get_mut(&object) else { return Vec::new() };
		let handles = std::mem::take(&mut connector.handles);
		let mut outcomes = Vec::new();
		for (_, srcaddr) in handles {
			self.connections.remove(&srcaddr);
			let running = matches!(nsp.connection(srcaddr).map(|c| c.state), Some(nsp::State::Run));
			let result = if running {
				nsp.abort(srcaddr, nsp::REASON_NO_LINK)
			} else {
				nsp.reject(srcaddr, nsp::REASON_NO_OBJ, Vec::new())
			};
			if let Ok(out) = result {
				outcomes.push(out);
			}
		}
		outcomes
	}

	/// The connection was torn down at the NSP layer (peer disconnect
	/// already delivered, retransmit exhausted, etc.) without an explicit
	/// `Disconnected` event reaching us first; drop any bookkeeping.
	pub fn on_connection_closed(&mut self, srcaddr: u16) {
		self.connections.remove(&srcaddr);
	}
}

fn reject(nsp: &mut Nsp, srcaddr: u16, reason: u16) -> Vec<nsp::Outcome> {
	match nsp.reject_reserved(srcaddr, reason, Vec::new()) {
		Ok(out) => vec![out],
		Err(err) => {
			error!("Failed to reject connection {srcaddr}: {err}");
			Vec::new()
		}
	}
}

fn format_args_message(message: &str, args: &[serde_json::Value]) -> String {
	if args.is_empty() {
		return message.to_string();
	}
	let mut out = String::new();
	let mut parts = message.split("{}");
	out.push_str(parts.next().unwrap_or(""));
	for (part, arg) in parts.zip(args.iter()) {
		out.push_str(&arg.to_string());
		out.push_str(part);
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_mirror_conn_init_payload() {
		let payload = [0x00, 0x19, 0x01, 0x00, 0x04, b'P', b'A', b'U', b'L', 0x00];
		let (dest, rest) = parse_destination(&payload).unwrap();
		assert_eq!(dest.number, Some(25));
		assert!(rest.is_empty());
	}

	#[test]
	fn format_zero_reads_plain_object_number() {
		let payload = [19u8, 0x00];
		let (dest, rest) = parse_destination(&payload).unwrap();
		assert_eq!(dest.number, Some(19));
		assert!(rest.is_empty());
	}

	#[test]
	fn lookup_prefers_number_then_name() {
		let objects = vec![ObjectConfig { name: "MIRROR".into(), number: 25, handler: ObjectHandler::Module, authentication: false, argument: Vec::new() }];
		let session = Session::new(objects);
		assert!(session.lookup(&Destination { number: Some(25), name: None }).is_some());
		assert!(session.lookup(&Destination { number: Some(99), name: Some("MIRROR".into()) }).is_some());
		assert!(session.lookup(&Destination { number: Some(99), name: None }).is_none());
	}

	#[test]
	fn mirror_echo_prefixes_reply_with_loop_response_type() {
		let mut reply = vec![0x01];
		reply.extend_from_slice(&[0xaa, 0xbb]);
		assert_eq!(reply, vec![0x01, 0xaa, 0xbb]);
	}
}
