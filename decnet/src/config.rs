//! Configuration reader (§6 "Configuration surface", §10.3): a line-oriented
//! parser over the `circuit`/`routing`/`node`/`nsp` grammar that produces a
//! validated [`NodeConfig`]. This is the only place textual configuration is
//! parsed; everything downstream consumes the typed value.

use std::time::Duration;

use crate::common::NodeId;
use crate::error::ConfigError;
use crate::routing::packet::NodeType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitKind {
	Ethernet,
	Gre,
	Multinet,
	SimhDmc,
	Ddcmp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitConfig {
	pub name: String,
	pub cost: u8,
	pub t3: Duration,
	pub console: Option<Vec<u8>>,
	pub kind: CircuitKind,
	pub device: Option<String>,
	pub random_address: bool,
}

impl Default for CircuitConfig {
	fn default() -> Self {
		Self { name: String::new(), cost: 1, t3: Duration::from_secs(10), console: None, kind: CircuitKind::Ddcmp, device: None, random_address: false }
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingType {
	L2Router,
	L1Router,
	Endnode,
	Phase3Router,
	Phase3Endnode,
	Phase2,
}

impl RoutingType {
	/// The routing-init [`NodeType`] this declaration implies (Phase II has none).
	pub fn ntype(self) -> Option<NodeType> {
		match self {
			Self::L2Router => Some(NodeType::L2Router),
			Self::L1Router | Self::Phase3Router => Some(NodeType::L1Router),
			Self::Endnode | Self::Phase3Endnode => Some(NodeType::Endnode),
			Self::Phase2 => None,
		}
	}

	/// The routing-init phase this declaration speaks.
	pub fn phase(self) -> crate::routing::ptp::Phase {
		use crate::routing::ptp::Phase;
		match self {
			Self::L2Router | Self::L1Router | Self::Endnode => Phase::Four,
			Self::Phase3Router | Self::Phase3Endnode => Phase::Three,
			Self::Phase2 => Phase::Two,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingConfig {
	pub id: NodeId,
	pub ntype: RoutingType,
	pub maxhops: u8,
	pub maxcost: u16,
}

impl Default for RoutingConfig {
	fn default() -> Self {
		Self { id: NodeId::new(0, 0).unwrap(), ntype: RoutingType::Endnode, maxhops: 16, maxcost: 512 }
	}
}

/// How a configured [`crate::session::ObjectEntry`] dispatches inbound work.
/// Not part of spec.md's literal grammar (§6 lists only `circuit`/`routing`/
/// `node`/`nsp`), but the data model (§3) names `Object{number, name,
/// handler, authentication, argument[]}` as something a complete node must
/// load from configuration, and `application.py`'s `obj.file`/`obj.argument`
/// usage (original_source) is what this stanza is grounded on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectHandler {
	Module,
	File { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectConfig {
	pub name: String,
	pub number: u16,
	pub handler: ObjectHandler,
	pub authentication: bool,
	pub argument: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NspConfig {
	pub max_connections: u16,
	pub weight: u32,
	pub delay: f64,
}

impl Default for NspConfig {
	fn default() -> Self {
		Self { max_connections: 32, weight: 3, delay: 2 }
	}
}

/// A fully parsed and validated configuration, ready to hand to [`crate::node::Node`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeConfig {
	pub node: Option<RoutingConfig>,
	pub circuits: Vec<CircuitConfig>,
	pub routing: Vec<RoutingConfig>,
	pub nsp: NspConfig,
	pub objects: Vec<ObjectConfig>,
}

/// Parse the full text of a configuration file.
pub fn parse(text: &str) -> Result<NodeConfig, ConfigError> {
	let mut cfg = NodeConfig::default();

	for (lineno, raw) in text.lines().enumerate() {
		let line = raw.trim();
		if line.is_empty() || line.starts_with('#') {
			continue;
		}
		let lineno = lineno + 1;

		let mut tokens = line.split_whitespace().peekable();
		let command = tokens.next().expect("line is non-empty after trim");

		match command {
			"circuit" => cfg.circuits.push(parse_circuit(lineno, tokens)?),
			"routing" => cfg.routing.push(parse_routing(lineno, tokens)?),
			"node" => cfg.node = Some(parse_routing(lineno, tokens)?),
			"nsp" => cfg.nsp = parse_nsp(lineno, tokens)?,
			"object" => cfg.objects.push(parse_object(lineno, tokens)?),
			other => return Err(ConfigError { line: lineno, message: format!("unrecognised command `{other}`") }),
		}
	}

	Ok(cfg)
}

/// Pulls `--opt value` / `--flag` pairs off a token stream, leaving bare
/// positional arguments for the caller to consume first.
struct Options<'a, I: Iterator<Item = &'a str>> {
	tokens: std::iter::Peekable<I>,
	line: usize,
}

impl<'a, I: Iterator<Item = &'a str>> Options<'a, I> {
	fn next_positional(&mut self, what: &'static str) -> Result<&'a str, ConfigError> {
		self.tokens.next().ok_or_else(|| ConfigError { line: self.line, message: format!("missing {what}") })
	}

	/// Returns `Some(name)` if the next token is a `--name` option, consuming it.
	fn next_opt_name(&mut self) -> Option<&'a str> {
		match self.tokens.peek() {
			Some(tok) if tok.starts_with("--") => {
				self.tokens.next();
				Some(&tok[2..])
			}
			_ => None,
		}
	}

	/// Consumes and returns the value token following an option name, unless
	/// the next token is itself another `--option` (treats this one as a flag).
	fn opt_value(&mut self) -> Option<&'a str> {
		match self.tokens.peek() {
			Some(tok) if !tok.starts_with("--") => self.tokens.next(),
			_ => None,
		}
	}

	fn err(&self, message: impl Into<String>) -> ConfigError {
		ConfigError { line: self.line, message: message.into() }
	}
}

fn parse_circuit<'a>(line: usize, tokens: impl Iterator<Item = &'a str>) -> Result<CircuitConfig, ConfigError> {
	let mut opts = Options { tokens: tokens.peekable(), line };
	let mut out = CircuitConfig::default();
	out.name = opts.next_positional("circuit name")?.to_string();

	while let Some(name) = opts.next_opt_name() {
		match name {
			"cost" => {
				let v = opts.opt_value().ok_or_else(|| opts.err("--cost requires a value"))?;
				let cost: u8 = v.parse().map_err(|_| opts.err(format!("invalid --cost value `{v}`")))?;
				if !(1..=25).contains(&cost) {
					return Err(opts.err("--cost must be between 1 and 25"));
				}
				out.cost = cost;
			}
			"t3" => {
				let v = opts.opt_value().ok_or_else(|| opts.err("--t3 requires a value"))?;
				let secs: u64 = v.parse().map_err(|_| opts.err(format!("invalid --t3 value `{v}`")))?;
				out.t3 = Duration::from_secs(secs);
			}
			"console" => {
				out.console = match opts.opt_value() {
					Some(hex) => Some(parse_hex(&opts, hex)?),
					None => Some(Vec::new()),
				};
			}
			"type" => {
				let v = opts.opt_value().ok_or_else(|| opts.err("--type requires a value"))?;
				out.kind = match v {
					"Ethernet" => CircuitKind::Ethernet,
					"GRE" => CircuitKind::Gre,
					"Multinet" => CircuitKind::Multinet,
					"SimhDMC" => CircuitKind::SimhDmc,
					"DDCMP" => CircuitKind::Ddcmp,
					other => return Err(opts.err(format!("unknown circuit --type `{other}`"))),
				};
			}
			"device" => {
				let v = opts.opt_value().ok_or_else(|| opts.err("--device requires a value"))?;
				out.device = Some(v.to_string());
			}
			"random-address" => out.random_address = true,
			other => return Err(opts.err(format!("unrecognised circuit option `--{other}`"))),
		}
	}

	Ok(out)
}

fn parse_routing<'a>(line: usize, tokens: impl Iterator<Item = &'a str>) -> Result<RoutingConfig, ConfigError> {
	let mut opts = Options { tokens: tokens.peekable(), line };
	let mut out = RoutingConfig::default();

	let id_tok = opts.next_positional("node id")?;
	out.id = parse_node_id(&opts, id_tok)?;

	while let Some(name) = opts.next_opt_name() {
		match name {
			"type" => {
				let v = opts.opt_value().ok_or_else(|| opts.err("--type requires a value"))?;
				out.ntype = match v {
					"l2router" => RoutingType::L2Router,
					"l1router" => RoutingType::L1Router,
					"endnode" => RoutingType::Endnode,
					"phase3router" => RoutingType::Phase3Router,
					"phase3endnode" => RoutingType::Phase3Endnode,
					"phase2" => RoutingType::Phase2,
					other => return Err(opts.err(format!("unknown routing --type `{other}`"))),
				};
			}
			"maxhops" => {
				let v = opts.opt_value().ok_or_else(|| opts.err("--maxhops requires a value"))?;
				let n: u8 = v.parse().map_err(|_| opts.err(format!("invalid --maxhops value `{v}`")))?;
				if !(1..=30).contains(&n) {
					return Err(opts.err("--maxhops must be between 1 and 30"));
				}
				out.maxhops = n;
			}
			"maxcost" => {
				let v = opts.opt_value().ok_or_else(|| opts.err("--maxcost requires a value"))?;
				let n: u16 = v.parse().map_err(|_| opts.err(format!("invalid --maxcost value `{v}`")))?;
				if !(1..=1022).contains(&n) {
					return Err(opts.err("--maxcost must be between 1 and 1022"));
				}
				out.maxcost = n;
			}
			other => return Err(opts.err(format!("unrecognised routing option `--{other}`"))),
		}
	}

	Ok(out)
}

fn parse_nsp<'a>(line: usize, tokens: impl Iterator<Item = &'a str>) -> Result<NspConfig, ConfigError> {
	let mut opts = Options { tokens: tokens.peekable(), line };
	let mut out = NspConfig::default();

	while let Some(name) = opts.next_opt_name() {
		match name {
			"max-connections" => {
				let v = opts.opt_value().ok_or_else(|| opts.err("--max-connections requires a value"))?;
				out.max_connections = v.parse().map_err(|_| opts.err(format!("invalid --max-connections value `{v}`")))?;
			}
			"nsp-weight" => {
				let v = opts.opt_value().ok_or_else(|| opts.err("--nsp-weight requires a value"))?;
				out.weight = v.parse().map_err(|_| opts.err(format!("invalid --nsp-weight value `{v}`")))?;
			}
			"nsp-delay" => {
				let v = opts.opt_value().ok_or_else(|| opts.err("--nsp-delay requires a value"))?;
				out.delay = v.parse().map_err(|_| opts.err(format!("invalid --nsp-delay value `{v}`")))?;
			}
			other => return Err(opts.err(format!("unrecognised nsp option `--{other}`"))),
		}
	}

	Ok(out)
}

fn parse_object<'a>(line: usize, tokens: impl Iterator<Item = &'a str>) -> Result<ObjectConfig, ConfigError> {
	let mut opts = Options { tokens: tokens.peekable(), line };
	let name = opts.next_positional("object name")?.to_string();
	let mut number = None;
	let mut file = None;
	let mut is_module = false;
	let mut authentication = false;
	let mut argument = Vec::new();

	while let Some(name) = opts.next_opt_name() {
		match name {
			"number" => {
				let v = opts.opt_value().ok_or_else(|| opts.err("--number requires a value"))?;
				number = Some(v.parse().map_err(|_| opts.err(format!("invalid --number value `{v}`")))?);
			}
			"file" => {
				let v = opts.opt_value().ok_or_else(|| opts.err("--file requires a value"))?;
				file = Some(v.to_string());
			}
			"module" => is_module = true,
			"auth" => {
				let v = opts.opt_value().ok_or_else(|| opts.err("--auth requires a value"))?;
				authentication = match v {
					"on" => true,
					"off" => false,
					other => return Err(opts.err(format!("invalid --auth value `{other}`"))),
				};
			}
			"argument" => {
				let v = opts.opt_value().ok_or_else(|| opts.err("--argument requires a value"))?;
				argument.push(v.to_string());
			}
			other => return Err(opts.err(format!("unrecognised object option `--{other}`"))),
		}
	}

	let number = number.ok_or_else(|| opts.err("object stanza requires --number"))?;
	let handler = match (is_module, file) {
		(true, None) => ObjectHandler::Module,
		(false, Some(path)) => ObjectHandler::File { path },
		(true, Some(_)) => return Err(opts.err("object cannot be both --module and --file")),
		(false, None) => return Err(opts.err("object requires either --module or --file")),
	};

	Ok(ObjectConfig { name, number, handler, authentication, argument })
}

fn parse_node_id<'a, I: Iterator<Item = &'a str>>(opts: &Options<'a, I>, tok: &str) -> Result<NodeId, ConfigError> {
	let (area, node) = match tok.split_once('.') {
		Some((a, n)) => (a.parse().map_err(|_| opts.err(format!("invalid area in node id `{tok}`")))?, n.parse().map_err(|_| opts.err(format!("invalid node in node id `{tok}`")))?),
		None => (0u8, tok.parse().map_err(|_| opts.err(format!("invalid node id `{tok}`")))?),
	};
	NodeId::new(area, node).ok_or_else(|| opts.err(format!("node id `{tok}` out of range")))
}

fn parse_hex<'a, I: Iterator<Item = &'a str>>(opts: &Options<'a, I>, tok: &str) -> Result<Vec<u8>, ConfigError> {
	let tok = tok.strip_prefix("0x").unwrap_or(tok);
	if tok.len() % 2 != 0 {
		return Err(opts.err(format!("hex value `{tok}` has odd length")));
	}
	(0..tok.len())
		.step_by(2)
		.map(|i| u8::from_str_radix(&tok[i..i + 2], 16).map_err(|_| opts.err(format!("invalid hex byte in `{tok}`"))))
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_circuit_and_routing_stanzas() {
		let text = "\
circuit CIRC-1 --cost 3 --t3 12 --type DDCMP --device /dev/ttyS0
routing 1.2 --type l2router --maxhops 20 --maxcost 900
node 1.1 --type l2router
nsp --max-connections 16 --nsp-weight 5 --nsp-delay 1.5
";
		let cfg = parse(text).unwrap();
		assert_eq!(cfg.circuits.len(), 1);
		assert_eq!(cfg.circuits[0].name, "CIRC-1");
		assert_eq!(cfg.circuits[0].cost, 3);
		assert_eq!(cfg.circuits[0].t3, Duration::from_secs(12));
		assert_eq!(cfg.circuits[0].kind, CircuitKind::Ddcmp);
		assert_eq!(cfg.circuits[0].device.as_deref(), Some("/dev/ttyS0"));

		assert_eq!(cfg.routing.len(), 1);
		assert_eq!(cfg.routing[0].id, NodeId::new(1, 2).unwrap());
		assert_eq!(cfg.routing[0].ntype, RoutingType::L2Router);
		assert_eq!(cfg.routing[0].maxhops, 20);

		let node = cfg.node.unwrap();
		assert_eq!(node.id, NodeId::new(1, 1).unwrap());

		assert_eq!(cfg.nsp.max_connections, 16);
		assert_eq!(cfg.nsp.weight, 5);
		assert_eq!(cfg.nsp.delay, 1.5);
	}

	#[test]
	fn out_of_range_cost_is_a_config_error() {
		let err = parse("circuit C --cost 99\n").unwrap_err();
		assert_eq!(err.line, 1);
	}

	#[test]
	fn unrecognised_command_reports_line_number() {
		let err = parse("circuit C\nbogus x\n").unwrap_err();
		assert_eq!(err.line, 2);
	}

	#[test]
	fn console_hex_value_parses() {
		let cfg = parse("circuit C --console 0aff\n").unwrap();
		assert_eq!(cfg.circuits[0].console, Some(vec![0x0a, 0xff]));
	}

	#[test]
	fn comments_and_blank_lines_are_skipped() {
		let cfg = parse("# a comment\n\ncircuit C\n").unwrap();
		assert_eq!(cfg.circuits.len(), 1);
	}
}
