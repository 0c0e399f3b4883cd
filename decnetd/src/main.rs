//! `decnetd`: loads a node configuration file and runs the DECnet node it
//! describes until Ctrl-C (§10.5).

use std::fs;
use std::process::ExitCode;

use decnet::config;
use decnet::node::Node;
use log::{error, info, LevelFilter};
use runtime::logger::Logger;
use stakker::{actor, ret_nop, ActorOwn};

static LOGGER: Logger = Logger;

fn main() -> ExitCode {
	log::set_logger(&LOGGER).expect("logger installed exactly once");
	log::set_max_level(LevelFilter::Info);

	let Some(path) = std::env::args().nth(1) else {
		error!("usage: decnetd <config-file>");
		return ExitCode::FAILURE;
	};

	let text = match fs::read_to_string(&path) {
		Ok(text) => text,
		Err(err) => {
			error!("Failed to read `{path}`: {err}");
			return ExitCode::FAILURE;
		}
	};

	let cfg = match config::parse(&text) {
		Ok(cfg) => cfg,
		Err(err) => {
			error!("Configuration error at line {}: {}", err.line, err.message);
			return ExitCode::FAILURE;
		}
	};

	let mut stakker = runtime::rt::init();
	let node: ActorOwn<Node> = actor!(&mut stakker, Node::init(cfg), ret_nop!());
	if node.is_zombie(&stakker) {
		error!("Failed to initialise node from `{path}`");
		return ExitCode::FAILURE;
	}

	info!("decnetd running, configured from `{path}`");
	let result = runtime::rt::exec(&mut stakker, || {
		info!("decnetd shutting down");
		drop(node);
	});

	match result {
		Ok(()) => ExitCode::SUCCESS,
		Err(()) => ExitCode::FAILURE,
	}
}
