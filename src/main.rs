use clap::{Arg, Command};
use std::path::Path;
use std::process::exit;
use std::sync::Arc;

use namesync::config::Config;
use namesync::dispatcher::Dispatcher;
use namesync::error::SyncError;
use namesync::face::MemoryBus;
use namesync::logging;
use namesync::signer::NullSigner;

fn exit_code(e: &SyncError) -> i32 {
	match e {
		SyncError::InvalidConfig { .. } => 1,
		SyncError::Storage(_) | SyncError::Io(_) | SyncError::IntegrityMismatch { .. } => 2,
		SyncError::Face(_) => 3,
		_ => 2,
	}
}

async fn run(dir: &str) -> Result<(), SyncError> {
	let root = Path::new(dir);
	let config = Config::load(root)?;

	// single-process topology: the dispatcher talks to an in-memory bus.
	// A network daemon would hand in its own Face implementation here.
	let bus = MemoryBus::new();
	let dispatcher = Dispatcher::new(config, root, bus.face(), Arc::new(NullSigner))?;

	println!("namesync running for {} (ctrl-c to stop)", root.display());
	let _ = tokio::signal::ctrl_c().await;

	dispatcher.shutdown();
	bus.shutdown();
	Ok(())
}

fn dump(dir: &str) -> Result<(), SyncError> {
	let root = Path::new(dir);
	let config = Config::load(root)?;

	let sync_log = namesync::sync_log::SyncLog::open(
		&config.sync_log_path(root),
		config.device(),
	)?;
	let action_log = namesync::action_log::ActionLog::open(
		&config.action_log_path(root),
		Arc::new(sync_log),
		&config.shared_folder,
		&config.app_name,
		config.freshness_secs,
		Arc::new(NullSigner),
	)?;

	let (actions, _) = action_log.lookup_actions_in_folder(&config.shared_folder, 0, 100)?;
	let actions: Vec<serde_json::Value> = actions
		.into_iter()
		.map(|(device, seq, item)| {
			serde_json::json!({
				"device": device.to_string(),
				"seq": seq,
				"type": format!("{:?}", item.action_type),
				"filename": item.filename,
				"version": item.version,
				"timestamp": item.timestamp,
			})
		})
		.collect();

	let files: Vec<serde_json::Value> = action_log
		.file_state()
		.list_live()?
		.into_iter()
		.map(|entry| {
			serde_json::json!({
				"filename": entry.filename,
				"device": entry.device.to_string(),
				"seq": entry.seq,
				"version": entry.version,
				"complete": entry.is_complete,
			})
		})
		.collect();

	let report = serde_json::json!({ "actions": actions, "files": files });
	println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
	Ok(())
}

fn main() {
	logging::init_tracing();

	let command = Command::new("namesync")
		.version("0.1.0")
		.about("Peer-to-peer folder synchronization over named data")
		.subcommand_required(true)
		.subcommand(
			Command::new("run")
				.about("Run the synchronization core for a folder")
				.arg(Arg::new("dir").required(true)),
		)
		.subcommand(
			Command::new("dump")
				.about("Dump the action log and file state of a folder")
				.arg(Arg::new("dir").required(true)),
		);
	let matches = match command.try_get_matches() {
		Ok(matches) => matches,
		Err(e) => {
			let code = if e.use_stderr() { 1 } else { 0 };
			let _ = e.print();
			exit(code);
		}
	};

	let result = if let Some(matches) = matches.subcommand_matches("run") {
		let dir = matches.get_one::<String>("dir").expect("required").clone();
		let runtime = match tokio::runtime::Runtime::new() {
			Ok(runtime) => runtime,
			Err(e) => {
				eprintln!("cannot start runtime: {}", e);
				exit(2);
			}
		};
		runtime.block_on(run(&dir))
	} else if let Some(matches) = matches.subcommand_matches("dump") {
		let dir = matches.get_one::<String>("dir").expect("required");
		dump(dir)
	} else {
		Ok(())
	};

	if let Err(e) = result {
		eprintln!("namesync: {}", e);
		exit(exit_code(&e));
	}
}

// vim: ts=4
