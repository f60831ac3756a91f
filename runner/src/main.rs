mod bootstrap;
mod logger;

use nucleon::node::BootError;
use nucleon::prelude::*;
use slog::{error, info};
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::process;

fn build_logger() -> slog::Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Debug);
    builder.destination(Destination::Stderr);
    builder.build().expect("terminal logger")
}

fn load_config() -> Result<Config, i32> {
    match std::env::args().nth(1) {
        Some(path) => serdeconv::from_toml_file(&path).map_err(|err| {
            eprintln!("cannot load config {}: {}", path, err);
            1
        }),
        None => Ok(Config::default()),
    }
}

fn main() {
    let config = match load_config() {
        Ok(config) => config,
        Err(code) => process::exit(code),
    };

    let log = build_logger();
    let modules = ModuleRegistry::new();
    modules.register("logger", || Box::new(logger::LogService::new()));
    modules.register("bootstrap", || Box::new(bootstrap::Bootstrap));

    match Node::start(config, modules, log.clone()) {
        Ok(node) => {
            info!(log, "node started");
            node.run();
        }
        Err(err) => {
            error!(log, "boot failed"; "error" => %err);
            let code = match err {
                BootError::Bootstrap(_) => 2,
                _ => 1,
            };
            process::exit(code);
        }
    }
}
