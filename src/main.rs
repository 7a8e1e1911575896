use std::{env, panic, process};

use clap::Parser;

use libcanopy::cli::Options;
use libcanopy::logging;

fn main() {
    panic::set_hook(Box::new(|panic_info| {
        let message = match panic_info.payload().downcast_ref::<&str>() {
            Some(&message) => message.to_string(),
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(message) => message.clone(),
                None => "<no message>".to_string(),
            },
        };

        log::error!(
            "canopy crashed! You are running canopy {}.",
            env!("CARGO_PKG_VERSION")
        );
        log::error!("This is probably a canopy bug.");
        log::error!("");
        log::error!(
            "Please consider filing an issue: {}/issues",
            env!("CARGO_PKG_REPOSITORY")
        );
        log::error!("");
        log::error!("Details: {}", message);

        if let Some(location) = panic_info.location() {
            log::error!("in file {} on line {}", location.file(), location.line());
        }

        if env::var("RUST_BACKTRACE").map(|var| var == "1").unwrap_or(false) {
            eprintln!("{}", std::backtrace::Backtrace::force_capture());
        } else {
            eprintln!(
                "note: run with `RUST_BACKTRACE=1` environment variable to display a backtrace."
            );
        }

        process::exit(1);
    }));

    let options = Options::parse();

    let command_name = format!("canopy-{}", options.subcommand.command_name());
    let state_dir = options.subcommand.state_dir().map(|p| p.to_path_buf());

    let _log_guard = logging::init_logging(
        options.global.verbosity,
        options.global.color,
        state_dir.as_deref(),
        &command_name,
    );

    if let Err(err) = options.run() {
        log::error!("{:?}", err);
        process::exit(1);
    }
}
