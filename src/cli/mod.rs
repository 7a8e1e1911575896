//! Defines canopy's CLI through clap types.

mod cloud;
mod emulate;
mod ops;
mod serve;

use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use clap::Parser;
use thiserror::Error;

pub use self::cloud::CloudCommand;
pub use self::emulate::EmulateCommand;
pub use self::ops::{AddCommand, DelCommand, GetCommand, PingCommand, SetCommand};
pub use self::serve::ServeCommand;

/// Command line options that canopy accepts, defined using the clap crate.
#[derive(Debug, Parser)]
#[clap(name = "canopy", version, about)]
pub struct Options {
    #[clap(flatten)]
    pub global: GlobalOptions,

    /// Subcommand to run in this invocation.
    #[clap(subcommand)]
    pub subcommand: Subcommand,
}

impl Options {
    pub fn run(self) -> anyhow::Result<()> {
        match self.subcommand {
            Subcommand::Serve(subcommand) => subcommand.run(),
            Subcommand::Cloud(subcommand) => subcommand.run(),
            Subcommand::Emulate(subcommand) => subcommand.run(),
            Subcommand::Ping(subcommand) => subcommand.run(self.global),
            Subcommand::Get(subcommand) => subcommand.run(self.global),
            Subcommand::Set(subcommand) => subcommand.run(self.global),
            Subcommand::Add(subcommand) => subcommand.run(self.global),
            Subcommand::Del(subcommand) => subcommand.run(self.global),
        }
    }
}

#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Sets verbosity level. Can be specified multiple times.
    #[clap(long("verbose"), short, global(true), action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Set color behavior. Valid values are auto, always, and never.
    #[clap(long("color"), global(true), default_value("auto"))]
    pub color: ColorChoice,
}

#[derive(Debug, Clone, Copy)]
pub enum ColorChoice {
    Auto,
    Always,
    Never,
}

impl FromStr for ColorChoice {
    type Err = ColorChoiceParseError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        match source {
            "auto" => Ok(ColorChoice::Auto),
            "always" => Ok(ColorChoice::Always),
            "never" => Ok(ColorChoice::Never),
            _ => Err(ColorChoiceParseError {
                attempted: source.to_owned(),
            }),
        }
    }
}

impl From<ColorChoice> for termcolor::ColorChoice {
    fn from(value: ColorChoice) -> Self {
        match value {
            ColorChoice::Auto => termcolor::ColorChoice::Auto,
            ColorChoice::Always => termcolor::ColorChoice::Always,
            ColorChoice::Never => termcolor::ColorChoice::Never,
        }
    }
}

#[derive(Debug, Error)]
#[error("Invalid color choice '{attempted}'. Valid values are: auto, always, never")]
pub struct ColorChoiceParseError {
    attempted: String,
}

#[derive(Debug, Parser)]
pub enum Subcommand {
    /// Run the on-appliance configuration daemon.
    Serve(ServeCommand),
    /// Run the cloud mirror service.
    Cloud(CloudCommand),
    /// Run an in-memory surrogate appliance against a local cloud.
    Emulate(EmulateCommand),
    /// Check that a site's frontend is reachable.
    Ping(PingCommand),
    /// Read a property (or subtree) from a site.
    Get(GetCommand),
    /// Set an existing property on a site.
    Set(SetCommand),
    /// Create a property on a site.
    Add(AddCommand),
    /// Delete a property or subtree from a site.
    Del(DelCommand),
}

impl Subcommand {
    /// The directory daemon logs should land in, if any.
    pub fn state_dir(&self) -> Option<&Path> {
        match self {
            Subcommand::Serve(cmd) => Some(&cmd.state),
            Subcommand::Cloud(cmd) => cmd.state.as_deref(),
            _ => None,
        }
    }

    pub fn command_name(&self) -> &'static str {
        match self {
            Subcommand::Serve(_) => "serve",
            Subcommand::Cloud(_) => "cloud",
            Subcommand::Emulate(_) => "emulate",
            Subcommand::Ping(_) => "ping",
            Subcommand::Get(_) => "get",
            Subcommand::Set(_) => "set",
            Subcommand::Add(_) => "add",
            Subcommand::Del(_) => "del",
        }
    }
}

pub fn resolve_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}
