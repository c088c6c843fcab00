// SPDX-License-Identifier: GPL-3.0-or-later

//! This module contains the command line interface of the application.
//!
//! The command line parsing is implemented using the `clap` library.
//! The module is defining types to represent a structured form of the
//! program invocation. The `Arguments` type is used to represent all
//! possible invocations of the program.

use anyhow::anyhow;
use clap::{arg, command, ArgAction, ArgMatches, Command};
use std::fmt;

/// Common constants used in the module.
const MODE_LIST_SUBCOMMAND: &str = "list";
const MODE_SUBMIT_SUBCOMMAND: &str = "submit";
const MODE_MARK_SUBCOMMAND: &str = "mark";

/// Represents the command line arguments of the application.
#[derive(Debug, PartialEq)]
pub struct Arguments {
    // The path of the configuration file.
    pub config: Option<String>,
    // The mode of the application.
    pub mode: Mode,
}

/// Represents the mode of the application.
#[derive(Debug, PartialEq)]
pub enum Mode {
    /// Show the pending crash reports.
    List,
    /// Send the pending crash reports.
    Submit { auto: bool, details: Details },
    /// Record crash reports as processed without sending them.
    Mark { ids: Vec<String> },
}

/// What the user tells about the crash on the command line.
#[derive(Debug, Default, PartialEq)]
pub struct Details {
    pub description: Option<String>,
    pub user_id: Option<String>,
    pub contact: Option<String>,
}

impl TryFrom<ArgMatches> for Arguments {
    type Error = anyhow::Error;

    fn try_from(matches: ArgMatches) -> Result<Self, Self::Error> {
        let config = matches.get_one::<String>("config").map(String::to_string);

        let mode = match matches.subcommand() {
            Some((MODE_LIST_SUBCOMMAND, _)) => Mode::List,
            Some((MODE_SUBMIT_SUBCOMMAND, submit_matches)) => {
                let auto = submit_matches.get_flag("auto");
                let details = Details::from(submit_matches);
                Mode::Submit { auto, details }
            }
            Some((MODE_MARK_SUBCOMMAND, mark_matches)) => {
                let ids = mark_matches
                    .get_many::<String>("ID")
                    .map(|values| values.cloned().collect())
                    .unwrap_or_default();
                Mode::Mark { ids }
            }
            _ => return Err(anyhow!("unrecognized subcommand")),
        };

        Ok(Arguments { config, mode })
    }
}

impl From<&ArgMatches> for Details {
    fn from(matches: &ArgMatches) -> Self {
        let value = |name: &str| matches.get_one::<String>(name).map(String::to_string);
        Details { description: value("description"), user_id: value("user-id"), contact: value("contact") }
    }
}

impl fmt::Display for Arguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Arguments:")?;
        match &self.config {
            Some(config) => writeln!(f, "  config: {config}")?,
            None => writeln!(f, "  config: default locations")?,
        }
        match &self.mode {
            Mode::List => writeln!(f, "  mode: list"),
            Mode::Submit { auto, .. } => writeln!(f, "  mode: submit (auto: {auto})"),
            Mode::Mark { ids } => writeln!(f, "  mode: mark {} reports", ids.len()),
        }
    }
}

/// Represents the command line interface of the application.
///
/// The different modes of the application are represented as subcommands.
pub fn cli() -> Command {
    command!()
        .subcommand_required(true)
        .arg_required_else_help(true)
        .args(&[arg!(-c --config <FILE> "Path of the config file")])
        .subcommand(Command::new(MODE_LIST_SUBCOMMAND).about("list the pending crash reports"))
        .subcommand(
            Command::new(MODE_SUBMIT_SUBCOMMAND)
                .about("send the pending crash reports")
                .args(&[
                    arg!(-a --auto "Send without asking for consent").action(ArgAction::SetTrue),
                    arg!(-d --description <TEXT> "What happened before the crash"),
                    arg!(-u --"user-id" <ID> "User identifier sent with the reports"),
                    arg!(--contact <TEXT> "Contact (e-mail address) sent with the reports"),
                ]),
        )
        .subcommand(
            Command::new(MODE_MARK_SUBCOMMAND)
                .about("record crash reports as processed without sending them")
                .args(&[arg!(<ID> "File name of the crash report")
                    .action(ArgAction::Append)
                    .num_args(1..)
                    .required(true)])
                .arg_required_else_help(true),
        )
}
