// SPDX-License-Identifier: GPL-3.0-or-later

use quincy::report::SystemInfo;
use quincy::{args, config, context, modes};
use std::process::ExitCode;

/// Finds the crash reports of the configured application and deals with them
/// as the command line says.
fn main() -> anyhow::Result<ExitCode> {
    env_logger::init();
    let system = SystemInfo::current();
    log::info!(
        "{} {} started on {} ({})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        system.system_version,
        system.platform
    );

    let context = context::Context::capture()?;
    log::info!("{context}");
    let arguments = args::Arguments::try_from(args::cli().get_matches())?;
    log::info!("{arguments}");
    let configuration = config::Loader::load(&context, &arguments.config)?;
    log::info!("{configuration}");

    let mode = modes::Mode::configure(context, arguments, configuration)?;
    log::debug!("Looking for crash reports");
    let exit_code = mode.run();
    log::debug!("Finished with {exit_code:?}");

    Ok(exit_code)
}
