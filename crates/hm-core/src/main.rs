use clap::Parser;

use hm_core::cli::{self, Cli};
use hm_core::logging;

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.global.log_format, logging::level_for(cli.global.verbose)) {
        eprintln!("hm-import: cannot initialize logging: {e}");
    }
    cli::run(&cli).into()
}
