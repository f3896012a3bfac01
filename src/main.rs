//! iscenv-plugins - inspect and exercise lifecycle plugins

use std::process::ExitCode;

fn main() -> ExitCode {
    if let Err(e) = iscenv_plugins::cli::run() {
        eprintln!("Error: {:#}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
