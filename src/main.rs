//! amux - remote sandboxes for CLI coding agents

use std::process::ExitCode;

use clap::Parser;

use amux::cli::{Cli, exit_code_for, render_error};

#[tokio::main]
async fn main() -> ExitCode {
    amux::logging::init();
    let cli = Cli::parse();

    tokio::select! {
        result = cli.run() => match result {
            Ok(code) => code,
            Err(err) => {
                eprintln!("{}", render_error(&err));
                ExitCode::from(exit_code_for(&err))
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nInterrupted");
            ExitCode::from(130)
        }
    }
}
