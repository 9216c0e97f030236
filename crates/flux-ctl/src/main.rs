//! `flux-ctl` — operator CLI for the flux workspace. Currently exposes the
//! session-tx engine's mailbox dump; other subcommands live where their
//! owning crate does, wired in here as they're added.

use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "flux-ctl", about = "Operator CLI for the flux workspace")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Session TX dispatch engine commands.
    #[command(subcommand)]
    SessionTx(SessionTxCommand),
}

#[derive(Subcommand)]
enum SessionTxCommand {
    /// Pretty-print a captured mailbox snapshot (a JSON array of events).
    DumpMailbox {
        /// Path to a JSON file holding an array of `{"kind": ..., ...}` events.
        #[arg(long)]
        events_file: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::SessionTx(SessionTxCommand::DumpMailbox { events_file }) => {
            match flux_ctl::dump_mailbox_from_file(&events_file) {
                Ok(text) => {
                    print!("{text}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("flux-ctl: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
