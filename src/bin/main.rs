//! `replogctl` — read-only diagnostics over a replication log directory.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use replog::config::LoggingConfig;
use replog::server::{
    ScanOptions, ServerError, control_file_path, read_control_file, scan_directory,
};

#[derive(Parser, Debug)]
#[command(
    name = "replogctl",
    version,
    about = "Replication log applier diagnostics",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the control-file cursor for a source GUID.
    Status {
        /// Target's log source directory.
        directory: PathBuf,
        /// Source GUID the control file is named after.
        #[arg(long)]
        guid: Uuid,
    },
    /// Print the replay queue the driver would build for a directory.
    Queue {
        /// Target's log source directory.
        directory: PathBuf,
        /// Only consider segments stamped with this source GUID.
        #[arg(long)]
        guid: Option<Uuid>,
    },
}

fn main() {
    let cli = Cli::parse();
    replog::telemetry::init(&LoggingConfig::default());

    if let Err(e) = run(cli) {
        tracing::error!("error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> replog::Result<()> {
    match cli.command {
        Command::Status { directory, guid } => {
            let path = control_file_path(&directory, &guid);
            let snapshot = read_control_file(&path).map_err(ServerError::from)?;

            println!("control file: {}", path.display());
            println!("sequence:     {}", snapshot.sequence);
            println!("offset:       {}", snapshot.offset);
            println!("db_sequence:  {}", snapshot.db_sequence);
            println!("open transactions: {}", snapshot.transactions.len());
            for (transaction_id, sequence) in snapshot.transactions.iter() {
                println!("  {transaction_id} (since segment {sequence})");
            }
        }
        Command::Queue { directory, guid } => {
            let queue = scan_directory(&ScanOptions {
                directory: &directory,
                source_guid: guid,
                db_name: "replogctl",
                verbose: false,
                preserve_segments: false,
                delete_free: false,
            })?;

            if queue.is_empty() {
                println!("no replayable segments");
            }
            for segment in &queue {
                println!(
                    "{:>10}  {}  {}  {:>10} bytes  {}",
                    segment.header.sequence,
                    segment.header.state,
                    segment.header.guid,
                    segment.header.length,
                    segment.path.display()
                );
            }
        }
    }
    Ok(())
}
