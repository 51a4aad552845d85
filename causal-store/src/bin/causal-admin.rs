//! Administrative commands for cluster-state directories.

use std::path::PathBuf;
use std::process::ExitCode;

use causal_store::ClusterStateLayout;
use causal_store::StoreLock;

use clap::Parser;
use clap::Subcommand;

#[derive(Parser, Debug)]
#[command(name = "causal-admin")]
#[command(about = "Administration of causal cluster state", long_about = None)]
struct Options {
    /// The data directory holding per-database state.
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Remove the cluster state of a database, so the store can be used
    /// standalone or re-seeded into another cluster.
    Unbind {
        /// The database to unbind.
        #[arg(long)]
        database: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let options = Options::parse();
    match options.command {
        Command::Unbind { database } => unbind(&options.data_dir, &database),
    }
}

fn unbind(data_dir: &std::path::Path, database: &str) -> ExitCode {
    let layout = ClusterStateLayout::for_database(data_dir, database);

    if !layout.root().exists() {
        eprintln!(
            "error: no cluster state found for database '{}' under {}",
            database,
            data_dir.display()
        );
        return ExitCode::FAILURE;
    }

    match StoreLock::is_free(&layout.store_lock_file()) {
        Ok(true) => {}
        Ok(false) => {
            eprintln!(
                "error: database '{}' is in use; stop the member before unbinding",
                database
            );
            return ExitCode::FAILURE;
        }
        Err(err) => {
            eprintln!("error: could not check the store lock: {}", err);
            return ExitCode::FAILURE;
        }
    }

    if let Err(err) = std::fs::remove_dir_all(layout.root()) {
        eprintln!("error: could not remove cluster state: {}", err);
        return ExitCode::FAILURE;
    }
    println!("unbound database '{}'", database);
    ExitCode::SUCCESS
}
