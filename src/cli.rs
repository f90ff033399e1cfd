use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "copilot-usage",
    version,
    about = "Reconcile token usage from GitHub Copilot CLI session logs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one usage query and print the rows.
    Query {
        /// Maximum number of rows to return.
        #[arg(long)]
        limit: Option<usize>,
        /// Only sessions modified at or after this epoch-millisecond instant.
        #[arg(long)]
        since: Option<i64>,
        /// Restrict the query to one session id.
        #[arg(long = "session", value_name = "ID")]
        session_id: Option<String>,
        /// Emit rows as a JSON array.
        #[arg(long)]
        json: bool,
    },
    /// Follow live assistant messages and keep usage reconciled.
    Watch {
        /// Seconds between bulk queries.
        #[arg(long, default_value_t = 30)]
        interval: u64,
    },
    /// Print resolved paths and a usage snapshot.
    Status,
    /// Run health diagnostics for the session and log directories.
    Doctor,
}
