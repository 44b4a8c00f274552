//! Command line.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use snapferry_storage::Dataset;
use snapferry_transport::TransportClient;
use std::path::PathBuf;

/// `snapferry` arguments.
#[derive(Debug, Parser)]
#[command(name = "snapferry")]
#[command(about = "Snapshot lifecycle scheduler and replication server", long_about = None)]
pub struct Cli {
    /// Replication server the client commands talk to.
    #[arg(short, long, default_value = "http://localhost:7654")]
    pub server: String,

    /// Authentication token for the client commands.
    #[arg(short, long, env = "SNAPFERRY_TOKEN")]
    pub token: Option<String>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable.
    Text,
    /// One JSON object per line.
    Json,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the replication server and the snapshot lifecycle jobs.
    Serve {
        /// TOML or JSON configuration file.
        #[arg(short, long, default_value = "/etc/snapferry/snapferry.toml")]
        config: PathBuf,
    },
    /// List the server's filesystems.
    Filesystems,
    /// List the snapshots of a filesystem.
    Snapshots {
        /// Filesystem name relative to the server's parent dataset.
        filesystem: String,
    },
    /// Show the resume token of an interrupted receive.
    ResumeToken {
        /// Filesystem name relative to the server's parent dataset.
        filesystem: String,
    },
    /// Create a snapshot on the server.
    Snapshot {
        /// Filesystem name relative to the server's parent dataset.
        filesystem: String,
        /// Snapshot name.
        name: String,
    },
}

impl Cli {
    fn client(&self) -> Result<TransportClient> {
        Ok(TransportClient::new(&self.server, self.token.clone())?)
    }

    /// Runs a client subcommand. `serve` is handled by the binary.
    pub async fn run(self) -> Result<()> {
        match &self.command {
            Command::Serve { .. } => anyhow::bail!("serve is not a client command"),
            Command::Filesystems => {
                let datasets = self.client()?.list_filesystems(&[]).await?;
                print!("{}", Self::format_table(&datasets));
            }
            Command::Snapshots { filesystem } => {
                match self.client()?.list_snapshots(filesystem, &[]).await? {
                    Some(datasets) => print!("{}", Self::format_table(&datasets)),
                    None => anyhow::bail!("Filesystem not found: {}", filesystem),
                }
            }
            Command::ResumeToken { filesystem } => {
                match self.client()?.resume_token(filesystem).await? {
                    Some(token) => println!("{}", token),
                    None => println!("No interrupted receive on {}", filesystem),
                }
            }
            Command::Snapshot { filesystem, name } => {
                let ds = self.client()?.create_snapshot(filesystem, name).await?;
                println!("Created {}", ds.name);
            }
        }
        Ok(())
    }

    fn format_table(datasets: &[Dataset]) -> String {
        let mut out = format!("{:<40} {:>12} {:>12}\n", "NAME", "USED", "REFER");
        out.push_str(&"-".repeat(66));
        out.push('\n');
        for ds in datasets {
            out.push_str(&format!(
                "{:<40} {:>12} {:>12}\n",
                ds.name,
                Self::format_bytes(ds.used),
                Self::format_bytes(ds.referenced)
            ));
        }
        out
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
        let mut value = bytes as f64;
        let mut unit = 0;
        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }
        if unit == 0 {
            format!("{} {}", bytes, UNITS[0])
        } else {
            format!("{:.1} {}", value, UNITS[unit])
        }
    }
}
