// src/main.rs

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;
use stowage::{Lock, Store, StoreConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "stowage")]
#[command(author, version, about = "Installation store guarded by cross-process file locks", long_about = None)]
struct Cli {
    /// Store root directory
    #[arg(short, long, global = true, default_value = "/var/lib/stowage")]
    root: PathBuf,

    /// Seconds to wait for the store lock
    #[arg(short, long, global = true, default_value_t = 60)]
    timeout: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the store
    Init,
    /// Record an installed package
    Add {
        /// Package name
        name: String,
        /// Package version
        version: String,
        /// Installation prefix
        prefix: PathBuf,
        /// Mark as installed as a dependency
        #[arg(long)]
        implicit: bool,
    },
    /// Forget an installed package
    Remove {
        /// Package name to remove
        name: String,
    },
    /// Query installed packages
    Query {
        /// Package name pattern (optional, shows all if omitted)
        pattern: Option<String>,
    },
    /// Show the store lock file and its last exclusive holder
    LockInfo,
    /// Generate shell completion scripts
    Completions {
        /// Shell type
        shell: Shell,
    },
}

impl Cli {
    fn store_config(&self) -> StoreConfig {
        StoreConfig::new(&self.root).with_timeout(Duration::from_secs(self.timeout))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.store_config();

    match cli.command {
        Some(Commands::Init) => {
            info!("Initializing store at: {}", config.root.display());
            let store = Store::open(config)?;
            store.init()?;
            println!("Store initialized at: {}", store.root().display());
            Ok(())
        }
        Some(Commands::Add {
            name,
            version,
            prefix,
            implicit,
        }) => {
            let store = Store::open(config)?;
            let mut record = stowage::store::InstallRecord::new(name, version, prefix);
            record.explicit = !implicit;

            let summary = format!("{} {} at {}", record.name, record.version, record.prefix.display());
            store.add(record)?;
            println!("Added {}", summary);
            Ok(())
        }
        Some(Commands::Remove { name }) => {
            let store = Store::open(config)?;
            let record = store.remove(&name)?;
            println!("Removed {} {}", record.name, record.version);
            Ok(())
        }
        Some(Commands::Query { pattern }) => {
            let store = Store::open(config)?;
            let records = store.query(pattern.as_deref().unwrap_or(""))?;

            if records.is_empty() {
                println!("No packages found.");
                return Ok(());
            }

            println!("Installed packages:");
            for record in &records {
                let marker = if record.explicit { "" } else { " (implicit)" };
                println!(
                    "  {} {} {}{}",
                    record.name,
                    record.version,
                    record.prefix.display(),
                    marker
                );
            }
            println!("\nTotal: {} package(s)", records.len());
            Ok(())
        }
        Some(Commands::LockInfo) => {
            let store = Store::open(config)?;
            let path = store.lock().path();
            println!("Lock file: {}", path.display());
            match Lock::read_holder(path) {
                Some(holder) => println!("Last exclusive holder: pid {} on {}", holder.pid, holder.host),
                None => println!("Last exclusive holder: unknown"),
            }
            Ok(())
        }
        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "stowage", &mut std::io::stdout());
            Ok(())
        }
        None => {
            println!("Stowage Installation Store");
            println!("Run 'stowage --help' for usage information");
            Ok(())
        }
    }
}
