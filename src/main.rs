//! Command-line entry point: boots the executor service and either runs
//! wire-format request files or parks until interrupted.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use runbox::{Config, Service};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute wire-format JSON request files and print the responses
    Run {
        /// Request files, one JSON request each
        files: Vec<PathBuf>,
    },
    /// Boot the service and wait for SIGINT
    Serve,
    /// Print the effective configuration as JSON
    Config,
}

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_sig: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let conf = Config::from_env().context("load configuration")?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&conf)?);
            Ok(())
        }
        Commands::Run { files } => {
            if files.is_empty() {
                anyhow::bail!("no request files given");
            }
            let service = Service::boot(conf).context("boot service")?;
            for file in &files {
                let body = std::fs::read_to_string(file)
                    .with_context(|| format!("read {}", file.display()))?;
                let response = service.execute_json(&body);
                println!("{}", serde_json::to_string_pretty(&response)?);
            }
            service.shutdown();
            Ok(())
        }
        Commands::Serve => {
            let service = Service::boot(conf).context("boot service")?;
            let handler = on_interrupt as extern "C" fn(libc::c_int) as usize;
            unsafe {
                libc::signal(libc::SIGINT, handler as libc::sighandler_t);
                libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
            }
            log::info!("service up, waiting for interrupt");
            while !STOP.load(Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            log::info!("shutting down");
            service.shutdown();
            Ok(())
        }
    }
}
