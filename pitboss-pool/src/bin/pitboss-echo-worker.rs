//! Reference worker speaking the pool's stdio protocol.
//!
//! Logs go to stderr; stdout carries nothing but response frames.

use anyhow::Result;
use clap::Parser;
use pitboss_ipc::{serve, ReferenceHandler, ServeExit};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "pitboss-echo-worker")]
#[command(about = "Reference worker for the Pitboss pool")]
#[command(version)]
struct Cli {
    /// Id assigned by the pool
    #[arg(long, default_value = "worker")]
    worker_id: String,

    /// Log level for stderr output
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    pitboss_logging::init_stderr_tracing(&cli.log_level)?;

    info!(worker_id = %cli.worker_id, pid = std::process::id(), "Worker starting");
    let mut handler = ReferenceHandler::new(cli.worker_id.clone());

    let code = match serve(tokio::io::stdin(), tokio::io::stdout(), &mut handler).await {
        Ok(ServeExit::InputClosed) => {
            info!(worker_id = %cli.worker_id, "Input closed, exiting");
            0
        }
        Ok(ServeExit::Exit(code)) => code,
        Err(e) => {
            error!(worker_id = %cli.worker_id, error = %e, "Worker stream failed");
            1
        }
    };

    std::process::exit(code);
}
