//! chanrelay: minimal line-oriented chat relay

use chanrelay::{Cli, CliCommand, ServeArgs, Server, run_chat};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("chanrelay=debug")
    } else {
        EnvFilter::new("chanrelay=info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result: Result<(), Box<dyn std::error::Error>> = match cli.command {
        CliCommand::Serve(args) => run_server(&args).await,
        CliCommand::Chat {
            host,
            port,
            nick,
            join,
        } => run_chat((host.as_str(), port), nick, join)
            .await
            .map_err(Into::into),
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run_server(args: &ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut server = Server::bind(args.to_config())?;
    let shutdown = server.shutdown_handle();

    // The reactor blocks its thread; keep it off the runtime's workers.
    let mut reactor = tokio::task::spawn_blocking(move || server.run());

    tokio::select! {
        result = &mut reactor => return Ok(result??),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupted, shutting down");
            shutdown.shutdown();
        }
    }

    reactor.await??;
    Ok(())
}
