use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use hookrelay::{
    cli::{Cli, Commands, ConfigAction, ListenArgs},
    config::Config,
    forward::Forwarder,
    init_logging,
    relay::{ListenRequest, RelayListener, ReplayMarker, signal},
};

const DEFAULT_LOG_LEVEL: &str = "info";

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    if let Err(err) = run(cli).await {
        eprintln!("{} {:#}", "error:".red().bold(), err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config_path();
    let config = Config::load(&config_path)?;

    let level = cli
        .effective_log_level()
        .unwrap_or_else(|| config.log_level_or(DEFAULT_LOG_LEVEL).to_string());
    let log_file = Some(config.log.file_path.trim())
        .filter(|path| !path.is_empty())
        .map(Path::new);
    let _log_guard = init_logging(&level, log_file)?;

    tracing::info!("HookRelay starting...");
    tracing::debug!("CLI arguments: {:?}", cli);

    match &cli.command {
        Commands::Listen(args) => listen(config, args).await,
        Commands::Config { action } => match action {
            Some(ConfigAction::Show) | None => config.display(&config_path),
            Some(ConfigAction::Path) => {
                println!("{}", config_path.display());
                Ok(())
            }
        },
    }
}

async fn listen(config: Config, args: &ListenArgs) -> Result<()> {
    // Registered before connecting so an early Ctrl+C is not lost
    let interrupt = signal::interrupt().context("Failed to register interrupt handler")?;

    let credentials = config.credentials()?;
    let since = ReplayMarker::parse(args.since.as_deref().unwrap_or_default())?;

    let mut forwarder_options = config.forwarder_options();
    if args.signed {
        if forwarder_options.signer.is_none() {
            anyhow::bail!(
                "--signed requires forward.signature_header and forward.signature_secret in the configuration"
            );
        }
        forwarder_options.signed = true;
    }
    let forwarder = Forwarder::new(forwarder_options)?;

    let request = ListenRequest {
        host_name: credentials.host.clone(),
        project_id: credentials.project_id.clone(),
        device_id: credentials.device_id.clone(),
        source_id: args
            .source
            .clone()
            .filter(|source| !source.trim().is_empty()),
        forward_to: args.forward_to.clone(),
        since,
    };
    request.validate()?;

    let listener = RelayListener::new(config.listener_options(&credentials), forwarder);

    println!(
        "{} forwarding events from {} to {}",
        "Ready!".green().bold(),
        credentials.host,
        request.forward_to
    );

    let stats = listener.listen(&request, interrupt).await?;

    println!(
        "{} {} events forwarded, {} failed, {} acknowledged",
        "Session closed.".bold(),
        stats.events_forwarded,
        stats.forward_failures,
        stats.acks_sent
    );
    Ok(())
}
