use anyhow::Context;
use colored::Colorize;
use labrun::{
    clap_args::{self, Commands},
    config::Config,
    emulator::{dry_run::DryRunEmulator, netns::NetnsEmulator, Emulator},
    orchestrator::Orchestrator,
    plan::Plan,
    timeline::{Cancelled, Timeline},
    topology::Topology,
};
use std::{fs, path::Path};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::try_from_path(path).context(format!(
        "Unable to load scenario {}, try `labrun init` to create one",
        path.to_string_lossy()
    ))
}

async fn run<E: Emulator>(
    config: Config,
    emulator: E,
    timeline: Timeline,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let output_dir = config.network.output_dir.clone();
    fs::create_dir_all(&output_dir).context(format!(
        "Unable to create output directory {}",
        output_dir.to_string_lossy()
    ))?;

    let mut orchestrator = Orchestrator::new(config, emulator, token)?.with_timeline(timeline);
    let result = orchestrator.run().await;

    let report = orchestrator.into_report();
    report.print_summary();
    match report.write_to_dir(&output_dir) {
        Ok(path) => info!("Report written to {}", path.to_string_lossy()),
        Err(err) => error!("{:#}", err),
    }

    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = clap_args::parse();
    init_tracing(args.verbose);

    match args.command {
        Commands::Init { path } => {
            Config::write_example_to_file(&path)?;
            println!("> wrote example scenario to {}", path.to_string_lossy().green());
        }

        Commands::Plan { config } => {
            let config = load_config(&config)?;
            let topology = Topology::from_config(&config)?;
            let plan = Plan::new(&config, &config.timeline)?;
            plan.print(&config, &config.timeline, &topology);
        }

        Commands::Run { config, dry_run } => {
            let config = load_config(&config)?;

            let token = CancellationToken::new();
            let ctrlc_token = token.clone();
            ctrlc::set_handler(move || {
                println!("\n> interrupted, tearing down");
                ctrlc_token.cancel();
            })?;

            let result = if dry_run {
                run(config, DryRunEmulator::new(), Timeline::instant(), token).await
            } else {
                let timeline = config.timeline.clone();
                let emulator = NetnsEmulator::new(config.network.static_arp);
                run(config, emulator, timeline, token).await
            };

            if let Err(err) = result {
                if err.downcast_ref::<Cancelled>().is_some() {
                    println!("> experiment cancelled");
                    return Ok(());
                }
                return Err(err);
            }
        }
    }

    Ok(())
}
