use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use campaign_director::command::CommandStages;
use campaign_director::config::CampaignConfig;
use campaign_director::context::Context;
use campaign_director::director::Director;
use campaign_director::env::{CorpusPlanner, Environment};
use campaign_director::forward::Forwarder;
use campaign_director::logger::LogHandler;
use campaign_director::machine::MachineId;
use campaign_director::mutation::Automator;
use campaign_director::observer::{Handler, Observer};
use campaign_director::stats::StatsPersister;

#[derive(Debug, Parser)]
#[command(name = "campaign-director")]
#[command(about = "Multi-machine concurrency-testing campaign director")]
struct Cli {
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a campaign until its deadline or Ctrl-C.
    Run {
        /// Campaign configuration file.
        #[arg(long)]
        config: PathBuf,
        /// Output root, overriding the configuration.
        #[arg(long)]
        out_dir: Option<PathBuf>,
        /// Campaign deadline in seconds, overriding the configuration.
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Statistics file, rewritten after every cycle outcome.
        #[arg(long)]
        stats_file: Option<PathBuf>,
        /// Append-only event log.
        #[arg(long)]
        log_file: Option<PathBuf>,
        /// Test inputs.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
    /// Print the mutant schedule of one machine.
    Mutants {
        /// Campaign configuration file.
        #[arg(long)]
        config: PathBuf,
        /// Machine identifier.
        #[arg(long)]
        machine: String,
    },
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level {level:?}"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn load_config(path: &Path) -> Result<CampaignConfig> {
    CampaignConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

async fn run(
    config: CampaignConfig,
    stats_file: Option<PathBuf>,
    log_file: Option<PathBuf>,
    inputs: Vec<PathBuf>,
) -> Result<()> {
    let mut handlers: Vec<Box<dyn Handler>> = Vec::new();
    let mut options = config.director_options();
    if let Some(path) = &stats_file {
        handlers.push(Box::new(StatsPersister::new(path)));
    }
    if let Some(path) = &log_file {
        let open = || LogHandler::open(path).with_context(|| format!("opening {}", path.display()));
        handlers.push(Box::new(open()?));
        options = options.with_observer(Box::new(open()?));
    }

    let forwarder = Forwarder::new(config.forward_buffer, handlers)?;
    let registrar = forwarder.registrar();
    let options = options.with_instance_observers(move |_, machine| {
        vec![Arc::new(registrar.instance(machine)) as Arc<dyn Observer>]
    });

    let env = Environment::new(CorpusPlanner::default(), CommandStages::new(config.stages.clone()));
    let director = Director::new(env, config.machines.clone(), inputs, options)?;

    let (cancel, cx) = Context::background().with_cancel();
    ctrlc::set_handler(move || cancel.cancel()).context("installing Ctrl-C handler")?;

    info!(machines = director.instance_count(), "campaign starting");
    let (outcome, delivered) = tokio::join!(director.direct(&cx), forwarder.run(&cx));
    info!(delivered, "events delivered");

    match outcome {
        Ok(()) => Ok(()),
        Err(err) if err.is_cancellation() => {
            info!(reason = %err, "campaign stopped");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn mutants(config: &CampaignConfig, machine: &str) -> Result<()> {
    let id = MachineId::from(machine);
    let Some(machine_config) = config.machines.get(&id) else {
        bail!("no machine {id} in configuration");
    };
    let Some(mutation) = machine_config.mutation.as_ref().filter(|m| m.enabled) else {
        bail!("mutation testing is not enabled for {id}");
    };
    let (automator, _handles) = Automator::new(mutation)?;
    for (slot, mutant) in automator.mutants().iter().enumerate() {
        println!("{slot}\t{}", mutant.0);
    }
    match (mutation.auto.change_after(), mutation.auto.change_kill) {
        (Some(period), kill) => println!(
            "rotation: every {}s{}",
            period.as_secs(),
            if kill { " or on kill" } else { "" }
        ),
        (None, true) => println!("rotation: on kill"),
        (None, false) => warn!("no rotation configured; the first mutant stays selected"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    match cli.command {
        Command::Run {
            config,
            out_dir,
            timeout_secs,
            stats_file,
            log_file,
            inputs,
        } => {
            let mut config = load_config(&config)?;
            if let Some(out_dir) = out_dir {
                config = config.with_out_dir(out_dir);
            }
            if let Some(secs) = timeout_secs {
                config = config.with_global_timeout_secs(secs);
            }
            config.validate()?;
            run(config, stats_file, log_file, inputs).await
        }
        Command::Mutants { config, machine } => mutants(&load_config(&config)?, &machine),
    }
}
