use std::{fs, path::PathBuf, process, sync::Arc};

use structopt::StructOpt;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::*;

use e2e::{federation::TRUE_WEIGHT, linear, Federation, NodeSpec};
use fedlab_core::exchange::FsExchange;
use fedlab_researcher::{settings::ResearcherSettings, Experiment};

#[derive(Debug, StructOpt)]
#[structopt(name = "Simulation")]
/// Runs an experiment of the researcher against in-process nodes.
struct Opt {
    /// Path of the researcher configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
    /// Number of simulated nodes
    #[structopt(short, long, default_value = "3")]
    nodes: usize,
    /// Number of samples of each node
    #[structopt(long, default_value = "40")]
    samples: usize,
    /// Resume the experiment from its latest breakpoint
    #[structopt(long)]
    resume: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();

    let settings = ResearcherSettings::new(&opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let ResearcherSettings {
        researcher,
        requests,
        experiment,
        aggregator,
        exchange,
        log,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log.filter)
        .with_ansi(true)
        .init();

    let features = TRUE_WEIGHT.len();
    if !experiment.plan_path.exists() {
        fs::write(&experiment.plan_path, linear::source(features))?;
    }
    if !experiment.params_path.exists() {
        if let Some(dir) = experiment.params_path.parent() {
            fs::create_dir_all(dir)?;
        }
        linear::initial_params(features).save(&experiment.params_path)?;
    }

    let mut federation =
        Federation::new(experiment.experiment_dir.join("simulation")).with_store(&exchange.store);
    for i in 0..opt.nodes {
        federation.spawn_node(NodeSpec::new(&format!("node-{}", i), opt.samples))?;
    }

    let coordinator = federation.researcher(&researcher.id, requests.timeout())?;
    let exchange = Arc::new(FsExchange::new(exchange.store, exchange.download_dir));
    let mut experiment = if opt.resume {
        Experiment::load_breakpoint(None, &experiment, &aggregator, coordinator, exchange).await?
    } else {
        Experiment::new(&experiment, &aggregator, coordinator, exchange).await?
    };

    let alive = experiment.coordinator().ping().await?;
    info!("{} nodes answered the ping", alive.len());

    tokio::select! {
        result = experiment.run() => {
            let params = result?;
            let (weight, bias) = linear::coefficients(&params)?;
            info!("final model: weight {:?}, bias {}", weight, bias);
        }
        _ = signal::ctrl_c() => {
            warn!("interrupted");
        }
    }

    federation.shutdown().await;
    Ok(())
}
