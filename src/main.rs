use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use broker_reconciler::cli::Args;
use broker_reconciler::config::{load_seed, AgentConfig};
use broker_reconciler::plans::address_types;
use broker_reconciler::store::{ConfigStore, MemoryStore};
use broker_reconciler::{Agent, CycleOutcome, EventBus};

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(l) => EnvFilter::new(l),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    let config = match &args.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    };

    let seed = match args.seed_file(config.store.seed_file.as_deref()) {
        Some(path) => {
            let resources = load_seed(path)?;
            info!(path, count = resources.len(), "loaded address definitions");
            resources
        }
        None => Vec::new(),
    };
    let store: Arc<dyn ConfigStore> = Arc::new(MemoryStore::from_resources(seed));

    if let Some(plan) = &config.store.address_space_plan {
        match address_types(store.as_ref(), plan).await {
            Ok(types) => {
                for t in &types {
                    info!(plan = %plan, address_type = %t.name, plans = t.plans.len(), "address type available");
                }
            }
            Err(e) => warn!(plan = %plan, error = %e, "unable to list address types"),
        }
    }

    let broker = Arc::new(config.broker.connect()?);
    info!(
        url = %config.broker.url,
        broker = %config.broker.broker_name,
        space = %config.store.address_space,
        "connecting to broker"
    );

    let mut agent = Agent::new(store, broker, EventBus::new(), &config);

    if args.once {
        let outcome = agent.run_once().await;
        let synchronized = agent.reconciler().is_synchronized();
        info!(?outcome, synchronized, "single cycle finished");
        agent.reconciler().close().await?;
        if outcome == CycleOutcome::NoDesiredState {
            warn!("no address definitions were supplied");
        }
        return Ok(());
    }

    agent
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "unable to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await;
    Ok(())
}
