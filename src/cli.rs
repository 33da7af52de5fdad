use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "broker-reconciler")]
#[command(version)]
#[command(about = "Keeps a message broker's addresses and connectors in line with a desired address set")]
pub struct Args {
    /// TOML config file. Defaults apply when omitted.
    #[arg(long, short)]
    pub config: Option<String>,

    /// JSON array of address resources to seed the store with (overrides store.seed_file)
    #[arg(long)]
    pub addresses: Option<String>,

    /// Log filter, e.g. "info" or "broker_reconciler=debug" (overrides RUST_LOG)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Run a single reconcile cycle and exit
    #[arg(long)]
    pub once: bool,
}

impl Args {
    /// Seed file to load: the command line wins over the config file.
    pub fn seed_file<'a>(&'a self, configured: Option<&'a str>) -> Option<&'a str> {
        self.addresses.as_deref().or(configured)
    }
}
