use std::{error::Error, net::TcpListener, path::PathBuf, process};

use clap::Parser;
use tracing::{error, info};

use meetup_ledger::{
    config::{self, NodeConfig},
    ledger::{AccountId, Amount},
    logging,
    rpc::Server,
    runtime::Runtime,
    store::{self, StoreError},
};

#[derive(Parser, Debug)]
#[command(
    name = "meetup-node",
    version,
    about = "Serves the meetup contract over line-delimited JSON on TCP"
)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = config::DEFAULT_NODE_ADDR)]
    bind: String,

    /// Snapshot file, rewritten after every committed call
    #[arg(long, default_value = config::DEFAULT_STATE_FILE)]
    state: PathBuf,

    /// Keep state in memory only
    #[arg(long, conflicts_with = "state")]
    memory: bool,

    /// Contract address clients must target
    #[arg(long, default_value = config::DEFAULT_CONTRACT)]
    contract: String,

    /// Genesis emission for a fresh chain (repeatable)
    #[arg(long = "emit", value_name = "ACCOUNT=AMOUNT", value_parser = config::parse_emission)]
    emissions: Vec<(AccountId, Amount)>,

    /// Do not run `init` on a fresh chain
    #[arg(long)]
    skip_deploy: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log: String,
}

impl Args {
    fn into_config(self) -> NodeConfig {
        NodeConfig {
            bind: self.bind,
            contract: self.contract,
            state_path: if self.memory { None } else { Some(self.state) },
            emissions: self.emissions,
            deploy: !self.skip_deploy,
        }
    }
}

fn open_runtime(config: &NodeConfig) -> Result<Runtime, Box<dyn Error>> {
    if let Some(path) = &config.state_path {
        if let Some(snapshot) = store::load(path)? {
            if snapshot.contract_address != config.contract {
                return Err(StoreError::ContractMismatch {
                    expected: config.contract.clone(),
                    found: snapshot.contract_address,
                }
                .into());
            }
            let runtime = Runtime::from_snapshot(snapshot)?;
            info!(
                path = %path.display(),
                height = runtime.meta().height,
                "state restored"
            );
            return Ok(runtime);
        }
    }

    let mut runtime = Runtime::new(config.contract.clone());
    for (account, amount) in &config.emissions {
        runtime.emit(account, *amount, "genesis")?;
    }
    if config.deploy {
        runtime.deploy()?;
    }
    if let Some(path) = &config.state_path {
        store::save(path, &runtime.snapshot())?;
        info!(path = %path.display(), "fresh chain created");
    }
    Ok(runtime)
}

fn run(config: NodeConfig) -> Result<(), Box<dyn Error>> {
    let runtime = open_runtime(&config)?;
    let listener = TcpListener::bind(&config.bind)?;
    Server::new(runtime, config.state_path.clone()).serve(listener)?;
    Ok(())
}

fn main() {
    let args = Args::parse();
    logging::init(&args.log);
    if let Err(err) = run(args.into_config()) {
        error!(error = %err, "node stopped");
        eprintln!("error: {err}");
        process::exit(2);
    }
}
