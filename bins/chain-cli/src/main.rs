use chain_store::{ChainFilter, ChainRecord, ChainStore, StoreConfig};
use eyre::{Result, WrapErr, bail};
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "chain-cli", about = "inspect and edit the chain store")]
struct Options {
    /// Store root directory (the same --db-dir syncd uses).
    #[structopt(long, default_value = "db")]
    path: PathBuf,
    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Register a chain. The endpoint must already be transit-encrypted.
    Add {
        #[structopt(long)]
        id: u64,
        #[structopt(long)]
        key: String,
        #[structopt(long, default_value = "evm")]
        client_kind: String,
        #[structopt(long)]
        encrypted_endpoint: String,
        /// Initial cursor (last height considered ingested).
        #[structopt(long, default_value = "0")]
        cursor: u64,
        #[structopt(long)]
        disabled: bool,
    },
    /// Print chain records as JSON.
    List {
        #[structopt(long)]
        enabled_only: bool,
    },
    Enable {
        #[structopt(long)]
        id: u64,
    },
    Disable {
        #[structopt(long)]
        id: u64,
    },
    /// Force a chain's cursor. Careful: the synchronizer assumes every
    /// height up to the cursor has been ingested.
    SetHeight {
        #[structopt(long)]
        id: u64,
        #[structopt(long)]
        height: u64,
    },
}

fn main() -> Result<()> {
    let opt = Options::from_args();
    let store = ChainStore::open(StoreConfig {
        root_dir: opt.path.clone(),
    })
    .wrap_err("open chain store")?;

    match opt.command {
        Command::Add {
            id,
            key,
            client_kind,
            encrypted_endpoint,
            cursor,
            disabled,
        } => {
            if store.get_chain(id).wrap_err("read chain")?.is_some() {
                bail!("chain {id} already exists");
            }
            let record = ChainRecord {
                id,
                key,
                client_kind,
                encrypted_endpoint,
                cursor,
                enabled: !disabled,
            };
            store.put_chain(&record).wrap_err("write chain")?;
            print_record(&record)?;
        }
        Command::List { enabled_only } => {
            let filter = if enabled_only {
                ChainFilter::EnabledOnly
            } else {
                ChainFilter::All
            };
            for record in store.list_chains(filter).wrap_err("list chains")? {
                print_record(&record)?;
            }
        }
        Command::Enable { id } => {
            store.set_enabled(id, true).wrap_err("enable chain")?;
        }
        Command::Disable { id } => {
            store.set_enabled(id, false).wrap_err("disable chain")?;
        }
        Command::SetHeight { id, height } => {
            store.update_height(id, height).wrap_err("set height")?;
        }
    }

    Ok(())
}

fn print_record(record: &ChainRecord) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(record).wrap_err("encode record")?
    );
    Ok(())
}
