use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokengate::{gateway, migrate, AccountLedger, Config, Store, Tier};
use tracing_subscriber::EnvFilter;

/// Token quota and API-key authorization engine.
#[derive(Parser, Debug)]
#[command(name = "tokengate")]
#[command(version)]
#[command(about = "Token quota, API-key authorization and purchase reconciliation.", long_about = None)]
struct Cli {
    /// Path to config.toml (defaults to $TOKENGATE_CONFIG, then the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP gateway
    Serve {
        /// Override the configured port
        #[arg(short, long)]
        port: Option<u16>,

        /// Override the configured bind address
        #[arg(long)]
        host: Option<String>,
    },

    /// Inspect or provision accounts
    Account {
        #[command(subcommand)]
        account_command: AccountCommands,
    },

    /// Purchase order maintenance
    Orders {
        #[command(subcommand)]
        orders_command: OrderCommands,
    },

    /// Import data from older deployments
    Migrate {
        #[command(subcommand)]
        migrate_command: MigrateCommands,
    },
}

#[derive(Subcommand, Debug)]
enum AccountCommands {
    /// Create an account
    Create {
        id: String,
        #[arg(long, default_value = "free")]
        tier: String,
    },
    /// Print an account as JSON
    Show { id: String },
    /// Change an account's tier
    SetTier { id: String, tier: String },
}

#[derive(Subcommand, Debug)]
enum OrderCommands {
    /// Expire overdue orders once and exit
    Sweep,
}

#[derive(Subcommand, Debug)]
enum MigrateCommands {
    /// Import a JSON array of legacy account documents
    ImportLegacy { file: PathBuf },
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn open_store(config: &Config) -> Result<Arc<Store>> {
    let path = config.storage.resolved_db_path()?;
    tracing::debug!("Opening store at {}", path.display());
    Ok(Arc::new(Store::open(&path)?))
}

fn open_ledger(config: &Config) -> Result<AccountLedger> {
    Ok(AccountLedger::new(
        open_store(config)?,
        Arc::new(config.tier_table()?),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Serve { port, host } => {
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if let Some(host) = host {
                config.gateway.host = host;
            }
            let state = gateway::AppState::from_config(&config, open_store(&config)?)?;
            gateway::run_gateway(&config, state).await
        }

        Commands::Account { account_command } => {
            let ledger = open_ledger(&config)?;
            let account = match account_command {
                AccountCommands::Create { id, tier } => {
                    let tier: Tier = tier.parse()?;
                    ledger.open_account(&id, tier)?
                }
                AccountCommands::Show { id } => ledger.account(&id)?,
                AccountCommands::SetTier { id, tier } => {
                    let tier: Tier = tier.parse()?;
                    ledger.change_tier(&id, tier)?
                }
            };
            println!("{}", serde_json::to_string_pretty(&account)?);
            Ok(())
        }

        Commands::Orders {
            orders_command: OrderCommands::Sweep,
        } => {
            let store = open_store(&config)?;
            let expired = store
                .expire_stale_orders(chrono::Utc::now())
                .context("Order sweep failed")?;
            println!("Expired {expired} order(s)");
            Ok(())
        }

        Commands::Migrate {
            migrate_command: MigrateCommands::ImportLegacy { file },
        } => {
            let ledger = open_ledger(&config)?;
            let report = migrate::import_legacy_file(&ledger, &file)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.rejected.is_empty() {
                anyhow::bail!("{} legacy document(s) rejected", report.rejected.len());
            }
            Ok(())
        }
    }
}
