use lf_lead_sync::{
	mutation_log::FileStorage,
	store::{HttpLeadStore, MemoryLeadStore},
	AuxiliaryIds, LeadEvent, LeadStore, LeadSyncSession, SyncConfig, TenantId, TransitionFields,
};
use lf_utils::error::report_error;

use std::{env, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "lf_lead_sync=info,lf_agent=info";

#[derive(Parser, Debug)]
#[command(name = "lf-agent", about = "Keeps a tenant's leads in sync with the lead store")]
struct Cli {
	/// Directory holding the config file and the shared mutation log
	#[arg(long, env = "LF_DATA_DIR")]
	data_dir: Option<PathBuf>,

	/// Config file, defaults to `<data_dir>/sync.json`
	#[arg(long)]
	config: Option<PathBuf>,

	#[arg(long, env = "LF_TENANT")]
	tenant: String,

	/// Bearer token for the store, overrides the one in the config file
	#[arg(long, env = "LF_STORE_TOKEN", hide_env_values = true)]
	token: Option<String>,

	/// Use a process local store instead of the HTTP one
	#[arg(long)]
	offline: bool,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Mount a session and print every lead event until interrupted
	Run,
	/// Move a lead to another stage
	Transition {
		lead_id: String,
		/// Canonical or legacy stage name
		stage: String,
		#[arg(long)]
		name: Option<String>,
		#[arg(long)]
		contact: Option<String>,
		#[arg(long)]
		real_id: Option<String>,
		#[arg(long)]
		db_id: Option<String>,
		#[arg(long)]
		original_id: Option<String>,
	},
	/// Resync the tenant's open leads once
	Resync,
	/// Rewrite legacy stage names in the store with canonical ones
	Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
	init_tracing()?;

	let cli = Cli::parse();

	let data_dir = match cli.data_dir {
		Some(dir) => dir,
		None => env::current_dir()
			.context("Unable to get your current directory, try setting --data-dir")?
			.join("lf_agent_data"),
	};

	let mut config = SyncConfig::load_from(
		cli.config
			.clone()
			.unwrap_or_else(|| data_dir.join("sync.json")),
	)?;
	if cli.token.is_some() {
		config.store.token = cli.token.clone();
	}

	let store: Arc<dyn LeadStore> = if cli.offline {
		warn!("Running offline, changes stay in this process");
		Arc::new(MemoryLeadStore::new())
	} else {
		Arc::new(HttpLeadStore::new(&config.store)?)
	};

	let storage = Arc::new(FileStorage::open(data_dir.join("mutation_log"))?);
	let session = LeadSyncSession::new(config, TenantId::new(cli.tenant), store, storage)?;

	match cli.command {
		Command::Run => run(&session).await?,

		Command::Transition {
			lead_id,
			stage,
			name,
			contact,
			real_id,
			db_id,
			original_id,
		} => {
			let fields = TransitionFields {
				name,
				contact,
				auxiliary: AuxiliaryIds {
					real_id,
					db_id,
					original_id,
				},
				..TransitionFields::default()
			};

			let outcome = session.transition(&lead_id, &stage, Some(&fields)).await?;
			info!(kind = ?outcome.kind, lead_id = %outcome.lead_id, "Transition applied");
			println!("{}", serde_json::to_string_pretty(&outcome.record)?);
		}

		Command::Resync => {
			let report = session.resync().await?;
			info!(?report, "Resync finished");
		}

		Command::Migrate => {
			let report = session.migration().run().await?;
			println!(
				"scanned {}, migrated {}, unknown stage {}",
				report.scanned,
				report.migrated.len(),
				report.unknown.len()
			);
		}
	}

	Ok(())
}

fn init_tracing() -> Result<()> {
	tracing_subscriber::registry()
		.with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)))
		.with(fmt::layer().with_target(true).with_writer(std::io::stderr))
		.try_init()
		.context("Failed to initialize tracing")
}

async fn run(session: &LeadSyncSession) -> Result<()> {
	if let Err(e) = session.check_log() {
		warn!(?e, "Mutation log unavailable, other sessions will only be seen on resync");
	}

	let mut events = session.broadcaster().stream();
	session.mount().await;

	let shutdown = tokio::signal::ctrl_c();
	tokio::pin!(shutdown);

	loop {
		tokio::select! {
			res = &mut shutdown => {
				res.context("Failed to listen for ctrl-c")?;
				info!("Interrupted, shutting down");
				break;
			}
			event = events.recv() => match event {
				Ok(event) => report_error("printing lead event", &print_signal(&event)),
				Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged behind"),
				Err(RecvError::Closed) => break,
			}
		}
	}

	session.shutdown().await;

	Ok(())
}

fn print_signal(event: &LeadEvent) -> Result<(), serde_json::Error> {
	println!(
		"{:?} {}",
		event.kind,
		serde_json::to_string(&event.signal())?
	);
	Ok(())
}
