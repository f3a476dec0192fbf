use checkout_snapshot_sync::klaviyo::{KlaviyoClient, KlaviyoError, TransportError};
use checkout_snapshot_sync::settings::{
	ApiKey, ConfigError, FileConfigRepository, SettingsError, SettingsService, SyncConfig,
};
use checkout_snapshot_sync::sync::{
	ChangeDetection, RunOutcome, RunnerMessage, SyncError, SyncResult, SyncRunner,
};

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Copy the latest checkout of every profile in a Klaviyo segment onto the profile.
///
/// The API key is read from the KLAVIYO_API_KEY environment variable, or from the
/// configuration file after `--set-api-key`.
#[derive(Parser, Debug)]
#[command(author, version, long_about = None)]
struct Cli {
	/// Segment whose profiles are synced.
	#[arg(long)]
	segment: Option<String>,

	/// Event (metric) name to look for.
	#[arg(long)]
	event: Option<String>,

	/// Preview updates without writing them.
	#[arg(long)]
	dry_run: bool,

	/// Stop after this many profiles.
	#[arg(long)]
	limit: Option<usize>,

	/// Write every extracted snapshot, even when unchanged.
	#[arg(long)]
	always_update: bool,

	/// Configuration file (default: ~/.klaviyo_sync/klaviyo_sync_config.json).
	#[arg(long)]
	config: Option<PathBuf>,

	/// Only check that the API key is accepted.
	#[arg(long)]
	check: bool,

	/// Save an API key to the configuration file and exit.
	#[arg(long, value_name = "KEY", conflicts_with_all = ["clear_api_key", "save"])]
	set_api_key: Option<String>,

	/// Remove the saved API key and exit.
	#[arg(long, conflicts_with = "save")]
	clear_api_key: bool,

	/// Save the stored configuration with the options above applied, and exit.
	#[arg(long)]
	save: bool,

	/// Enable debug logging.
	#[arg(short, long)]
	verbose: bool,
}

impl Cli {
	/// Apply command-line overrides on top of the stored configuration.
	fn apply(&self, mut config: SyncConfig) -> SyncConfig {
		if let Some(segment) = &self.segment {
			config.segment_id = segment.clone();
		}
		if let Some(event) = &self.event {
			config.event_name = event.clone();
			config.event_name_aliases.clear();
		}
		if self.dry_run {
			config.dry_run = true;
		}
		if self.limit.is_some() {
			config.profile_limit = self.limit;
		}
		if self.always_update {
			config.change_detection = ChangeDetection::Always;
		}
		config
	}
}

#[derive(Debug, thiserror::Error)]
enum CliError {
	#[error(transparent)]
	Settings(#[from] SettingsError),

	#[error(transparent)]
	Config(#[from] ConfigError),

	#[error("Failed to create HTTP client: {0}")]
	Transport(#[from] TransportError),

	#[error(transparent)]
	Api(#[from] KlaviyoError),

	#[error(transparent)]
	Sync(#[from] SyncError),
}

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();

	let default_level = if cli.verbose {
		tracing::Level::DEBUG
	} else {
		tracing::Level::INFO
	};
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::builder()
				.with_default_directive(default_level.into())
				.from_env_lossy(),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	match run(cli).await {
		Ok(code) => code,
		Err(e) => {
			error!("{}", e);
			ExitCode::FAILURE
		}
	}
}

async fn run(cli: Cli) -> Result<ExitCode, CliError> {
	let config_file = match &cli.config {
		Some(path) => FileConfigRepository::new(path.clone()),
		None => FileConfigRepository::default_location()?,
	};
	let config_path = config_file.path().to_path_buf();
	let settings = SettingsService::for_file(config_file);

	if let Some(raw) = &cli.set_api_key {
		let key = ApiKey::new(raw)?;
		settings.set_api_key(&key).await?;
		println!("API key {} saved to {}", key, config_path.display());
		return Ok(ExitCode::SUCCESS);
	}
	if cli.clear_api_key {
		settings.clear_api_key().await?;
		println!("Saved API key removed from {}", config_path.display());
		return Ok(ExitCode::SUCCESS);
	}

	let config = cli.apply(settings.load_config().await?);
	if cli.save {
		settings.save_config(&config).await?;
		println!("Configuration saved to {}", config_path.display());
		return Ok(ExitCode::SUCCESS);
	}

	let api_key = settings.api_key().await?;
	let client = KlaviyoClient::from_config(&config, &api_key)?;

	if cli.check {
		client.test_connection().await?;
		println!("Connection OK");
		return Ok(ExitCode::SUCCESS);
	}

	config.validate()?;
	info!(
		"Syncing segment {} (event: {}, dry run: {})",
		config.segment_id, config.event_name, config.dry_run
	);

	let mut runner = SyncRunner::new();
	runner.start(Arc::new(client), config)?;

	let mut cancelling = false;
	loop {
		tokio::select! {
			message = runner.next_message() => match message {
				Some(RunnerMessage::Progress(progress)) => info!(
					"[{} scanned, {} updated, {} skipped, {} errors] {}",
					progress.profiles_scanned,
					progress.updated,
					progress.skipped,
					progress.errored,
					progress.message
				),
				Some(RunnerMessage::Log(line)) => println!("{}", line),
				Some(RunnerMessage::Finished(outcome)) => return Ok(report(outcome)),
				None => return Err(SyncError::WorkerTerminated.into()),
			},
			signal = tokio::signal::ctrl_c(), if !cancelling => {
				cancelling = true;
				match signal {
					Ok(()) => {
						info!("Stopping after the current profile...");
						runner.cancel()?;
					}
					Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
				}
			}
		}
	}
}

fn report(outcome: RunOutcome) -> ExitCode {
	match outcome {
		RunOutcome::Completed(result) => {
			print_result(&result);
			ExitCode::SUCCESS
		}
		RunOutcome::Cancelled(result) => {
			print_result(&result);
			ExitCode::from(130)
		}
		RunOutcome::Failed { error, partial } => {
			error!("Sync failed: {}", error);
			if let Some(result) = partial {
				print_result(&result);
			}
			ExitCode::FAILURE
		}
	}
}

fn print_result(result: &SyncResult) {
	println!();
	println!("{}", result.summary());
}
