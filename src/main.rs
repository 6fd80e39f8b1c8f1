use std::{error::Error, path::PathBuf};

use board_counter::{
	Backend, ConcurrencyHarness, Config, Connector, HarnessReport, MutationPath, NewPost,
	SqliteConnector,
};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::fmt;

/// Hammer a post's view counter from many connections and check that no increment was lost.
#[derive(Parser, Debug)]
#[command(name = "board-counter")]
struct Args {
	/// Configuration file, TOML or JSON.
	#[arg(long)]
	config: Option<PathBuf>,
	/// SQLite database file or RocksDB directory.
	#[arg(long)]
	database: Option<PathBuf>,
	#[arg(long, value_enum)]
	backend: Option<Backend>,
	/// Size of the worker pool.
	#[arg(long)]
	concurrency: Option<usize>,
	/// Increments per run.
	#[arg(long)]
	calls: Option<usize>,
	/// Number of runs, each against a freshly created post.
	#[arg(long)]
	runs: Option<usize>,
	/// Which increment operation to call.
	#[arg(long, value_enum, default_value = "atomic")]
	path: MutationPath,
	/// Print reports as JSON.
	#[arg(long)]
	json: bool,
	/// Log level
	#[arg(long)]
	log_level: Option<Level>,
}

impl Args {
	fn apply(&self, config: &mut Config) {
		if let Some(database) = &self.database {
			config.storage.path = database.clone();
		}
		if let Some(backend) = self.backend {
			config.storage.backend = backend;
		}
		if let Some(concurrency) = self.concurrency {
			config.harness.concurrency = concurrency;
		}
		if let Some(calls) = self.calls {
			config.harness.total_calls = calls;
		}
		if let Some(runs) = self.runs {
			config.harness.runs = runs;
		}
		if let Some(level) = self.log_level {
			config.logging.level = level.to_string();
		}
	}
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	let args = Args::parse();

	let mut config = match &args.config {
		Some(path) => Config::from_file(path)?,
		None => Config::default(),
	}
	.merge_from_env()?;
	args.apply(&mut config);
	config.validate()?;

	let subscriber =
		fmt::Subscriber::builder().with_max_level(config.logging.level.parse::<Level>()?).finish();
	tracing::subscriber::set_global_default(subscriber)?;

	info!(task = "tracing_setup", result = "success", "tracing successfully set up");

	let reports = match config.storage.backend {
		Backend::Sqlite => {
			let connector = SqliteConnector::new(&config.storage.path)
				.with_busy_timeout(config.busy_timeout())
				.with_retry_policy(config.retry_policy(Default::default()));
			connector.init_schema()?;

			run_all(connector, &config, args.path).await?
		},
		#[cfg(feature = "rocksdb")]
		Backend::RocksDb => {
			let connector = board_counter::RocksDbConnector::open(&config.storage.path)?;
			let retry = config.retry_policy(board_counter::RocksDbConnector::DEFAULT_RETRY);

			run_all(connector.with_retry_policy(retry), &config, args.path).await?
		},
		#[cfg(not(feature = "rocksdb"))]
		Backend::RocksDb => return Err("built without the `rocksdb` feature".into()),
	};

	if args.json {
		println!("{}", serde_json::to_string_pretty(&reports)?);
	} else {
		for (run, report) in reports.iter().enumerate() {
			print_report(run + 1, reports.len(), report);
		}
	}

	let inexact = reports.iter().filter(|report| !report.is_exact()).count();
	if args.path == MutationPath::Atomic && inexact > 0 {
		return Err(format!("{} of {} atomic runs were not exact", inexact, reports.len()).into())
	}

	Ok(())
}

async fn run_all<C: Connector>(
	connector: C,
	config: &Config,
	path: MutationPath,
) -> Result<Vec<HarnessReport>, Box<dyn Error>> {
	let harness = ConcurrencyHarness::new(connector);
	let mut reports = Vec::with_capacity(config.harness.runs);

	for run in 1..=config.harness.runs {
		let post =
			NewPost::new(format!("Concurrency run {}", run), "view counter under contention");
		let report = harness
			.run_on_new_post(post, config.harness.concurrency, config.harness.total_calls, path)
			.await?;
		reports.push(report);
	}

	Ok(reports)
}

fn print_report(run: usize, runs: usize, report: &HarnessReport) {
	println!(
		"run {}/{} [{}] post {}: expected {}, actual {}, successes {}, failures {}, loss {:.1}%, \
		 {} ms",
		run,
		runs,
		report.path,
		report.post_id,
		report.expected,
		report.actual,
		report.successes,
		report.failures.len(),
		report.loss_rate() * 100.0,
		report.elapsed.as_millis(),
	);

	for failure in &report.failures {
		println!("  call {} failed: {}", failure.call, failure.error);
	}
}
