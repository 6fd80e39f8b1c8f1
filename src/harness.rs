use std::{
	any::Any,
	fmt::Display,
	sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc, PoisonError, RwLock,
	},
	thread,
	time::{Duration, Instant},
};

use serde::{Deserialize, Serialize, Serializer};
use tokio::task::JoinError;
use tracing::{debug, error, info, instrument, warn};

use crate::{
	storage::{Connector, CounterStore, RecordStore},
	types::{HarnessError, NewPost, PostId, StorageError},
};

/// Upper bound on workers. Each worker is a dedicated OS thread for the length of a run.
pub const MAX_CONCURRENCY: usize = 256;

/// The [`CounterStore`] operation a harness run calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MutationPath {
	/// [`CounterStore::increment_atomic`]
	Atomic,
	/// [`CounterStore::increment_unsafe`]
	#[cfg(any(test, feature = "race-demo"))]
	Unsafe,
}

impl MutationPath {
	fn increment<S: CounterStore>(self, store: &S, id: PostId) -> Result<u64, StorageError> {
		match self {
			MutationPath::Atomic => store.increment_atomic(id),
			#[cfg(any(test, feature = "race-demo"))]
			MutationPath::Unsafe => store.increment_unsafe(id),
		}
	}
}

impl Display for MutationPath {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			MutationPath::Atomic => write!(f, "atomic"),
			#[cfg(any(test, feature = "race-demo"))]
			MutationPath::Unsafe => write!(f, "unsafe"),
		}
	}
}

/// A single increment call that did not succeed.
#[derive(Debug, Serialize)]
pub struct CallFailure {
	/// Zero-based number of the call within the run.
	pub call: usize,
	#[serde(serialize_with = "serialize_display")]
	pub error: StorageError,
}

/// Outcome of one harness run.
#[derive(Debug, Serialize)]
pub struct HarnessReport {
	pub post_id: PostId,
	pub path: MutationPath,
	pub concurrency: usize,
	/// Number of calls issued, which is what the counter should read afterwards.
	pub expected: u64,
	/// Counter value read back after every call finished.
	pub actual: u64,
	pub successes: u64,
	pub failures: Vec<CallFailure>,
	#[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
	pub elapsed: Duration,
}

impl HarnessReport {
	/// `(expected - actual) / expected`, or `0.0` for an empty run.
	pub fn loss_rate(&self) -> f64 {
		if self.expected == 0 {
			return 0.0
		}
		self.expected.saturating_sub(self.actual) as f64 / self.expected as f64
	}

	/// Increments that reported success but are missing from the counter.
	pub fn lost_updates(&self) -> u64 {
		self.successes.saturating_sub(self.actual)
	}

	/// Every call succeeded and every one of them shows up in the counter.
	pub fn is_exact(&self) -> bool {
		self.failures.is_empty() && self.actual == self.expected && self.successes == self.expected
	}
}

/// Fires many concurrent increments at one counter and checks what survived.
///
/// Every call gets its own session from the [`Connector`], so contention happens between real
/// storage connections and not behind a shared handle. Workers claim call numbers from an atomic
/// ticket counter.
///
/// A run occupies one thread of tokio's blocking pool, which spawns the workers as scoped OS
/// threads. Runs therefore never wait on each other for blocking threads.
pub struct ConcurrencyHarness<C: Connector> {
	connector: Arc<C>,
}

impl<C: Connector> ConcurrencyHarness<C> {
	pub fn new(connector: C) -> Self {
		Self { connector: Arc::new(connector) }
	}

	pub fn connector(&self) -> &C {
		&self.connector
	}

	/// Creates a post and runs the harness against its counter.
	#[instrument(skip(self, post))]
	pub async fn run_on_new_post(
		&self,
		post: NewPost,
		concurrency: usize,
		total_calls: usize,
		path: MutationPath,
	) -> Result<HarnessReport, HarnessError> {
		check_parameters(concurrency)?;

		let id =
			self.blocking(move |connector| Ok(connector.connect()?.create_post(post)?.id)).await?;
		debug!(id, "Created post for harness run");

		self.hammer(id, concurrency, total_calls, path).await
	}

	/// Resets the counter of an existing post to `0` and runs the harness against it.
	///
	/// Fails with [`StorageError::NotFound`] if the post does not exist.
	#[instrument(skip(self))]
	pub async fn run(
		&self,
		id: PostId,
		concurrency: usize,
		total_calls: usize,
		path: MutationPath,
	) -> Result<HarnessReport, HarnessError> {
		check_parameters(concurrency)?;

		self.blocking(move |connector| connector.connect()?.reset_view_count(id)).await?;

		self.hammer(id, concurrency, total_calls, path).await
	}

	async fn hammer(
		&self,
		id: PostId,
		concurrency: usize,
		total_calls: usize,
		path: MutationPath,
	) -> Result<HarnessReport, HarnessError> {
		let started = Instant::now();
		let workers = concurrency.min(total_calls);

		let connector = self.connector.clone();
		let (successes, failures) = tokio::task::spawn_blocking(move || {
			run_workers(connector.as_ref(), id, workers, total_calls, path)
		})
		.await
		.map_err(worker_panicked)??;

		let actual = self.blocking(move |connector| connector.connect()?.read(id)).await?;

		let report = HarnessReport {
			post_id: id,
			path,
			concurrency,
			expected: total_calls as u64,
			actual,
			successes,
			failures,
			elapsed: started.elapsed(),
		};

		info!(
			post_id = id,
			path = %path,
			expected = report.expected,
			actual = report.actual,
			successes = report.successes,
			failed = report.failures.len(),
			elapsed_ms = report.elapsed.as_millis() as u64,
			"Harness run finished"
		);

		Ok(report)
	}

	/// Runs storage work for the harness itself off the async runtime.
	async fn blocking<T: Send + 'static>(
		&self,
		op: impl FnOnce(&C) -> Result<T, StorageError> + Send + 'static,
	) -> Result<T, HarnessError> {
		let connector = self.connector.clone();
		let res = tokio::task::spawn_blocking(move || op(&connector))
			.await
			.map_err(worker_panicked)?;

		res.map_err(|e| {
			error!("Harness storage operation failed: {}", e);
			HarnessError::Storage(e)
		})
	}
}

fn check_parameters(concurrency: usize) -> Result<(), HarnessError> {
	if concurrency == 0 || concurrency > MAX_CONCURRENCY {
		return Err(HarnessError::InvalidParameters(format!(
			"concurrency must be between 1 and {}, got {}",
			MAX_CONCURRENCY, concurrency
		)))
	}

	Ok(())
}

/// Spreads `total_calls` increments over `workers` scoped threads and collects every outcome.
///
/// All workers are joined before returning. If any of them panicked, the run fails with
/// [`HarnessError::WorkerPanicked`], since the calls it had claimed are unaccounted for.
fn run_workers<C: Connector>(
	connector: &C,
	id: PostId,
	workers: usize,
	total_calls: usize,
	path: MutationPath,
) -> Result<(u64, Vec<CallFailure>), HarnessError> {
	let next_call = AtomicUsize::new(0);
	let aborted = AtomicBool::new(false);
	// Held for writing until every worker thread exists, so all of them start calling together.
	let start_gate = RwLock::new(());

	let mut successes = 0;
	let mut failures = Vec::new();
	let mut panics = Vec::new();

	let spawned = thread::scope(|s| {
		let gate = start_gate.write().unwrap_or_else(PoisonError::into_inner);

		let mut handles = Vec::with_capacity(workers);
		let mut spawn_error = None;
		for worker in 0..workers {
			let (next_call, aborted, start_gate) = (&next_call, &aborted, &start_gate);

			let handle = thread::Builder::new()
				.name(format!("harness-worker-{}", worker))
				.spawn_scoped(s, move || {
					drop(start_gate.read().unwrap_or_else(PoisonError::into_inner));
					if aborted.load(Ordering::Acquire) {
						return Vec::new()
					}

					let mut outcomes = Vec::new();
					loop {
						let call = next_call.fetch_add(1, Ordering::Relaxed);
						if call >= total_calls {
							break
						}

						// The session is dropped, and its connection closed, before the next call.
						let outcome =
							connector.connect().and_then(|session| path.increment(&session, id));
						if let Err(e) = &outcome {
							warn!(worker, call, error = %e, "Increment failed");
						}
						outcomes.push((call, outcome));
					}
					outcomes
				});

			match handle {
				Ok(handle) => handles.push(handle),
				Err(e) => {
					error!(worker, "Failed to spawn harness worker: {}", e);
					aborted.store(true, Ordering::Release);
					spawn_error = Some(e);
					break
				},
			}
		}
		drop(gate);

		for handle in handles {
			match handle.join() {
				Ok(outcomes) =>
					for (call, outcome) in outcomes {
						match outcome {
							Ok(_) => successes += 1,
							Err(error) => failures.push(CallFailure { call, error }),
						}
					},
				Err(payload) => panics.push(panic_message(payload)),
			}
		}

		spawn_error.map_or(Ok(()), |e| Err(HarnessError::WorkerSpawn(e)))
	});
	spawned?;

	if !panics.is_empty() {
		error!(
			panicked = panics.len(),
			successes,
			failed = failures.len(),
			"Harness workers panicked, discarding the run"
		);
		return Err(HarnessError::WorkerPanicked(panics.join("; ")))
	}

	failures.sort_by_key(|failure| failure.call);

	Ok((successes, failures))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
	match payload.downcast_ref::<&str>() {
		Some(msg) => msg.to_string(),
		None => payload.downcast_ref::<String>().cloned().unwrap_or_else(|| "unknown".into()),
	}
}

fn worker_panicked(e: JoinError) -> HarnessError {
	let msg = if e.is_panic() { panic_message(e.into_panic()) } else { e.to_string() };

	error!("Harness worker failed: {}", msg);
	HarnessError::WorkerPanicked(msg)
}

fn serialize_display<T: Display, S: Serializer>(
	value: &T,
	serializer: S,
) -> Result<S::Ok, S::Error> {
	serializer.collect_str(value)
}

fn serialize_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
	serializer.serialize_u64(value.as_millis() as u64)
}
