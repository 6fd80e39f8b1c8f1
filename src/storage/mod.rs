use crate::types::{NewPost, Post, PostId, StorageError};

pub mod common;
#[cfg(feature = "rocksdb")]
pub mod rocksdb;
pub mod sqlite;

pub use common::RetryPolicy;

/// Durable, keyed view counters.
///
/// Every call goes straight to storage. Implementations must never cache the value in process
/// memory, since other connections and processes mutate the same counter.
///
/// # Mutation paths
///
/// - [`CounterStore::increment_atomic`] pushes the `+1` into a single storage operation and is the
///   only path a correct system exposes.
/// - [`CounterStore::increment_unsafe`] reads the value, adds one in process and writes it back.
///   Concurrent callers can overwrite each other's increments. It is only compiled for tests or
///   with the `race-demo` feature.
pub trait CounterStore {
	/// Current view count of a post.
	///
	/// Fails with [`StorageError::NotFound`] if the post does not exist.
	fn read(&self, id: PostId) -> Result<u64, StorageError>;

	/// Read, add one in process, write back. Loses updates under contention.
	///
	/// Fails with [`StorageError::NotFound`] if the post does not exist, and never creates a
	/// counter.
	#[cfg(any(test, feature = "race-demo"))]
	fn increment_unsafe(&self, id: PostId) -> Result<u64, StorageError>;

	/// Increments the counter with one storage-level update and returns the new value.
	///
	/// K successful concurrent calls on the same post raise its counter by exactly K. Fails with
	/// [`StorageError::NotFound`] if the post does not exist, and never creates a counter.
	fn increment_atomic(&self, id: PostId) -> Result<u64, StorageError>;
}

/// Owner of the post records whose existence gates the counters.
pub trait RecordStore {
	/// Validates and inserts a post with a view count of `0`.
	fn create_post(&self, post: NewPost) -> Result<Post, StorageError>;

	fn get_post(&self, id: PostId) -> Result<Post, StorageError>;

	/// Validates and replaces the title and content of a post, bumping `updated_at`.
	///
	/// The view count is left alone, so increments running at the same time are never lost.
	fn update_post(&self, id: PostId, post: NewPost) -> Result<Post, StorageError>;

	/// Deletes a post and its counter. Post ids are never handed out again.
	fn delete_post(&self, id: PostId) -> Result<(), StorageError>;

	/// Puts the counter of an existing post back to `0`.
	fn reset_view_count(&self, id: PostId) -> Result<(), StorageError>;
}

/// Hands out independent storage sessions.
///
/// Each call to [`Connector::connect`] must return a session that shares nothing mutable with
/// other sessions besides the storage itself. Dropping the session releases it.
pub trait Connector: Send + Sync + 'static {
	type Session: CounterStore + RecordStore;

	fn connect(&self) -> Result<Self::Session, StorageError>;
}
