//! Session leasing
//!
//! Every facade call runs on its own [`LeasedSession`], obtained from the
//! client's [`SessionPool`] and released when the handle is dropped. Drop
//! runs on success, on error and on cancellation alike, so a lease can never
//! outlive the operation that took it.
//!
//! When the descriptor bounds the pool, leasing takes a permit from a
//! semaphore of `max_pool_size` permits first.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::descriptor::PoolBounds;
use crate::driver::{Driver, Session};
use crate::error::{Error, Result};

/// Lease counters of one pool
#[derive(Debug, Default)]
pub struct LeaseStats {
	acquired: AtomicU64,
	released: AtomicU64,
}

impl LeaseStats {
	/// Total leases handed out
	pub fn acquired(&self) -> u64 {
		self.acquired.load(Ordering::SeqCst)
	}

	/// Total leases returned
	pub fn released(&self) -> u64 {
		self.released.load(Ordering::SeqCst)
	}

	/// Leases currently held; zero whenever no operation is in flight
	pub fn outstanding(&self) -> u64 {
		self.acquired().saturating_sub(self.released())
	}
}

/// Hands out per-operation sessions backed by one shared driver
#[derive(Clone)]
pub struct SessionPool {
	driver: Arc<dyn Driver>,
	permits: Option<Arc<Semaphore>>,
	max_wait: Option<Duration>,
	stats: Arc<LeaseStats>,
}

impl fmt::Debug for SessionPool {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SessionPool")
			.field("available", &self.available())
			.field("max_wait", &self.max_wait)
			.field("stats", &self.stats)
			.finish()
	}
}

impl SessionPool {
	pub fn new(driver: Arc<dyn Driver>, bounds: &PoolBounds) -> Self {
		Self {
			driver,
			permits: bounds
				.max_size
				.map(|size| Arc::new(Semaphore::new(size as usize))),
			max_wait: bounds.max_wait,
			stats: Arc::new(LeaseStats::default()),
		}
	}

	/// Take one session
	///
	/// Waits for a permit when the pool is bounded, at most `max_wait`.
	///
	/// # Errors
	///
	/// [`Error::PoolTimeout`] when no permit frees up in time; any error the
	/// driver raises while opening the session.
	pub async fn lease(&self) -> Result<LeasedSession> {
		let permit = match &self.permits {
			Some(semaphore) => Some(self.acquire_permit(semaphore).await?),
			None => None,
		};

		let session = self.driver.session().await?;
		self.stats.acquired.fetch_add(1, Ordering::SeqCst);
		tracing::debug!(outstanding = self.stats.outstanding(), "session leased");

		Ok(LeasedSession {
			session,
			_permit: permit,
			stats: Arc::clone(&self.stats),
		})
	}

	async fn acquire_permit(&self, semaphore: &Arc<Semaphore>) -> Result<OwnedSemaphorePermit> {
		let acquire = Arc::clone(semaphore).acquire_owned();
		let permit = match self.max_wait {
			Some(wait) => tokio::time::timeout(wait, acquire)
				.await
				.map_err(|_| Error::PoolTimeout(wait))?,
			None => acquire.await,
		};
		permit.map_err(|e| Error::Connection(format!("Session pool closed: {}", e)))
	}

	/// Free permits, or `None` for an unbounded pool
	pub fn available(&self) -> Option<usize> {
		self.permits.as_ref().map(|s| s.available_permits())
	}

	pub fn stats(&self) -> &LeaseStats {
		&self.stats
	}

	pub fn driver(&self) -> &Arc<dyn Driver> {
		&self.driver
	}
}

/// Scoped single-use session
///
/// Derefs to the driver [`Session`]. Not `Clone`: exactly one operation owns
/// it, and dropping it returns both the session and its pool permit.
pub struct LeasedSession {
	session: Box<dyn Session>,
	_permit: Option<OwnedSemaphorePermit>,
	stats: Arc<LeaseStats>,
}

impl LeasedSession {
	/// Downcast to the concrete driver session
	pub fn downcast_mut<S: Session + 'static>(&mut self) -> Option<&mut S> {
		self.session.as_any_mut().downcast_mut::<S>()
	}
}

impl Deref for LeasedSession {
	type Target = dyn Session;

	fn deref(&self) -> &Self::Target {
		self.session.as_ref()
	}
}

impl DerefMut for LeasedSession {
	fn deref_mut(&mut self) -> &mut Self::Target {
		self.session.as_mut()
	}
}

impl Drop for LeasedSession {
	fn drop(&mut self) {
		self.stats.released.fetch_add(1, Ordering::SeqCst);
		tracing::trace!(outstanding = self.stats.outstanding(), "session released");
	}
}
