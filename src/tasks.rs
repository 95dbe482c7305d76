use std::{
	io,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	thread,
	time::{Duration, SystemTime},
};

use futures::{executor::ThreadPool, Future};

/// Periodic timer driven by the task that owns it. `wait` blocks until the
/// next period boundary and returns `false` once the matching
/// [`TimerHandle`] has been dropped.
pub(crate) struct Timer {
	last_run: SystemTime,
	period: Duration,
	active: Arc<AtomicBool>,
}

impl Timer {
	pub fn new(period: Duration) -> (Self, TimerHandle) {
		let active = Arc::new(AtomicBool::new(true));
		let timer = Self {
			last_run: SystemTime::now(),
			period,
			active: Arc::clone(&active),
		};
		(timer, TimerHandle { active })
	}

	pub fn wait(&mut self) -> bool {
		// Sleep in slices so a dropped handle is noticed promptly.
		const SLICE: Duration = Duration::from_millis(100);
		loop {
			if !self.active.load(Ordering::Relaxed) {
				return false;
			}
			let elapsed = SystemTime::now()
				.duration_since(self.last_run)
				.unwrap_or(Duration::ZERO);
			if elapsed >= self.period {
				self.last_run = SystemTime::now();
				return true;
			}
			thread::sleep((self.period - elapsed).min(SLICE));
		}
	}
}

/// Stops the associated [`Timer`] when dropped.
pub(crate) struct TimerHandle {
	active: Arc<AtomicBool>,
}

impl Drop for TimerHandle {
	fn drop(&mut self) {
		self.active.store(false, Ordering::Relaxed);
	}
}

/// Thread pool the kernel's background tasks run on.
pub struct TaskRunner {
	pool: ThreadPool,
}

impl TaskRunner {
	pub fn new() -> Result<Self, io::Error> {
		Ok(Self {
			pool: ThreadPool::builder().pool_size(4).create()?,
		})
	}

	pub(crate) fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
		self.pool.spawn_ok(task);
	}
}
