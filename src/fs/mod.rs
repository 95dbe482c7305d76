//! The filesystem core: a bounded concurrently-accessed sector cache and
//! an indexed-inode layer on top of it, plus a thin façade handing out
//! positioned file handles. Files are addressed by their inode sector;
//! the directory layer lives elsewhere.

use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc,
};

use parking_lot::Mutex;
use thiserror::Error;

use crate::{
	device::{BlockDevice, DeviceError},
	tasks::TaskRunner,
};

pub mod cache;
pub mod freemap;
pub mod inode;

pub use cache::{CacheConfig, CacheHandle, LockMode, SectorCache};
pub use freemap::FreeMap;
pub use inode::{Inode, InodeKind, InodeManager};

#[derive(Debug, Error)]
pub enum FsError {
	#[error("no free sectors left on the filesystem device")]
	DiskFull,

	#[error("sector {0} does not hold a well-formed inode")]
	InvalidInode(u32),

	#[error(transparent)]
	Device(#[from] DeviceError),
}

/// Everything the inode layer needs to reach disk: the sector cache and
/// the free-sector map, shared by every open inode.
pub(crate) struct FsCtx {
	pub cache: Arc<SectorCache>,
	pub free_map: Arc<FreeMap>,
}

/// An open file: an inode plus a cursor. Dropping the handle closes the
/// inode (and lifts a deny-write taken through this handle).
pub struct FileHandle {
	inode: Arc<Inode>,
	inodes: Arc<InodeManager>,
	pos: Mutex<u64>,
	denied: AtomicBool,
}

impl FileHandle {
	#[inline]
	pub fn inode(&self) -> &Arc<Inode> {
		&self.inode
	}

	pub fn length(&self) -> Result<u64, FsError> {
		self.inode.length()
	}

	pub fn read(&self, buf: &mut [u8]) -> Result<usize, FsError> {
		let mut pos = self.pos.lock();
		let read = self.inode.read_at(buf, *pos)?;
		*pos += read as u64;
		Ok(read)
	}

	pub fn write(&self, buf: &[u8]) -> Result<usize, FsError> {
		let mut pos = self.pos.lock();
		let written = self.inode.write_at(buf, *pos)?;
		*pos += written as u64;
		Ok(written)
	}

	pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FsError> {
		self.inode.read_at(buf, offset)
	}

	pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, FsError> {
		self.inode.write_at(buf, offset)
	}

	pub fn seek(&self, pos: u64) {
		*self.pos.lock() = pos;
	}

	pub fn tell(&self) -> u64 {
		*self.pos.lock()
	}

	/// Blocks writes to the underlying inode, typically to pin an
	/// executable image. At most one deny per handle; further calls are
	/// no-ops.
	pub fn deny_write(&self) {
		if !self.denied.swap(true, Ordering::AcqRel) {
			self.inode.deny_write();
		}
	}

	pub fn allow_write(&self) {
		if self.denied.swap(false, Ordering::AcqRel) {
			self.inode.allow_write();
		}
	}
}

impl Drop for FileHandle {
	fn drop(&mut self) {
		self.allow_write();
		self.inodes.close(&self.inode);
	}
}

/// Filesystem façade over one block device: owns the cache, the free
/// map and the open-inode registry.
pub struct Filesys {
	ctx: Arc<FsCtx>,
	inodes: Arc<InodeManager>,
}

impl Filesys {
	/// Mounts a filesystem on `device`, reserving sector 0 for the
	/// free-map home and starting the cache's background tasks.
	pub fn new(device: Arc<dyn BlockDevice>, config: &CacheConfig, runner: &TaskRunner) -> Self {
		let sector_count = device.sector_count();
		let cache = Arc::new(SectorCache::new(device, config, runner));
		let free_map = Arc::new(FreeMap::new(sector_count, 1));
		let ctx = Arc::new(FsCtx { cache, free_map });
		let inodes = Arc::new(InodeManager::new(Arc::clone(&ctx)));
		Self { ctx, inodes }
	}

	/// Creates a file of `length` bytes (entirely sparse) and returns
	/// its inode sector.
	pub fn create(&self, length: u32, kind: InodeKind) -> Result<u32, FsError> {
		let sector = self.ctx.free_map.allocate()?;
		if let Err(err) = self.inodes.create(sector, length, kind) {
			self.ctx.free_map.release(sector);
			return Err(err);
		}
		Ok(sector)
	}

	pub fn open(&self, sector: u32) -> Result<FileHandle, FsError> {
		let inode = self.inodes.open(sector)?;
		Ok(FileHandle {
			inode,
			inodes: Arc::clone(&self.inodes),
			pos: Mutex::new(0),
			denied: AtomicBool::new(false),
		})
	}

	/// Marks the file for deletion; its sectors are reclaimed when the
	/// last opener closes it.
	pub fn remove(&self, sector: u32) -> Result<(), FsError> {
		let inode = self.inodes.open(sector)?;
		inode.remove();
		self.inodes.close(&inode);
		Ok(())
	}

	pub fn flush(&self) -> Result<(), DeviceError> {
		self.ctx.cache.flush_all()
	}

	pub fn read_ahead(&self, sector: u32) {
		self.ctx.cache.read_ahead(sector);
	}

	#[cfg(test)]
	pub(crate) fn free_sectors(&self) -> usize {
		self.ctx.free_map.free_sectors()
	}
}

#[cfg(test)]
pub(crate) mod test_helpers {
	use std::{sync::Arc, time::Duration};

	use crate::{
		device::{BlockDevice, MemDevice},
		tasks::TaskRunner,
	};

	use super::{
		cache::{CacheConfig, SectorCache},
		freemap::FreeMap,
		inode::InodeManager,
		FsCtx,
	};

	pub struct FsFixture {
		pub free_map: Arc<FreeMap>,
		pub inodes: InodeManager,
	}

	pub fn test_cache_config() -> CacheConfig {
		CacheConfig {
			flush_period: Duration::from_secs(3600),
			retry_interval: Duration::from_millis(10),
		}
	}

	pub fn fs_fixture(sectors: u32) -> (FsFixture, TaskRunner) {
		let runner = TaskRunner::new().unwrap();
		let device: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(sectors));
		let cache = Arc::new(SectorCache::new(device, &test_cache_config(), &runner));
		let free_map = Arc::new(FreeMap::new(sectors, 1));
		let ctx = Arc::new(FsCtx {
			cache,
			free_map: Arc::clone(&free_map),
		});
		let inodes = InodeManager::new(ctx);
		(FsFixture { free_map, inodes }, runner)
	}
}
