use std::{collections::HashMap, mem, sync::Arc};

use log::warn;
use parking_lot::{Condvar, Mutex};
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
	consts::{
		DIRECT_CNT, INDIRECT_CNT, INODE_MAGIC, INVALID_SECTOR, MAX_FILE_SECTORS, PTRS_PER_SECTOR,
		SECTOR_PTR_CNT, SECTOR_SIZE,
	},
	fs::{cache::LockMode, FsCtx, FsError},
};

/// On-disk inode record; exactly one sector. Unallocated pointers hold
/// [`INVALID_SECTOR`]. The indirect and double-indirect pointers sit at
/// the end of the table.
#[derive(Debug, Immutable, KnownLayout, FromBytes, IntoBytes)]
#[repr(C, packed)]
struct DiskInode {
	length: u32,
	kind: u32,
	magic: u32,
	sectors: [u32; SECTOR_PTR_CNT],
}

const_assert_eq!(mem::size_of::<DiskInode>(), SECTOR_SIZE);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InodeKind {
	File,
	Directory,
}

impl InodeKind {
	fn from_raw(raw: u32) -> Self {
		match raw {
			1 => Self::Directory,
			_ => Self::File,
		}
	}

	fn to_raw(self) -> u32 {
		match self {
			Self::File => 0,
			Self::Directory => 1,
		}
	}
}

/// Offsets taken at each index level for logical sector `sector_idx`,
/// and how many levels the walk has.
fn calculate_indices(sector_idx: usize) -> ([usize; 3], usize) {
	if sector_idx < DIRECT_CNT {
		([sector_idx, 0, 0], 1)
	} else if sector_idx < DIRECT_CNT + PTRS_PER_SECTOR {
		([DIRECT_CNT, sector_idx - DIRECT_CNT, 0], 2)
	} else {
		let offset = sector_idx - DIRECT_CNT - PTRS_PER_SECTOR;
		(
			[
				DIRECT_CNT + INDIRECT_CNT,
				offset / PTRS_PER_SECTOR,
				offset % PTRS_PER_SECTOR,
			],
			3,
		)
	}
}

fn index_ptr(bytes: &[u8], index: usize) -> u32 {
	u32::from_ne_bytes(bytes[index * 4..index * 4 + 4].try_into().unwrap())
}

fn set_index_ptr(bytes: &mut [u8], index: usize, value: u32) {
	bytes[index * 4..index * 4 + 4].copy_from_slice(&value.to_ne_bytes());
}

struct InodeState {
	open_count: usize,
	removed: bool,
}

struct WriteGate {
	deny_write_count: usize,
	writer_count: usize,
}

/// An open inode. All disk access goes through the sector cache; the
/// record sector doubles as the inode number.
pub struct Inode {
	sector: u32,
	ctx: Arc<FsCtx>,
	state: Mutex<InodeState>,
	write_gate: Mutex<WriteGate>,
	/// Signaled when `writer_count` drops to zero and when a deny is
	/// lifted.
	no_writers: Condvar,
}

/// Write admission held for the duration of one `write_at`.
struct WriterGuard<'a> {
	inode: &'a Inode,
}

impl Drop for WriterGuard<'_> {
	fn drop(&mut self) {
		let mut gate = self.inode.write_gate.lock();
		gate.writer_count -= 1;
		if gate.writer_count == 0 {
			self.inode.no_writers.notify_all();
		}
	}
}

impl Inode {
	#[inline]
	pub fn sector(&self) -> u32 {
		self.sector
	}

	fn with_disk<R>(&self, f: impl FnOnce(&DiskInode) -> R) -> Result<R, FsError> {
		let handle = self.ctx.cache.lock(self.sector, LockMode::NonExclusive);
		let bytes = handle.read()?;
		let disk = DiskInode::ref_from_bytes(bytes).expect("inode record size mismatch");
		Ok(f(disk))
	}

	fn with_disk_mut<R>(&self, f: impl FnOnce(&mut DiskInode) -> R) -> Result<R, FsError> {
		let mut handle = self.ctx.cache.lock(self.sector, LockMode::Exclusive);
		let bytes = handle.read_mut()?;
		let disk = DiskInode::mut_from_bytes(bytes).expect("inode record size mismatch");
		let result = f(disk);
		handle.mark_dirty();
		Ok(result)
	}

	pub fn length(&self) -> Result<u64, FsError> {
		self.with_disk(|disk| disk.length as u64)
	}

	pub fn kind(&self) -> Result<InodeKind, FsError> {
		self.with_disk(|disk| InodeKind::from_raw(disk.kind))
	}

	/// Marks the inode for deallocation when the last opener closes it.
	pub fn remove(&self) {
		self.state.lock().removed = true;
	}

	/// Resolves logical sector `sector_idx` without allocating. `None`
	/// means the index walk hit an unallocated pointer (a sparse hole).
	fn lookup_data_sector(&self, sector_idx: usize) -> Result<Option<u32>, FsError> {
		let (offsets, levels) = calculate_indices(sector_idx);
		let mut current = self.sector;
		for level in 0..levels {
			let handle = self.ctx.cache.lock(current, LockMode::NonExclusive);
			let bytes = handle.read()?;
			let ptr = if level == 0 {
				let sectors = DiskInode::ref_from_bytes(bytes)
					.expect("inode record size mismatch")
					.sectors;
				sectors[offsets[0]]
			} else {
				index_ptr(bytes, offsets[level])
			};
			if ptr == INVALID_SECTOR {
				return Ok(None);
			}
			current = ptr;
		}
		Ok(Some(current))
	}

	/// Resolves logical sector `sector_idx`, allocating any missing index
	/// and data sectors on the way. A fresh data sector starts zeroed; a
	/// fresh index sector starts all-ones so every pointer reads invalid.
	fn ensure_data_sector(&self, sector_idx: usize) -> Result<u32, FsError> {
		let (offsets, levels) = calculate_indices(sector_idx);
		let mut current = self.sector;
		for level in 0..levels {
			let is_data_level = level + 1 == levels;
			let mut handle = self.ctx.cache.lock(current, LockMode::Exclusive);
			let bytes = handle.read_mut()?;
			let existing = if level == 0 {
				let sectors = DiskInode::ref_from_bytes(&*bytes)
					.expect("inode record size mismatch")
					.sectors;
				sectors[offsets[0]]
			} else {
				index_ptr(bytes, offsets[level])
			};
			let next = if existing != INVALID_SECTOR {
				existing
			} else {
				let fresh = self.ctx.free_map.allocate()?;
				{
					let mut child = self.ctx.cache.lock(fresh, LockMode::Exclusive);
					let data = child.zero();
					if !is_data_level {
						data.fill(0xff);
					}
					child.mark_dirty();
				}
				if level == 0 {
					let disk =
						DiskInode::mut_from_bytes(bytes).expect("inode record size mismatch");
					let mut sectors = disk.sectors;
					sectors[offsets[0]] = fresh;
					disk.sectors = sectors;
				} else {
					set_index_ptr(bytes, offsets[level], fresh);
				}
				handle.mark_dirty();
				fresh
			};
			drop(handle);
			current = next;
		}
		Ok(current)
	}

	/// Reads up to `buf.len()` bytes at `offset`, stopping at end of
	/// file. Sparse holes read as zeros.
	pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FsError> {
		let length = self.length()?;
		let mut bytes_read = 0;
		while bytes_read < buf.len() {
			let pos = offset + bytes_read as u64;
			if pos >= length {
				break;
			}
			let sector_idx = (pos / SECTOR_SIZE as u64) as usize;
			let sector_ofs = (pos % SECTOR_SIZE as u64) as usize;
			let chunk = (buf.len() - bytes_read)
				.min((length - pos) as usize)
				.min(SECTOR_SIZE - sector_ofs);

			match self.lookup_data_sector(sector_idx)? {
				Some(sector) => {
					let handle = self.ctx.cache.lock(sector, LockMode::NonExclusive);
					let data = handle.read()?;
					buf[bytes_read..bytes_read + chunk]
						.copy_from_slice(&data[sector_ofs..sector_ofs + chunk]);
				}
				None => buf[bytes_read..bytes_read + chunk].fill(0),
			}
			bytes_read += chunk;
		}
		Ok(bytes_read)
	}

	/// Writes `buf` at `offset`, allocating sparsely and extending the
	/// length when the write ends past it. Returns the bytes written,
	/// which falls short only at the index ceiling. Waits while writes
	/// are denied.
	pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, FsError> {
		let _writer = self.begin_write();

		let mut written = 0;
		while written < buf.len() {
			let pos = offset + written as u64;
			let sector_idx = (pos / SECTOR_SIZE as u64) as usize;
			if sector_idx >= MAX_FILE_SECTORS {
				break;
			}
			let sector_ofs = (pos % SECTOR_SIZE as u64) as usize;
			let chunk = (buf.len() - written).min(SECTOR_SIZE - sector_ofs);

			let sector = self.ensure_data_sector(sector_idx)?;
			let mut handle = self.ctx.cache.lock(sector, LockMode::Exclusive);
			let data = if sector_ofs == 0 && chunk == SECTOR_SIZE {
				// Full overwrite: the old contents do not matter.
				handle.zero()
			} else {
				handle.read_mut()?
			};
			data[sector_ofs..sector_ofs + chunk].copy_from_slice(&buf[written..written + chunk]);
			handle.mark_dirty();
			drop(handle);
			written += chunk;
		}

		if written > 0 {
			let end = offset + written as u64;
			self.with_disk_mut(|disk| {
				if (disk.length as u64) < end {
					disk.length = end as u32;
				}
			})?;
		}
		Ok(written)
	}

	fn begin_write(&self) -> WriterGuard<'_> {
		let mut gate = self.write_gate.lock();
		while gate.deny_write_count > 0 {
			self.no_writers.wait(&mut gate);
		}
		gate.writer_count += 1;
		WriterGuard { inode: self }
	}

	/// Blocks new writers and waits for active ones to drain. Callable at
	/// most once per opener; paired with `allow_write`.
	pub fn deny_write(&self) {
		let open_count = self.state.lock().open_count;
		let mut gate = self.write_gate.lock();
		gate.deny_write_count += 1;
		debug_assert!(gate.deny_write_count <= open_count);
		while gate.writer_count > 0 {
			self.no_writers.wait(&mut gate);
		}
	}

	pub fn allow_write(&self) {
		let mut gate = self.write_gate.lock();
		debug_assert!(gate.deny_write_count > 0);
		gate.deny_write_count -= 1;
		if gate.deny_write_count == 0 {
			self.no_writers.notify_all();
		}
	}

	#[cfg(test)]
	pub(crate) fn open_count(&self) -> usize {
		self.state.lock().open_count
	}

	#[cfg(test)]
	pub(crate) fn deny_write_count(&self) -> usize {
		self.write_gate.lock().deny_write_count
	}
}

/// The open-inodes registry: one in-memory inode per record sector.
pub struct InodeManager {
	ctx: Arc<FsCtx>,
	open: Mutex<HashMap<u32, Arc<Inode>>>,
}

impl InodeManager {
	pub(crate) fn new(ctx: Arc<FsCtx>) -> Self {
		Self {
			ctx,
			open: Mutex::new(HashMap::new()),
		}
	}

	/// Writes a fresh record of `length` bytes (all of it sparse) into
	/// `sector`. The caller owns the sector via the free map.
	pub fn create(&self, sector: u32, length: u32, kind: InodeKind) -> Result<(), FsError> {
		let mut handle = self.ctx.cache.lock(sector, LockMode::Exclusive);
		let bytes = handle.zero();
		let disk = DiskInode::mut_from_bytes(bytes).expect("inode record size mismatch");
		disk.length = length;
		disk.kind = kind.to_raw();
		disk.magic = INODE_MAGIC;
		disk.sectors = [INVALID_SECTOR; SECTOR_PTR_CNT];
		handle.mark_dirty();
		Ok(())
	}

	/// Opens the inode at `sector`, returning the already-open instance
	/// when there is one.
	pub fn open(&self, sector: u32) -> Result<Arc<Inode>, FsError> {
		let mut open = self.open.lock();
		if let Some(inode) = open.get(&sector) {
			inode.state.lock().open_count += 1;
			return Ok(Arc::clone(inode));
		}

		let inode = Arc::new(Inode {
			sector,
			ctx: Arc::clone(&self.ctx),
			state: Mutex::new(InodeState {
				open_count: 1,
				removed: false,
			}),
			write_gate: Mutex::new(WriteGate {
				deny_write_count: 0,
				writer_count: 0,
			}),
			no_writers: Condvar::new(),
		});
		if inode.with_disk(|disk| disk.magic)? != INODE_MAGIC {
			return Err(FsError::InvalidInode(sector));
		}
		open.insert(sector, Arc::clone(&inode));
		Ok(inode)
	}

	/// Registers another opener of an already-open inode.
	pub fn reopen(&self, inode: &Arc<Inode>) -> Arc<Inode> {
		inode.state.lock().open_count += 1;
		Arc::clone(inode)
	}

	/// Drops one reference. The last close removes the inode from the
	/// registry and, if it was removed, returns all its sectors to the
	/// free map.
	pub fn close(&self, inode: &Arc<Inode>) {
		let mut open = self.open.lock();
		let mut state = inode.state.lock();
		debug_assert!(state.open_count > 0);
		state.open_count -= 1;
		if state.open_count > 0 {
			return;
		}
		open.remove(&inode.sector);
		let removed = state.removed;
		drop(state);
		drop(open);

		if removed {
			if let Err(err) = self.deallocate(inode) {
				warn!("deallocating inode {}: {err}", inode.sector);
			}
		}
	}

	/// Recursively walks every pointer, scrubbing each sector from the
	/// cache and returning it to the free map; the record sector goes
	/// last.
	fn deallocate(&self, inode: &Arc<Inode>) -> Result<(), FsError> {
		let sectors = inode.with_disk(|disk| disk.sectors)?;

		for &sector in sectors.iter().take(DIRECT_CNT) {
			if sector != INVALID_SECTOR {
				self.release_sector(sector);
			}
		}
		let indirect = sectors[DIRECT_CNT];
		if indirect != INVALID_SECTOR {
			self.release_index_sector(indirect, 1)?;
		}
		let dbl_indirect = sectors[DIRECT_CNT + INDIRECT_CNT];
		if dbl_indirect != INVALID_SECTOR {
			self.release_index_sector(dbl_indirect, 2)?;
		}

		self.release_sector(inode.sector);
		Ok(())
	}

	fn release_index_sector(&self, sector: u32, depth: usize) -> Result<(), FsError> {
		let mut ptrs = [INVALID_SECTOR; PTRS_PER_SECTOR];
		{
			let handle = self.ctx.cache.lock(sector, LockMode::NonExclusive);
			let bytes = handle.read()?;
			for (i, ptr) in ptrs.iter_mut().enumerate() {
				*ptr = index_ptr(bytes, i);
			}
		}
		for &ptr in ptrs.iter().filter(|&&p| p != INVALID_SECTOR) {
			if depth == 1 {
				self.release_sector(ptr);
			} else {
				self.release_index_sector(ptr, depth - 1)?;
			}
		}
		self.release_sector(sector);
		Ok(())
	}

	fn release_sector(&self, sector: u32) {
		// Scrub the cached copy so stale bytes cannot resurface when the
		// sector is reallocated, then drop the binding entirely.
		{
			let mut handle = self.ctx.cache.lock(sector, LockMode::Exclusive);
			handle.zero();
		}
		self.ctx.cache.free(sector);
		self.ctx.free_map.release(sector);
	}

	#[cfg(test)]
	pub(crate) fn open_inode_count(&self) -> usize {
		self.open.lock().len()
	}
}

#[cfg(test)]
mod tests {
	use std::{
		sync::{
			atomic::{AtomicBool, Ordering},
			mpsc,
		},
		thread,
		time::Duration,
	};

	use crate::fs::test_helpers::fs_fixture;

	use super::*;

	#[test]
	fn index_translation_levels() {
		assert_eq!(calculate_indices(0), ([0, 0, 0], 1));
		assert_eq!(calculate_indices(122), ([122, 0, 0], 1));
		assert_eq!(calculate_indices(123), ([123, 0, 0], 2));
		assert_eq!(calculate_indices(250), ([123, 127, 0], 2));
		assert_eq!(calculate_indices(251), ([124, 0, 0], 3));
		assert_eq!(calculate_indices(251 + 129), ([124, 1, 1], 3));
		assert_eq!(
			calculate_indices(MAX_FILE_SECTORS - 1),
			([124, 127, 127], 3)
		);
	}

	#[test]
	fn open_returns_the_same_instance() {
		let (fx, _runner) = fs_fixture(1024);
		let sector = fx.free_map.allocate().unwrap();
		fx.inodes.create(sector, 0, InodeKind::File).unwrap();

		let a = fx.inodes.open(sector).unwrap();
		let b = fx.inodes.open(sector).unwrap();
		assert!(Arc::ptr_eq(&a, &b));
		assert_eq!(a.open_count(), 2);

		fx.inodes.close(&b);
		assert_eq!(a.open_count(), 1);
		fx.inodes.close(&a);
		assert_eq!(fx.inodes.open_inode_count(), 0);
	}

	#[test]
	fn open_rejects_garbage_sectors() {
		let (fx, _runner) = fs_fixture(1024);
		let sector = fx.free_map.allocate().unwrap();

		assert!(matches!(
			fx.inodes.open(sector),
			Err(FsError::InvalidInode(_))
		));
	}

	#[test]
	fn sparse_write_extends_and_reads_zeros() {
		// A four-byte write at 1 MiB leaves everything below it a hole.
		let (fx, _runner) = fs_fixture(8192);
		let sector = fx.free_map.allocate().unwrap();
		fx.inodes.create(sector, 0, InodeKind::File).unwrap();
		let inode = fx.inodes.open(sector).unwrap();

		assert_eq!(inode.write_at(b"abcd", 1_048_576).unwrap(), 4);
		assert_eq!(inode.length().unwrap(), 1_048_580);

		let mut head = [0xff; 4];
		assert_eq!(inode.read_at(&mut head, 0).unwrap(), 4);
		assert_eq!(head, [0, 0, 0, 0]);

		let mut tail = [0; 4];
		assert_eq!(inode.read_at(&mut tail, 1_048_576).unwrap(), 4);
		assert_eq!(&tail, b"abcd");

		fx.inodes.close(&inode);
	}

	#[test]
	fn reads_stop_at_end_of_file() {
		let (fx, _runner) = fs_fixture(1024);
		let sector = fx.free_map.allocate().unwrap();
		fx.inodes.create(sector, 0, InodeKind::File).unwrap();
		let inode = fx.inodes.open(sector).unwrap();

		inode.write_at(b"hello", 0).unwrap();

		let mut buf = [0; 16];
		assert_eq!(inode.read_at(&mut buf, 0).unwrap(), 5);
		assert_eq!(&buf[..5], b"hello");
		assert_eq!(inode.read_at(&mut buf, 5).unwrap(), 0);
		assert_eq!(inode.read_at(&mut buf, 1000).unwrap(), 0);

		fx.inodes.close(&inode);
	}

	#[test]
	fn writes_only_grow_the_length() {
		let (fx, _runner) = fs_fixture(1024);
		let sector = fx.free_map.allocate().unwrap();
		fx.inodes.create(sector, 0, InodeKind::File).unwrap();
		let inode = fx.inodes.open(sector).unwrap();

		inode.write_at(&[1; 10], 100).unwrap();
		assert_eq!(inode.length().unwrap(), 110);

		inode.write_at(&[2; 10], 50).unwrap();
		assert_eq!(inode.length().unwrap(), 110);

		fx.inodes.close(&inode);
	}

	#[test]
	fn round_trip_across_index_boundaries() {
		// Straddle the direct/indirect and indirect/double-indirect
		// seams with a write of several sectors each.
		let (fx, _runner) = fs_fixture(8192);
		let sector = fx.free_map.allocate().unwrap();
		fx.inodes.create(sector, 0, InodeKind::File).unwrap();
		let inode = fx.inodes.open(sector).unwrap();

		for &start_sector in &[DIRECT_CNT - 1, DIRECT_CNT + PTRS_PER_SECTOR - 1] {
			let offset = (start_sector * SECTOR_SIZE) as u64 + 100;
			let data: Vec<u8> = (0..3 * SECTOR_SIZE).map(|i| (i % 251) as u8).collect();
			assert_eq!(inode.write_at(&data, offset).unwrap(), data.len());

			let mut back = vec![0; data.len()];
			assert_eq!(inode.read_at(&mut back, offset).unwrap(), data.len());
			assert_eq!(back, data);
		}

		fx.inodes.close(&inode);
	}

	#[test]
	fn writes_stop_at_the_index_ceiling() {
		let (fx, _runner) = fs_fixture(8192);
		let sector = fx.free_map.allocate().unwrap();
		fx.inodes.create(sector, 0, InodeKind::File).unwrap();
		let inode = fx.inodes.open(sector).unwrap();

		let end = (MAX_FILE_SECTORS * SECTOR_SIZE) as u64;
		assert_eq!(inode.write_at(&[9; 8], end - 4).unwrap(), 4);
		assert_eq!(inode.length().unwrap(), end);

		assert_eq!(inode.write_at(&[9; 8], end).unwrap(), 0);

		fx.inodes.close(&inode);
	}

	#[test]
	fn removed_inode_returns_every_sector_on_last_close() {
		let (fx, _runner) = fs_fixture(8192);
		let baseline = fx.free_map.free_sectors();

		let sector = fx.free_map.allocate().unwrap();
		fx.inodes.create(sector, 0, InodeKind::File).unwrap();
		let inode = fx.inodes.open(sector).unwrap();

		// Spread data across direct, indirect and double-indirect ranges.
		inode.write_at(&[1; 64], 0).unwrap();
		inode
			.write_at(&[2; 64], (DIRECT_CNT * SECTOR_SIZE) as u64)
			.unwrap();
		inode
			.write_at(&[3; 64], ((DIRECT_CNT + PTRS_PER_SECTOR) * SECTOR_SIZE) as u64)
			.unwrap();
		assert!(fx.free_map.free_sectors() < baseline - 1);

		inode.remove();
		fx.inodes.close(&inode);

		assert_eq!(fx.free_map.free_sectors(), baseline);
		assert_eq!(fx.inodes.open_inode_count(), 0);
	}

	#[test]
	fn deny_write_blocks_writers_until_allowed() {
		// A writer blocks while the executable image is pinned and
		// proceeds once writes are allowed again.
		let (fx, _runner) = fs_fixture(1024);
		let sector = fx.free_map.allocate().unwrap();
		fx.inodes.create(sector, 0, InodeKind::File).unwrap();

		let pinner = fx.inodes.open(sector).unwrap();
		let writer = fx.inodes.open(sector).unwrap();
		pinner.deny_write();
		assert_eq!(pinner.deny_write_count(), 1);

		let wrote = AtomicBool::new(false);
		let (tx, rx) = mpsc::channel();
		thread::scope(|scope| {
			scope.spawn(|| {
				writer.write_at(b"patched", 0).unwrap();
				wrote.store(true, Ordering::Release);
				tx.send(()).unwrap();
			});

			thread::sleep(Duration::from_millis(50));
			assert!(!wrote.load(Ordering::Acquire), "write went through a deny");

			pinner.allow_write();
			rx.recv_timeout(Duration::from_secs(5)).unwrap();
		});
		assert!(wrote.load(Ordering::Acquire));

		let mut buf = [0; 7];
		pinner.read_at(&mut buf, 0).unwrap();
		assert_eq!(&buf, b"patched");

		fx.inodes.close(&writer);
		fx.inodes.close(&pinner);
	}
}
