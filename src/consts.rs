use std::time::Duration;

/// Block-device addressable unit.
pub const SECTOR_SIZE: usize = 512;

/// Virtual-memory page size. Must be a multiple of [`SECTOR_SIZE`].
pub const PAGE_SIZE: usize = 4096;

/// Sectors occupied by one page in a swap slot.
pub(crate) const PAGE_SECTORS: usize = PAGE_SIZE / SECTOR_SIZE;

/// First kernel virtual address; everything below it is user space.
pub const KERNEL_BASE: u64 = 0xc000_0000;

/// Bytes below the recorded stack pointer that still count as a valid
/// stack access (covers push/pusha-style accesses ahead of the pointer).
pub(crate) const STACK_SLACK: u64 = 32;

/// Maximum number of stack pages a single process may fault in.
pub(crate) const STACK_PAGE_LIMIT: usize = 2000;

/// Number of entries in the sector cache.
pub(crate) const CACHE_CNT: usize = 64;

/// Sector number that marks an unbound cache entry or an unallocated
/// inode pointer.
pub(crate) const INVALID_SECTOR: u32 = u32::MAX;

/// Magic value identifying a well-formed on-disk inode.
pub(crate) const INODE_MAGIC: u32 = 0x494e_4f44;

/// Shape of the on-disk inode index: direct pointers, then one indirect
/// pointer, then one double-indirect pointer.
pub(crate) const DIRECT_CNT: usize = 123;
pub(crate) const INDIRECT_CNT: usize = 1;
pub(crate) const DBL_INDIRECT_CNT: usize = 1;
pub(crate) const SECTOR_PTR_CNT: usize = DIRECT_CNT + INDIRECT_CNT + DBL_INDIRECT_CNT;

/// Sector pointers held by one index sector.
pub(crate) const PTRS_PER_SECTOR: usize = SECTOR_SIZE / 4;

/// Largest number of data sectors a single inode can address.
pub(crate) const MAX_FILE_SECTORS: usize =
	DIRECT_CNT + INDIRECT_CNT * PTRS_PER_SECTOR + DBL_INDIRECT_CNT * PTRS_PER_SECTOR * PTRS_PER_SECTOR;

pub(crate) const DEFAULT_FLUSH_PERIOD: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_CACHE_RETRY: Duration = Duration::from_secs(1);

/// Pending read-ahead submissions beyond this are dropped.
pub(crate) const READ_AHEAD_QUEUE_CAP: usize = 64;
