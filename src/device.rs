use std::io;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

#[cfg(test)]
use mockall::automock;

use parking_lot::Mutex;
use thiserror::Error;

use crate::consts::SECTOR_SIZE;

#[derive(Debug, Error)]
pub enum DeviceError {
	#[error("sector {0} is out of range for a device of {1} sectors")]
	OutOfRange(u32, u32),

	#[error("sector I/O failed: {0}")]
	Io(#[from] io::Error),
}

/// Synchronous fixed-sector block device. Buffers passed to `read` and
/// `write` are exactly one sector long; there is no partial I/O.
///
/// Two devices exist in a running kernel: the filesystem device and the
/// swap device.
#[cfg_attr(test, automock)]
pub trait BlockDevice: Send + Sync {
	fn sector_count(&self) -> u32;

	fn read(&self, sector: u32, buf: &mut [u8]) -> Result<(), DeviceError>;

	fn write(&self, sector: u32, buf: &[u8]) -> Result<(), DeviceError>;
}

/// Volatile in-memory device.
pub struct MemDevice {
	sectors: Mutex<Box<[u8]>>,
	sector_count: u32,
}

impl MemDevice {
	pub fn new(sector_count: u32) -> Self {
		Self {
			sectors: Mutex::new(vec![0; sector_count as usize * SECTOR_SIZE].into_boxed_slice()),
			sector_count,
		}
	}

	#[inline]
	fn check(&self, sector: u32, len: usize) -> Result<usize, DeviceError> {
		debug_assert_eq!(len, SECTOR_SIZE);
		if sector >= self.sector_count {
			return Err(DeviceError::OutOfRange(sector, self.sector_count));
		}
		Ok(sector as usize * SECTOR_SIZE)
	}
}

impl BlockDevice for MemDevice {
	fn sector_count(&self) -> u32 {
		self.sector_count
	}

	fn read(&self, sector: u32, buf: &mut [u8]) -> Result<(), DeviceError> {
		let offset = self.check(sector, buf.len())?;
		buf.copy_from_slice(&self.sectors.lock()[offset..offset + SECTOR_SIZE]);
		Ok(())
	}

	fn write(&self, sector: u32, buf: &[u8]) -> Result<(), DeviceError> {
		let offset = self.check(sector, buf.len())?;
		self.sectors.lock()[offset..offset + SECTOR_SIZE].copy_from_slice(buf);
		Ok(())
	}
}

/// Device backed by a regular file, using positional I/O.
#[cfg(unix)]
pub struct FileDevice {
	file: std::fs::File,
	sector_count: u32,
}

#[cfg(unix)]
impl FileDevice {
	pub fn new(file: std::fs::File, sector_count: u32) -> Result<Self, DeviceError> {
		file.set_len(sector_count as u64 * SECTOR_SIZE as u64)?;
		Ok(Self { file, sector_count })
	}

	#[inline]
	fn offset_of(&self, sector: u32) -> Result<u64, DeviceError> {
		if sector >= self.sector_count {
			return Err(DeviceError::OutOfRange(sector, self.sector_count));
		}
		Ok(sector as u64 * SECTOR_SIZE as u64)
	}
}

#[cfg(unix)]
impl BlockDevice for FileDevice {
	fn sector_count(&self) -> u32 {
		self.sector_count
	}

	fn read(&self, sector: u32, buf: &mut [u8]) -> Result<(), DeviceError> {
		debug_assert_eq!(buf.len(), SECTOR_SIZE);
		let offset = self.offset_of(sector)?;
		self.file.read_exact_at(buf, offset)?;
		Ok(())
	}

	fn write(&self, sector: u32, buf: &[u8]) -> Result<(), DeviceError> {
		debug_assert_eq!(buf.len(), SECTOR_SIZE);
		let offset = self.offset_of(sector)?;
		self.file.write_all_at(buf, offset)?;
		Ok(())
	}
}
