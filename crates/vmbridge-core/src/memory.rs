//! Bounds-checked view of guest linear memory.
//!
//! [`LinearMemory`] wraps the guest's [`Memory`] and exposes the handful of
//! accesses the bridge needs, most importantly writing the asyncify control
//! header that describes the [`ScratchRegion`].

use wasmtime::{AsContext, AsContextMut, Memory};

use vmbridge_common::{AsyncifyConfig, BridgeError};

/// Byte range in linear memory reserved for unwind/rewind stack data.
///
/// The guest runtime treats the first word of the control header as its
/// current stack pointer inside this range, so the header reads back as
/// `(start, end)` only while no suspension is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchRegion {
    /// First byte of the region.
    pub start: u32,
    /// One past the last byte of the region.
    pub end: u32,
}

impl ScratchRegion {
    /// Region described by an asyncify configuration.
    pub fn from_config(config: &AsyncifyConfig) -> Self {
        Self {
            start: config.scratch_start,
            end: config.scratch_end,
        }
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    /// Header encoding: two little-endian words.
    pub fn to_header(self) -> [u8; 8] {
        let mut header = [0u8; 8];
        header[..4].copy_from_slice(&self.start.to_le_bytes());
        header[4..].copy_from_slice(&self.end.to_le_bytes());
        header
    }
}

/// Read `len` bytes at `offset` from a memory slice.
pub fn read_slice(mem: &[u8], offset: usize, len: usize) -> Result<&[u8], BridgeError> {
    let end = checked_end(mem.len(), offset, len)?;
    Ok(&mem[offset..end])
}

/// Write `data` at `offset` into a memory slice.
pub fn write_slice(mem: &mut [u8], offset: usize, data: &[u8]) -> Result<(), BridgeError> {
    let end = checked_end(mem.len(), offset, data.len())?;
    mem[offset..end].copy_from_slice(data);
    Ok(())
}

fn checked_end(size: usize, offset: usize, len: usize) -> Result<usize, BridgeError> {
    offset
        .checked_add(len)
        .filter(|end| *end <= size)
        .ok_or(BridgeError::MemoryOutOfBounds { offset, len, size })
}

/// Handle to the guest's linear memory.
#[derive(Debug, Clone, Copy)]
pub struct LinearMemory {
    memory: Memory,
}

impl LinearMemory {
    /// Wrap a Wasmtime memory.
    pub fn new(memory: Memory) -> Self {
        Self { memory }
    }

    /// The underlying Wasmtime memory.
    pub fn inner(&self) -> Memory {
        self.memory
    }

    /// Current size in bytes.
    pub fn size(&self, store: impl AsContext) -> usize {
        self.memory.data_size(store)
    }

    /// Copy `len` bytes out of guest memory.
    pub fn read_bytes(
        &self,
        store: impl AsContext,
        offset: usize,
        len: usize,
    ) -> Result<Vec<u8>, BridgeError> {
        read_slice(self.memory.data(&store), offset, len).map(<[u8]>::to_vec)
    }

    /// Copy `data` into guest memory.
    pub fn write_bytes(
        &self,
        mut store: impl AsContextMut,
        offset: usize,
        data: &[u8],
    ) -> Result<(), BridgeError> {
        write_slice(self.memory.data_mut(&mut store), offset, data)
    }

    /// Read a little-endian 32-bit word.
    pub fn read_u32(&self, store: impl AsContext, offset: usize) -> Result<u32, BridgeError> {
        let bytes = read_slice(self.memory.data(&store), offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Write a little-endian 32-bit word.
    pub fn write_u32(
        &self,
        store: impl AsContextMut,
        offset: usize,
        value: u32,
    ) -> Result<(), BridgeError> {
        self.write_bytes(store, offset, &value.to_le_bytes())
    }

    /// Write the asyncify control header and check the region fits in memory.
    ///
    /// Must run before any guest code executes.
    pub fn write_scratch_header(
        &self,
        mut store: impl AsContextMut,
        config: &AsyncifyConfig,
    ) -> Result<ScratchRegion, BridgeError> {
        let region = ScratchRegion::from_config(config);
        let size = self.size(&store);

        checked_end(size, region.start as usize, region.capacity() as usize)?;
        self.write_bytes(&mut store, config.data_addr as usize, &region.to_header())?;

        Ok(region)
    }

    /// Read the control header back.
    pub fn read_scratch_header(
        &self,
        store: impl AsContext,
        data_addr: u32,
    ) -> Result<ScratchRegion, BridgeError> {
        let data = self.memory.data(&store);
        let bytes = read_slice(data, data_addr as usize, AsyncifyConfig::HEADER_LEN as usize)?;
        Ok(ScratchRegion {
            start: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            end: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::{Engine, MemoryType, Store};

    #[test]
    fn test_read_slice_basic() {
        let mem = vec![10, 20, 30, 40, 50];
        assert_eq!(read_slice(&mem, 1, 3).unwrap(), &[20, 30, 40]);
    }

    #[test]
    fn test_read_slice_out_of_bounds() {
        let mem = vec![10, 20, 30];
        assert!(read_slice(&mem, 1, 3).is_err());
        assert!(read_slice(&mem, usize::MAX, 2).is_err());
        assert!(read_slice(&mem, 3, 0).is_ok());
    }

    #[test]
    fn test_write_slice_basic() {
        let mut mem = vec![0u8; 6];
        write_slice(&mut mem, 2, &[1, 2, 3]).unwrap();
        assert_eq!(mem, vec![0, 0, 1, 2, 3, 0]);
    }

    #[test]
    fn test_write_slice_out_of_bounds() {
        let mut mem = vec![0u8; 4];
        let err = write_slice(&mut mem, 2, &[1, 2, 3]).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::MemoryOutOfBounds {
                offset: 2,
                len: 3,
                size: 4
            }
        ));
    }

    #[test]
    fn test_region_header_encoding() {
        let region = ScratchRegion { start: 24, end: 1024 };
        assert_eq!(region.capacity(), 1000);
        assert_eq!(region.to_header(), [24, 0, 0, 0, 0, 4, 0, 0]);
    }

    #[test]
    fn test_write_scratch_header() {
        let engine = Engine::default();
        let mut store = Store::new(&engine, ());
        let memory = Memory::new(&mut store, MemoryType::new(1, None)).unwrap();
        let view = LinearMemory::new(memory);

        let config = AsyncifyConfig::default();
        let region = view.write_scratch_header(&mut store, &config).unwrap();

        assert_eq!(region, ScratchRegion { start: 24, end: 1024 });
        assert_eq!(view.read_u32(&store, 16).unwrap(), 24);
        assert_eq!(view.read_u32(&store, 20).unwrap(), 1024);
        assert_eq!(view.read_scratch_header(&store, 16).unwrap(), region);
    }

    #[test]
    fn test_scratch_region_outside_memory() {
        let engine = Engine::default();
        let mut store = Store::new(&engine, ());
        let memory = Memory::new(&mut store, MemoryType::new(1, None)).unwrap();
        let view = LinearMemory::new(memory);

        let config = AsyncifyConfig {
            data_addr: 16,
            scratch_start: 65_000,
            scratch_end: 70_000,
        };
        let result = view.write_scratch_header(&mut store, &config);

        assert!(matches!(result, Err(BridgeError::MemoryOutOfBounds { .. })));
        // Header untouched
        assert_eq!(view.read_u32(&store, 16).unwrap(), 0);
    }
}
