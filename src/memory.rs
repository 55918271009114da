//! Fault-tolerant access to traced-process memory
//!
//! Return values that point at strings are only dereferenced when a record is
//! flushed. By then the pointer may be dangling, so every read goes through a
//! [`MemoryReader`] that reports failure instead of faulting.

use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::io::IoSliceMut;

/// Longest string read through a return-value pointer, in bytes
pub const MAX_STRING_LEN: usize = 256;

/// Capability to read memory without crashing on invalid addresses
pub trait MemoryReader: Send + Sync {
    /// Read up to `len` bytes at `addr`.
    ///
    /// Returns `None` if nothing could be read. A short read returns the bytes
    /// that were readable.
    fn read_memory_safely(&self, addr: usize, len: usize) -> Option<Vec<u8>>;

    /// Read a NUL-terminated narrow string (lossy UTF-8)
    fn read_c_string(&self, addr: usize) -> Option<String> {
        let buf = self.read_memory_safely(addr, MAX_STRING_LEN)?;
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Some(String::from_utf8_lossy(&buf[..end]).into_owned())
    }

    /// Read a NUL-terminated UTF-16LE string (lossy)
    fn read_wide_string(&self, addr: usize) -> Option<String> {
        let buf = self.read_memory_safely(addr, MAX_STRING_LEN * 2)?;
        let units: Vec<u16> = buf
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take_while(|&unit| unit != 0)
            .collect();
        Some(String::from_utf16_lossy(&units))
    }
}

/// Reads another process's memory with `process_vm_readv`
#[derive(Debug, Clone, Copy)]
pub struct ProcessMemory {
    pid: Pid,
}

impl ProcessMemory {
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }
}

impl MemoryReader for ProcessMemory {
    fn read_memory_safely(&self, addr: usize, len: usize) -> Option<Vec<u8>> {
        if addr == 0 || len == 0 {
            return None;
        }

        let mut buf = vec![0u8; len];
        let mut local_iov = [IoSliceMut::new(&mut buf)];
        let remote_iov = [RemoteIoVec { base: addr, len }];

        match process_vm_readv(self.pid, &mut local_iov, &remote_iov) {
            Ok(0) => None,
            Ok(bytes_read) => {
                buf.truncate(bytes_read);
                Some(buf)
            }
            Err(e) => {
                tracing::debug!(addr, len, error = %e, "process_vm_readv failed");
                None
            }
        }
    }
}

/// Memory captured ahead of time, keyed by start address.
///
/// Reads succeed only inside a captured region; a read running past the end
/// of a region returns the readable part.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshot {
    regions: BTreeMap<usize, Vec<u8>>,
}

impl MemorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `bytes` as readable at `addr`, replacing any region starting there
    pub fn insert(&mut self, addr: usize, bytes: Vec<u8>) {
        self.regions.insert(addr, bytes);
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

impl MemoryReader for MemorySnapshot {
    fn read_memory_safely(&self, addr: usize, len: usize) -> Option<Vec<u8>> {
        let (&start, bytes) = self.regions.range(..=addr).next_back()?;
        let offset = addr - start;
        if offset >= bytes.len() || len == 0 {
            return None;
        }
        let end = bytes.len().min(offset + len);
        Some(bytes[offset..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reads_inside_region() {
        let mut mem = MemorySnapshot::new();
        mem.insert(0x1000, b"hello\0world\0".to_vec());

        assert_eq!(mem.read_c_string(0x1000).as_deref(), Some("hello"));
        assert_eq!(mem.read_c_string(0x1006).as_deref(), Some("world"));
    }

    #[test]
    fn test_snapshot_rejects_unmapped() {
        let mut mem = MemorySnapshot::new();
        mem.insert(0x1000, b"abc\0".to_vec());

        assert!(mem.read_memory_safely(0x10, 4).is_none());
        assert!(mem.read_memory_safely(0x1004, 4).is_none());
        assert!(mem.read_c_string(0x2000).is_none());
    }

    #[test]
    fn test_snapshot_short_read() {
        let mut mem = MemorySnapshot::new();
        mem.insert(0x1000, b"abcd".to_vec());

        assert_eq!(mem.read_memory_safely(0x1002, 16), Some(b"cd".to_vec()));
        // No terminator: the readable part is the string
        assert_eq!(mem.read_c_string(0x1000).as_deref(), Some("abcd"));
    }

    #[test]
    fn test_snapshot_wide_string() {
        let mut mem = MemorySnapshot::new();
        let mut bytes: Vec<u8> = "héllo".encode_utf16().flat_map(u16::to_le_bytes).collect();
        bytes.extend_from_slice(&[0, 0]);
        mem.insert(0x3000, bytes);

        assert_eq!(mem.read_wide_string(0x3000).as_deref(), Some("héllo"));
    }

    #[test]
    fn test_process_memory_null_pointer() {
        let mem = ProcessMemory::new(std::process::id() as i32);
        assert!(mem.read_memory_safely(0, 8).is_none());
    }

    #[test]
    fn test_process_memory_reads_self() {
        let data = b"calltrace\0".to_vec();
        let mem = ProcessMemory::new(std::process::id() as i32);
        assert_eq!(mem.pid(), std::process::id() as i32);

        // Reading our own address space needs no ptrace permission
        if let Some(s) = mem.read_c_string(data.as_ptr() as usize) {
            assert_eq!(s, "calltrace");
        }
    }
}
