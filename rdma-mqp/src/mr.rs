//! Memory Region.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::pd::ProtectionDomain;
use crate::provider::MrHandle;

bitflags::bitflags! {
    /// Memory access flags for memory registration and QP access rights.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 1;
        const REMOTE_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
        const REMOTE_ATOMIC = 1 << 3;
    }
}

/// Heap memory handed to a provider for registration.
///
/// The bytes live in a boxed slice that never moves, so [`addr`](Self::addr)
/// stays valid as the base of every scatter-gather entry pointing into it.
pub struct Buffer {
    data: Mutex<Box<[u8]>>,
    addr: u64,
    len: usize,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &self.len)
            .finish()
    }
}

impl Buffer {
    /// Allocate a zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Arc<Self> {
        let data = vec![0u8; len].into_boxed_slice();
        let addr = data.as_ptr() as u64;
        Arc::new(Self {
            data: Mutex::new(data),
            addr,
            len,
        })
    }

    /// Base virtual address.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Lock the bytes for reading or writing.
    pub fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Translate `[addr, addr + len)` into an offset range inside this buffer.
    pub fn range_of(&self, addr: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(addr.checked_sub(self.addr)?).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.len).then_some(start..end)
    }
}

/// A registered memory region.
///
/// Owns the registration and keeps both the PD and the buffer alive. The
/// registration is released first on drop; the buffer is freed once the last
/// `Arc<Buffer>` goes away.
pub struct MemoryRegion {
    pub(crate) handle: MrHandle,
    pub(crate) lkey: u32,
    pub(crate) rkey: u32,
    pub(crate) access: AccessFlags,
    pub(crate) pd: Arc<ProtectionDomain>,
    pub(crate) buf: Arc<Buffer>,
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if let Err(e) = self.pd.ctx.provider.deregister_memory(self.handle) {
            tracing::error!("deregister_memory failed: {e}");
        }
    }
}

impl MemoryRegion {
    /// The local key for this MR.
    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    /// The remote key for this MR.
    pub fn rkey(&self) -> u32 {
        self.rkey
    }

    /// The registered address.
    pub fn addr(&self) -> u64 {
        self.buf.addr()
    }

    /// The registered length.
    pub fn length(&self) -> usize {
        self.buf.len()
    }

    /// Access rights granted at registration.
    pub fn access(&self) -> AccessFlags {
        self.access
    }

    /// The registered buffer.
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_of_stays_inside_buffer() {
        let buf = Buffer::zeroed(64);
        let base = buf.addr();
        assert_eq!(buf.range_of(base, 64), Some(0..64));
        assert_eq!(buf.range_of(base + 16, 8), Some(16..24));
        assert_eq!(buf.range_of(base + 60, 8), None);
        assert_eq!(buf.range_of(base.wrapping_sub(1), 1), None);
    }

    #[test]
    fn buffer_starts_zeroed() {
        let buf = Buffer::zeroed(32);
        assert!(buf.lock().iter().all(|b| *b == 0));
        assert_eq!(buf.len(), 32);
    }
}
