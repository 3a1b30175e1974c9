//! Work Request builders and related types.

bitflags::bitflags! {
    /// Send flags for work requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SendFlags: u32 {
        const FENCE = 1;
        const SIGNALED = 1 << 1;
        const SOLICITED = 1 << 2;
        const INLINE = 1 << 3;
    }
}

/// Scatter-Gather Entry: describes a memory buffer for a WR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

impl Sge {
    /// Create a new SGE.
    pub fn new(addr: u64, length: u32, lkey: u32) -> Self {
        Self { addr, length, lkey }
    }
}

/// Builder for a receive work request.
#[derive(Debug, Clone)]
pub struct RecvWr {
    pub(crate) wr_id: u64,
    pub(crate) sges: Vec<Sge>,
}

impl RecvWr {
    /// Create a new receive WR with the given WR id.
    pub fn new(wr_id: u64) -> Self {
        Self {
            wr_id,
            sges: Vec::new(),
        }
    }

    /// Add a scatter-gather entry.
    pub fn sg(mut self, sge: Sge) -> Self {
        self.sges.push(sge);
        self
    }

    pub fn wr_id(&self) -> u64 {
        self.wr_id
    }

    pub fn sges(&self) -> &[Sge] {
        &self.sges
    }

    /// Total bytes the receive can absorb.
    pub fn total_len(&self) -> u64 {
        self.sges.iter().map(|s| u64::from(s.length)).sum()
    }
}

/// Opcode for send work requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
}

/// Builder for a send work request.
#[derive(Debug, Clone)]
pub struct SendWr {
    pub(crate) wr_id: u64,
    pub(crate) opcode: WrOpcode,
    pub(crate) send_flags: SendFlags,
    pub(crate) sges: Vec<Sge>,
    pub(crate) rdma_remote_addr: u64,
    pub(crate) rdma_rkey: u32,
}

impl SendWr {
    /// Create a new send WR.
    pub fn new(wr_id: u64, opcode: WrOpcode) -> Self {
        Self {
            wr_id,
            opcode,
            send_flags: SendFlags::empty(),
            sges: Vec::new(),
            rdma_remote_addr: 0,
            rdma_rkey: 0,
        }
    }

    /// Set send flags.
    pub fn flags(mut self, flags: SendFlags) -> Self {
        self.send_flags = flags;
        self
    }

    /// Add a scatter-gather entry.
    pub fn sg(mut self, sge: Sge) -> Self {
        self.sges.push(sge);
        self
    }

    /// Set RDMA remote address and rkey (for RDMA read/write ops).
    pub fn rdma(mut self, remote_addr: u64, rkey: u32) -> Self {
        self.rdma_remote_addr = remote_addr;
        self.rdma_rkey = rkey;
        self
    }

    pub fn wr_id(&self) -> u64 {
        self.wr_id
    }

    pub fn opcode(&self) -> WrOpcode {
        self.opcode
    }

    pub fn send_flags(&self) -> SendFlags {
        self.send_flags
    }

    pub fn sges(&self) -> &[Sge] {
        &self.sges
    }

    /// Remote address and rkey for RDMA opcodes.
    pub fn remote(&self) -> (u64, u32) {
        (self.rdma_remote_addr, self.rdma_rkey)
    }

    /// Total bytes gathered by this request.
    pub fn total_len(&self) -> u64 {
        self.sges.iter().map(|s| u64::from(s.length)).sum()
    }
}
