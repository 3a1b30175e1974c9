//! Work Completion types.

use std::fmt;

/// A work completion entry.
///
/// `wr_id` carries the tag of the work request that produced it; in this
/// crate that is always the index of the originating QP.
#[derive(Clone, Copy)]
pub struct WorkCompletion {
    pub(crate) wr_id: u64,
    pub(crate) status: WcStatus,
    pub(crate) opcode: WcOpcode,
    pub(crate) vendor_err: u32,
    pub(crate) byte_len: u32,
    pub(crate) qp_num: u32,
}

impl Default for WorkCompletion {
    fn default() -> Self {
        Self {
            wr_id: 0,
            status: WcStatus::Success,
            opcode: WcOpcode::Send,
            vendor_err: 0,
            byte_len: 0,
            qp_num: 0,
        }
    }
}

impl WorkCompletion {
    /// Build a completion entry. Used by providers.
    pub fn new(wr_id: u64, status: WcStatus, opcode: WcOpcode, byte_len: u32, qp_num: u32) -> Self {
        Self {
            wr_id,
            status,
            opcode,
            vendor_err: 0,
            byte_len,
            qp_num,
        }
    }

    /// The WR id that was completed.
    pub fn wr_id(&self) -> u64 {
        self.wr_id
    }

    /// Index of the QP this completion belongs to.
    pub fn tag(&self) -> usize {
        self.wr_id as usize
    }

    /// Whether this completion is successful.
    pub fn is_success(&self) -> bool {
        self.status == WcStatus::Success
    }

    /// Typed status.
    pub fn status(&self) -> WcStatus {
        self.status
    }

    /// Typed opcode.
    pub fn opcode(&self) -> WcOpcode {
        self.opcode
    }

    /// Vendor-specific error code.
    pub fn vendor_err(&self) -> u32 {
        self.vendor_err
    }

    /// Number of bytes transferred (for recv completions).
    pub fn byte_len(&self) -> u32 {
        self.byte_len
    }

    /// QP number that generated this completion.
    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }
}

impl fmt::Debug for WorkCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkCompletion")
            .field("wr_id", &self.wr_id)
            .field("status", &self.status)
            .field("opcode", &self.opcode)
            .field("byte_len", &self.byte_len)
            .field("qp_num", &self.qp_num)
            .finish()
    }
}

/// Work completion status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    LocLenErr,
    LocQpOpErr,
    LocProtErr,
    WrFlushErr,
    BadRespErr,
    LocAccessErr,
    RemInvReqErr,
    RemAccessErr,
    RemOpErr,
    RetryExcErr,
    RnrRetryExcErr,
    FatalErr,
    GeneralErr,
}

impl WcStatus {
    /// Human-readable description (`ibv_wc_status_str`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::LocLenErr => "local length error",
            Self::LocQpOpErr => "local QP operation error",
            Self::LocProtErr => "local protection error",
            Self::WrFlushErr => "Work Request Flushed Error",
            Self::BadRespErr => "bad response error",
            Self::LocAccessErr => "local access error",
            Self::RemInvReqErr => "remote invalid request error",
            Self::RemAccessErr => "remote access error",
            Self::RemOpErr => "remote operation error",
            Self::RetryExcErr => "transport retry counter exceeded",
            Self::RnrRetryExcErr => "RNR retry counter exceeded",
            Self::FatalErr => "fatal error",
            Self::GeneralErr => "general error",
        }
    }
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work completion opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    Recv,
}

impl WcOpcode {
    /// Whether this completion reports a receive.
    pub fn is_recv(self) -> bool {
        matches!(self, Self::Recv)
    }
}
