//! Queue Pair.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::{Error, Result};
use crate::cq::CompletionQueue;
use crate::device::{Gid, Mtu};
use crate::mr::AccessFlags;
use crate::pd::ProtectionDomain;
use crate::provider::QpHandle;
use crate::wr::{RecvWr, SendWr};

/// QP state enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    Reset,
    Init,
    Rtr,
    Rts,
    Err,
}

impl fmt::Display for QpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reset => "RESET",
            Self::Init => "INIT",
            Self::Rtr => "RTR",
            Self::Rts => "RTS",
            Self::Err => "ERROR",
        })
    }
}

/// Initialization attributes for an RC Queue Pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpInitAttr {
    /// Maximum outstanding send work requests.
    pub max_send_wr: u32,
    /// Maximum outstanding recv work requests.
    pub max_recv_wr: u32,
    /// Maximum scatter-gather entries per send WR.
    pub max_send_sge: u32,
    /// Maximum scatter-gather entries per recv WR.
    pub max_recv_sge: u32,
    /// Maximum inline data size.
    pub max_inline_data: u32,
    /// If true, all send WRs generate a completion.
    pub sq_sig_all: bool,
}

impl Default for QpInitAttr {
    fn default() -> Self {
        Self {
            max_send_wr: 16,
            max_recv_wr: 16,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 0,
            sq_sig_all: true,
        }
    }
}

/// RESET → INIT parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitAttr {
    pub port_num: u8,
    pub pkey_index: u16,
    pub access: AccessFlags,
}

/// Global routing header of an address handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalRoute {
    pub dgid: Gid,
    pub flow_label: u32,
    pub sgid_index: u32,
    pub hop_limit: u8,
    pub traffic_class: u8,
}

/// Address handle attributes used to reach the remote QP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressHandle {
    pub dlid: u16,
    pub sl: u8,
    pub src_path_bits: u8,
    pub port_num: u8,
    pub is_global: bool,
    pub grh: GlobalRoute,
}

/// INIT → RTR parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtrAttr {
    pub path_mtu: Mtu,
    pub dest_qp_num: u32,
    pub rq_psn: u32,
    pub ah: AddressHandle,
    pub max_dest_rd_atomic: u8,
    pub min_rnr_timer: u8,
}

/// RTR → RTS parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtsAttr {
    /// Local ACK timeout, encoded as 4.096 µs × 2^timeout.
    pub timeout: u8,
    pub retry_cnt: u8,
    /// 7 means retry forever.
    pub rnr_retry: u8,
    pub sq_psn: u32,
    pub max_rd_atomic: u8,
}

/// A single `modify_qp` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpTransition {
    Init(InitAttr),
    Rtr(RtrAttr),
    Rts(RtsAttr),
    /// Force the QP into ERROR (legal from any state).
    Err,
    /// Return the QP to RESET (legal from any state).
    Reset,
}

impl QpTransition {
    /// The state this transition moves to.
    pub fn target(&self) -> QpState {
        match self {
            Self::Init(_) => QpState::Init,
            Self::Rtr(_) => QpState::Rtr,
            Self::Rts(_) => QpState::Rts,
            Self::Err => QpState::Err,
            Self::Reset => QpState::Reset,
        }
    }

    /// The state a QP must be in for this transition to be legal.
    pub fn required(&self) -> Option<QpState> {
        match self {
            Self::Init(_) => Some(QpState::Reset),
            Self::Rtr(_) => Some(QpState::Init),
            Self::Rts(_) => Some(QpState::Rtr),
            Self::Err | Self::Reset => None,
        }
    }
}

/// Attributes reported by [`QueuePair::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpAttr {
    pub qp_num: u32,
    pub state: QpState,
    pub port_num: u8,
    pub pkey_index: u16,
    pub access: AccessFlags,
    pub path_mtu: Option<Mtu>,
    pub dest_qp_num: u32,
    pub rq_psn: u32,
    pub sq_psn: u32,
    pub ah: Option<AddressHandle>,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub min_rnr_timer: u8,
    pub max_rd_atomic: u8,
    pub max_dest_rd_atomic: u8,
    pub cap: QpInitAttr,
}

impl QpAttr {
    /// Attributes of a freshly created QP in RESET.
    pub fn reset(qp_num: u32, cap: QpInitAttr) -> Self {
        Self {
            qp_num,
            state: QpState::Reset,
            port_num: 0,
            pkey_index: 0,
            access: AccessFlags::empty(),
            path_mtu: None,
            dest_qp_num: 0,
            rq_psn: 0,
            sq_psn: 0,
            ah: None,
            timeout: 0,
            retry_cnt: 0,
            rnr_retry: 0,
            min_rnr_timer: 0,
            max_rd_atomic: 0,
            max_dest_rd_atomic: 0,
            cap,
        }
    }

    /// Fold a successful transition into these attributes.
    pub fn apply(&mut self, transition: &QpTransition) {
        match transition {
            QpTransition::Init(a) => {
                self.port_num = a.port_num;
                self.pkey_index = a.pkey_index;
                self.access = a.access;
            }
            QpTransition::Rtr(a) => {
                self.path_mtu = Some(a.path_mtu);
                self.dest_qp_num = a.dest_qp_num;
                self.rq_psn = a.rq_psn;
                self.ah = Some(a.ah);
                self.max_dest_rd_atomic = a.max_dest_rd_atomic;
                self.min_rnr_timer = a.min_rnr_timer;
            }
            QpTransition::Rts(a) => {
                self.timeout = a.timeout;
                self.retry_cnt = a.retry_cnt;
                self.rnr_retry = a.rnr_retry;
                self.sq_psn = a.sq_psn;
                self.max_rd_atomic = a.max_rd_atomic;
            }
            QpTransition::Err => {}
            QpTransition::Reset => *self = Self::reset(self.qp_num, self.cap),
        }
        self.state = transition.target();
    }

    /// Effective local ACK timeout.
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_nanos(4096u64 << self.timeout)
    }
}

/// An RC Queue Pair.
pub struct QueuePair {
    pub(crate) handle: QpHandle,
    pub(crate) qp_num: u32,
    pub(crate) index: usize,
    pub(crate) pd: Arc<ProtectionDomain>,
    pub(crate) _send_cq: Arc<CompletionQueue>,
    pub(crate) _recv_cq: Arc<CompletionQueue>,
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        if let Err(e) = self.pd.ctx.provider.destroy_qp(self.handle) {
            tracing::error!("destroy_qp(QP[{}] {:#08x}) failed: {e}", self.index, self.qp_num);
        }
    }
}

impl QueuePair {
    /// QP number assigned by the device.
    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }

    /// Position in the owning resource list; also the completion tag.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Current QP state.
    pub fn state(&self) -> Result<QpState> {
        Ok(self.query()?.state)
    }

    /// Query the QP.
    pub fn query(&self) -> Result<QpAttr> {
        Ok(self.pd.ctx.provider.query_qp(self.handle)?)
    }

    /// Apply one transition. Either fully applied or rejected with the QP
    /// left as it was.
    pub fn modify(&self, transition: &QpTransition) -> std::io::Result<()> {
        self.pd.ctx.provider.modify_qp(self.handle, transition)
    }

    /// Transition QP to INIT state.
    pub fn to_init(&self, attr: &InitAttr) -> std::io::Result<()> {
        self.modify(&QpTransition::Init(*attr))
    }

    /// Transition QP to RTR state.
    pub fn to_rtr(&self, attr: &RtrAttr) -> std::io::Result<()> {
        self.modify(&QpTransition::Rtr(*attr))
    }

    /// Transition QP to RTS state.
    pub fn to_rts(&self, attr: &RtsAttr) -> std::io::Result<()> {
        self.modify(&QpTransition::Rts(*attr))
    }

    /// Force the QP into ERROR, flushing outstanding work.
    pub fn to_err(&self) -> std::io::Result<()> {
        self.modify(&QpTransition::Err)
    }

    /// Post a send work request.
    pub fn post_send(&self, wr: &SendWr) -> Result<()> {
        self.pd
            .ctx
            .provider
            .post_send(self.handle, wr)
            .map_err(|source| Error::Post {
                index: self.index,
                op: "send",
                source,
            })
    }

    /// Post a receive work request.
    pub fn post_recv(&self, wr: &RecvWr) -> Result<()> {
        self.pd
            .ctx
            .provider
            .post_recv(self.handle, wr)
            .map_err(|source| Error::Post {
                index: self.index,
                op: "recv",
                source,
            })
    }
}

impl fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuePair")
            .field("index", &self.index)
            .field("qp_num", &format_args!("{:#08x}", self.qp_num))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_timeout_encoding() {
        let mut attr = QpAttr::reset(1, QpInitAttr::default());
        attr.timeout = 14;
        let ms = attr.ack_timeout().as_secs_f64() * 1000.0;
        assert!((ms - 67.1).abs() < 0.1, "got {ms}");
    }

    #[test]
    fn transitions_name_their_source_state() {
        let init = QpTransition::Init(InitAttr {
            port_num: 1,
            pkey_index: 0,
            access: AccessFlags::LOCAL_WRITE,
        });
        assert_eq!(init.required(), Some(QpState::Reset));
        assert_eq!(init.target(), QpState::Init);
        assert_eq!(QpTransition::Err.required(), None);
    }
}
