//! Connection state machine: batch RESET → INIT → RTR → RTS.
//!
//! Every batch walks the QPs in index order and stops at the first QP the
//! provider rejects. Nothing is rolled back: QPs before the failing index
//! stay in the new state, the failing QP and everything after it stay where
//! they were. The [`BatchReport`] records exactly that, one entry per QP.

use crate::exchange::ConnectionIdentifier;
use crate::qp::{AddressHandle, GlobalRoute, InitAttr, QpState, QueuePair, RtrAttr, RtsAttr};
use crate::resources::{PathParams, REMOTE_ACCESS};
use crate::{Error, Result};

/// Partition key index used for every QP.
pub const PKEY_INDEX: u16 = 0;

/// Starting packet sequence number on both directions.
pub const START_PSN: u32 = 0;

/// Outstanding RDMA read/atomic operations accepted from the peer.
pub const MAX_DEST_RD_ATOMIC: u8 = 1;

/// Minimum receiver-not-ready NAK timer (encoded, 12 ≈ 0.64 ms).
pub const MIN_RNR_TIMER: u8 = 12;

/// Local ACK timeout (encoded, 14 ≈ 67 ms).
pub const ACK_TIMEOUT: u8 = 14;

/// Transport retry count.
pub const RETRY_CNT: u8 = 7;

/// RNR retry count (7 = infinite).
pub const RNR_RETRY: u8 = 7;

/// Outstanding RDMA read/atomic operations initiated locally.
pub const MAX_RD_ATOMIC: u8 = 1;

/// GRH hop limit.
pub const HOP_LIMIT: u8 = 1;

/// What happened to one QP during a batch.
#[derive(Debug)]
pub enum QpOutcome {
    /// The transition was applied.
    Applied,
    /// The provider rejected the transition; the QP kept its old state.
    Failed(Error),
    /// Not attempted because an earlier QP failed.
    Skipped,
}

impl QpOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Per-QP results of one batch transition.
#[derive(Debug)]
pub struct BatchReport {
    target: QpState,
    outcomes: Vec<QpOutcome>,
}

impl BatchReport {
    fn new(target: QpState, n: usize) -> Self {
        Self {
            target,
            outcomes: (0..n).map(|_| QpOutcome::Skipped).collect(),
        }
    }

    /// The state the batch tried to reach.
    pub fn target(&self) -> QpState {
        self.target
    }

    /// One outcome per QP, in index order.
    pub fn outcomes(&self) -> &[QpOutcome] {
        &self.outcomes
    }

    /// Number of QPs that reached the target state.
    pub fn applied(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_applied()).count()
    }

    /// Whether every QP reached the target state.
    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(QpOutcome::is_applied)
    }

    /// The failing index and its error, if the batch aborted.
    pub fn failure(&self) -> Option<(usize, &Error)> {
        self.outcomes.iter().enumerate().find_map(|(i, o)| match o {
            QpOutcome::Failed(e) => Some((i, e)),
            _ => None,
        })
    }

    /// `Ok` when complete, otherwise the failing QP's error.
    pub fn into_result(self) -> Result<()> {
        for outcome in self.outcomes {
            if let QpOutcome::Failed(e) = outcome {
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Apply `step` to each QP in order, stopping at the first error.
fn run_batch<F>(qps: &[QueuePair], target: QpState, mut step: F) -> BatchReport
where
    F: FnMut(usize, &QueuePair) -> Result<()>,
{
    let mut report = BatchReport::new(target, qps.len());
    for (i, qp) in qps.iter().enumerate() {
        match step(i, qp) {
            Ok(()) => {
                tracing::debug!("QP[{i}] ({:#08x}) -> {target}", qp.qp_num());
                report.outcomes[i] = QpOutcome::Applied;
            }
            Err(e) => {
                tracing::error!("{e}");
                report.outcomes[i] = QpOutcome::Failed(e);
                return report;
            }
        }
    }
    tracing::info!("{} QPs moved to {target}", qps.len());
    report
}

/// The INIT attributes shared by every QP.
pub fn init_attr(port_num: u8) -> InitAttr {
    InitAttr {
        port_num,
        pkey_index: PKEY_INDEX,
        access: REMOTE_ACCESS,
    }
}

/// The RTR attributes for one QP talking to `peer`.
///
/// Global routing is always on, even for an all-zero peer GID.
pub fn rtr_attr(path: &PathParams, peer: &ConnectionIdentifier) -> RtrAttr {
    RtrAttr {
        path_mtu: path.port_attr.active_mtu,
        dest_qp_num: peer.qp_num,
        rq_psn: START_PSN,
        ah: AddressHandle {
            dlid: peer.lid,
            sl: 0,
            src_path_bits: 0,
            port_num: path.port_num,
            is_global: true,
            grh: GlobalRoute {
                dgid: peer.gid,
                flow_label: 0,
                sgid_index: path.sgid_index,
                hop_limit: HOP_LIMIT,
                traffic_class: 0,
            },
        },
        max_dest_rd_atomic: MAX_DEST_RD_ATOMIC,
        min_rnr_timer: MIN_RNR_TIMER,
    }
}

/// The RTS attributes shared by every QP.
pub fn rts_attr() -> RtsAttr {
    RtsAttr {
        timeout: ACK_TIMEOUT,
        retry_cnt: RETRY_CNT,
        rnr_retry: RNR_RETRY,
        sq_psn: START_PSN,
        max_rd_atomic: MAX_RD_ATOMIC,
    }
}

/// RESET → INIT for every QP.
pub fn to_init_all(qps: &[QueuePair], port_num: u8) -> BatchReport {
    let attr = init_attr(port_num);
    run_batch(qps, QpState::Init, |index, qp| {
        qp.to_init(&attr).map_err(|source| Error::Transition {
            index,
            target: QpState::Init,
            source,
        })
    })
}

/// INIT → RTR for every QP, QP `i` connecting to `peers[i]`.
pub fn to_rtr_all(
    qps: &[QueuePair],
    path: &PathParams,
    peers: &[ConnectionIdentifier],
) -> BatchReport {
    run_batch(qps, QpState::Rtr, |index, qp| {
        let peer = peers.get(index).ok_or_else(|| {
            Error::InvalidArg(format!("no peer identifier for QP[{index}]"))
        })?;
        if peer.gid.is_zero() {
            tracing::warn!("peer GID for QP[{index}] is all zero; keeping global routing on");
        }
        qp.to_rtr(&rtr_attr(path, peer))
            .map_err(|source| Error::RtrTransition {
                index,
                peer: *peer,
                source,
            })
    })
}

/// RTR → RTS for every QP.
pub fn to_rts_all(qps: &[QueuePair]) -> BatchReport {
    let attr = rts_attr();
    run_batch(qps, QpState::Rts, |index, qp| {
        qp.to_rts(&attr).map_err(|source| Error::Transition {
            index,
            target: QpState::Rts,
            source,
        })
    })
}

/// Log a snapshot of each QP's attributes at `debug` level.
pub fn log_states(qps: &[QueuePair], title: &str) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    for qp in qps {
        match qp.query() {
            Ok(attr) => tracing::debug!(
                "{title}: QP[{}] {:#08x} state={} port={} mtu={:?} dest_qp={:#08x} \
                 sq_psn={} rq_psn={} timeout={}({:?}) retry={} rnr_retry={} min_rnr={}",
                qp.index(),
                attr.qp_num,
                attr.state,
                attr.port_num,
                attr.path_mtu.map(|m| m.bytes()),
                attr.dest_qp_num,
                attr.sq_psn,
                attr.rq_psn,
                attr.timeout,
                attr.ack_timeout(),
                attr.retry_cnt,
                attr.rnr_retry,
                attr.min_rnr_timer,
            ),
            Err(e) => tracing::debug!("{title}: QP[{}] query failed: {e}", qp.index()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Gid, Mtu, PortAttr, PortState};

    fn path() -> PathParams {
        PathParams {
            port_num: 1,
            port_attr: PortAttr {
                state: PortState::Active,
                active_mtu: Mtu::Mtu2048,
                lid: 0,
                gid_table_len: 2,
            },
            sgid_index: 1,
        }
    }

    #[test]
    fn rtr_uses_port_mtu_and_peer_address() {
        let peer = ConnectionIdentifier {
            qp_num: 0x11,
            lid: 0x22,
            gid: Gid::from_ipv4([10, 0, 0, 2]),
        };
        let attr = rtr_attr(&path(), &peer);
        assert_eq!(attr.path_mtu, Mtu::Mtu2048);
        assert_eq!(attr.dest_qp_num, 0x11);
        assert_eq!(attr.ah.dlid, 0x22);
        assert_eq!(attr.ah.grh.dgid, peer.gid);
        assert_eq!(attr.ah.grh.sgid_index, 1);
        assert_eq!(attr.min_rnr_timer, 12);
    }

    #[test]
    fn zero_gid_keeps_global_routing() {
        let peer = ConnectionIdentifier {
            qp_num: 1,
            lid: 0,
            gid: Gid::ZERO,
        };
        assert!(rtr_attr(&path(), &peer).ah.is_global);
    }

    #[test]
    fn rts_parameters() {
        let attr = rts_attr();
        assert_eq!(
            (attr.timeout, attr.retry_cnt, attr.rnr_retry, attr.sq_psn, attr.max_rd_atomic),
            (14, 7, 7, 0, 1)
        );
    }

    #[test]
    fn empty_batch_is_complete() {
        let report = to_rts_all(&[]);
        assert!(report.is_complete());
        assert_eq!(report.applied(), 0);
        assert!(report.into_result().is_ok());
    }
}
