//! Batch state transitions RESET → INIT → RTR → RTS.

use rdma_mqp::connect::{QpOutcome, to_init_all, to_rtr_all, to_rts_all};
use rdma_mqp::device::{Gid, Mtu};
use rdma_mqp::exchange::ConnectionIdentifier;
use rdma_mqp::poller::CompletionPoller;
use rdma_mqp::qp::QpState;
use rdma_mqp::resources::{REMOTE_ACCESS, TransportResources};
use rdma_mqp::soft::Fault;
use rdma_mqp::transfer::post_receive_all;
use rdma_mqp::wc::WcStatus;
use rdma_mqp::{Error, ErrorKind};
use rdma_mqp_tests::{CLIENT_DEVICE, SERVER_DEVICE, TestBed};

/// Two resource sets with every QP in INIT.
fn init_pair(bed: &TestBed, n: usize) -> (TransportResources, TransportResources) {
    let a = bed.resources(SERVER_DEVICE, n);
    let b = bed.resources(CLIENT_DEVICE, n);
    for res in [&a, &b] {
        to_init_all(res.qps(), res.path_params().port_num)
            .into_result()
            .unwrap();
    }
    (a, b)
}

fn states(res: &TransportResources) -> Vec<QpState> {
    res.qps().iter().map(|qp| qp.state().unwrap()).collect()
}

#[test]
fn init_sets_port_and_access() {
    let bed = TestBed::new();
    let res = bed.resources(SERVER_DEVICE, 3);
    let report = to_init_all(res.qps(), 1);
    assert!(report.is_complete());
    assert_eq!(report.target(), QpState::Init);
    for qp in res.qps() {
        let attr = qp.query().unwrap();
        assert_eq!(attr.state, QpState::Init);
        assert_eq!(attr.port_num, 1);
        assert_eq!(attr.pkey_index, 0);
        assert_eq!(attr.access, REMOTE_ACCESS);
    }
}

#[test]
fn full_bring_up_reaches_rts() {
    let bed = TestBed::new();
    let (a, b) = init_pair(&bed, 4);
    let a_ids = a.local_identifiers();
    let b_ids = b.local_identifiers();

    to_rtr_all(a.qps(), a.path_params(), &b_ids).into_result().unwrap();
    to_rtr_all(b.qps(), b.path_params(), &a_ids).into_result().unwrap();
    assert!(states(&a).iter().all(|s| *s == QpState::Rtr));

    to_rts_all(a.qps()).into_result().unwrap();
    to_rts_all(b.qps()).into_result().unwrap();

    for (qp, peer) in a.qps().iter().zip(&b_ids) {
        let attr = qp.query().unwrap();
        assert_eq!(attr.state, QpState::Rts);
        assert_eq!(attr.dest_qp_num, peer.qp_num);
        assert_eq!(attr.path_mtu, Some(Mtu::Mtu1024));
        assert_eq!((attr.rq_psn, attr.sq_psn), (0, 0));
        assert_eq!(attr.min_rnr_timer, 12);
        assert_eq!(attr.max_dest_rd_atomic, 1);
        assert_eq!(attr.max_rd_atomic, 1);
        assert_eq!((attr.timeout, attr.retry_cnt, attr.rnr_retry), (14, 7, 7));

        let ah = attr.ah.expect("address handle set at RTR");
        assert!(ah.is_global);
        assert_eq!(ah.dlid, peer.lid);
        assert_eq!(ah.port_num, 1);
        assert_eq!(ah.grh.dgid, peer.gid);
        assert_eq!(ah.grh.sgid_index, 1);
        assert_eq!(ah.grh.hop_limit, 1);
    }

    a.destroy();
    b.destroy();
    bed.assert_clean();
}

#[test]
fn rtr_failure_midway_keeps_partial_state() {
    let bed = TestBed::new();
    let (a, b) = init_pair(&bed, 4);
    let b_ids = b.local_identifiers();
    bed.fabric.inject(Fault::ModifyQp {
        qp_num: a.qps()[2].qp_num(),
        target: QpState::Rtr,
    });

    let report = to_rtr_all(a.qps(), a.path_params(), &b_ids);
    assert!(!report.is_complete());
    assert_eq!(report.applied(), 2);
    assert!(matches!(report.outcomes()[3], QpOutcome::Skipped));

    let (index, err) = report.failure().expect("batch should have failed");
    assert_eq!(index, 2);
    assert_eq!(err.kind(), ErrorKind::StateTransition);
    assert_eq!(err.qp_index(), Some(2));
    match err {
        Error::RtrTransition { index, peer, .. } => {
            assert_eq!(*index, 2);
            assert_eq!(*peer, b_ids[2]);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(
        states(&a),
        [QpState::Rtr, QpState::Rtr, QpState::Init, QpState::Init]
    );
}

#[test]
fn init_failure_on_first_qp_touches_nothing() {
    let bed = TestBed::new();
    let res = bed.resources(SERVER_DEVICE, 3);
    bed.fabric.inject(Fault::ModifyQp {
        qp_num: res.qps()[0].qp_num(),
        target: QpState::Init,
    });
    let err = to_init_all(res.qps(), 1).into_result().unwrap_err();
    assert!(
        matches!(err, Error::Transition { index: 0, target: QpState::Init, .. }),
        "{err}"
    );
    assert!(states(&res).iter().all(|s| *s == QpState::Reset));
}

#[test]
fn zero_peer_gid_still_routes_globally() {
    let bed = TestBed::new();
    let (a, b) = init_pair(&bed, 2);
    let peers: Vec<_> = b
        .local_identifiers()
        .into_iter()
        .map(|id| ConnectionIdentifier { gid: Gid::ZERO, ..id })
        .collect();

    to_rtr_all(a.qps(), a.path_params(), &peers).into_result().unwrap();
    for qp in a.qps() {
        let ah = qp.query().unwrap().ah.unwrap();
        assert!(ah.is_global);
        assert!(ah.grh.dgid.is_zero());
    }
}

#[test]
fn rts_requires_rtr() {
    let bed = TestBed::new();
    let (a, _b) = init_pair(&bed, 2);
    let err = to_rts_all(a.qps()).into_result().unwrap_err();
    assert!(
        matches!(err, Error::Transition { index: 0, target: QpState::Rts, .. }),
        "{err}"
    );
    assert!(states(&a).iter().all(|s| *s == QpState::Init));
}

#[test]
fn missing_peer_identifier_is_invalid() {
    let bed = TestBed::new();
    let (a, b) = init_pair(&bed, 3);
    let peers = &b.local_identifiers()[..2];
    let report = to_rtr_all(a.qps(), a.path_params(), peers);
    let (index, err) = report.failure().unwrap();
    assert_eq!(index, 2);
    assert!(matches!(err, Error::InvalidArg(_)));
    assert_eq!(report.applied(), 2);
}

#[test]
fn sgid_index_outside_table_fails_rtr() {
    let bed = TestBed::new();
    let (a, b) = init_pair(&bed, 1);
    let mut path = *a.path_params();
    path.sgid_index = 5;
    let err = to_rtr_all(a.qps(), &path, &b.local_identifiers())
        .into_result()
        .unwrap_err();
    assert!(matches!(err, Error::RtrTransition { index: 0, .. }), "{err}");
    assert_eq!(a.qps()[0].state().unwrap(), QpState::Init);
}

#[test]
fn rtr_path_mtu_follows_active_port_mtu() {
    let bed = TestBed::new();
    bed.fabric.set_active_mtu(SERVER_DEVICE, Mtu::Mtu512).unwrap();
    bed.fabric.set_active_mtu(CLIENT_DEVICE, Mtu::Mtu4096).unwrap();
    let (a, b) = init_pair(&bed, 2);
    assert_eq!(a.path_params().port_attr.active_mtu, Mtu::Mtu512);

    to_rtr_all(a.qps(), a.path_params(), &b.local_identifiers())
        .into_result()
        .unwrap();
    to_rtr_all(b.qps(), b.path_params(), &a.local_identifiers())
        .into_result()
        .unwrap();
    for qp in a.qps() {
        assert_eq!(qp.query().unwrap().path_mtu, Some(Mtu::Mtu512));
    }
    for qp in b.qps() {
        assert_eq!(qp.query().unwrap().path_mtu, Some(Mtu::Mtu4096));
    }
}

#[test]
fn error_state_flushes_posted_receives() {
    let bed = TestBed::new();
    let res = bed.resources(SERVER_DEVICE, 3);
    to_init_all(res.qps(), res.path_params().port_num)
        .into_result()
        .unwrap();
    post_receive_all(res.qps(), &res.arena()).unwrap();
    assert_eq!(bed.fabric.pending_completions(), 0);

    res.qps()[1].to_err().unwrap();
    assert_eq!(res.qps()[1].state().unwrap(), QpState::Err);
    assert_eq!(res.qps()[0].state().unwrap(), QpState::Init);
    assert_eq!(bed.fabric.pending_completions(), 1);

    let err = CompletionPoller::new(res.cq()).poll(1).unwrap_err();
    assert!(
        matches!(err, Error::WorkCompletion { tag: 1, status: WcStatus::WrFlushErr, .. }),
        "{err}"
    );
    assert_eq!(err.kind(), ErrorKind::Completion);
    assert_eq!(bed.fabric.pending_completions(), 0);

    res.destroy();
    bed.assert_clean();
}
