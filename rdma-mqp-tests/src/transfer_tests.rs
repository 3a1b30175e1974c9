//! Full bring-up plus data movement between two peers.

use std::sync::mpsc;

use rdma_mqp::session::Connection;
use rdma_mqp::wc::{WcOpcode, WcStatus};
use rdma_mqp::wr::{SendFlags, SendWr, WrOpcode};
use rdma_mqp::{Error, Result};
use rdma_mqp_tests::{CLIENT_DEVICE, SERVER_DEVICE, TestBed, config};

const MESSAGE: &str = "héllo wörld, ✓ per-QP 多重 RC";
const REPLY: &str = "réponse du serveur ✓";

fn ping_pong(num_qp: usize) {
    let bed = TestBed::new();
    let (server, client) = bed.run_pair(
        |provider, stream| -> Result<Vec<Vec<u8>>> {
            let mut conn = Connection::establish(provider, &config(SERVER_DEVICE, num_qp), stream)?;
            let received = conn.serve_round(REPLY.as_bytes())?;
            conn.close();
            Ok(received)
        },
        |provider, stream| -> Result<Vec<Vec<u8>>> {
            let mut conn = Connection::establish(provider, &config(CLIENT_DEVICE, num_qp), stream)?;
            let replies = conn.client_round(MESSAGE.as_bytes())?;
            conn.close();
            Ok(replies)
        },
    );

    let received = server.unwrap();
    let replies = client.unwrap();
    assert_eq!(received.len(), num_qp);
    assert_eq!(replies.len(), num_qp);
    for (i, (msg, reply)) in received.iter().zip(&replies).enumerate() {
        assert_eq!(std::str::from_utf8(msg).unwrap(), MESSAGE, "QP[{i}]");
        assert_eq!(std::str::from_utf8(reply).unwrap(), REPLY, "QP[{i}]");
    }
    bed.assert_clean();
}

#[test]
fn ping_pong_single_qp() {
    ping_pong(1);
}

#[test]
fn ping_pong_four_qps() {
    ping_pong(4);
}

#[test]
fn ping_pong_max_qps() {
    ping_pong(rdma_mqp::resources::MAX_QP);
}

#[test]
fn consecutive_rounds_reuse_the_connection() {
    let bed = TestBed::new();
    let rounds = 3;
    let (server, client) = bed.run_pair(
        |provider, stream| -> Result<Vec<Vec<Vec<u8>>>> {
            let mut conn = Connection::establish(provider, &config(SERVER_DEVICE, 2), stream)?;
            let all = (0..rounds)
                .map(|r| conn.serve_round(format!("ack {r}").as_bytes()))
                .collect::<Result<Vec<_>>>()?;
            conn.close();
            Ok(all)
        },
        |provider, stream| -> Result<Vec<Vec<Vec<u8>>>> {
            let mut conn = Connection::establish(provider, &config(CLIENT_DEVICE, 2), stream)?;
            let all = (0..rounds)
                .map(|r| conn.client_round(format!("round {r}").as_bytes()))
                .collect::<Result<Vec<_>>>()?;
            conn.close();
            Ok(all)
        },
    );
    let server = server.unwrap();
    let client = client.unwrap();
    for r in 0..rounds {
        assert_eq!(server[r], vec![format!("round {r}").into_bytes(); 2]);
        assert_eq!(client[r], vec![format!("ack {r}").into_bytes(); 2]);
    }
    bed.assert_clean();
}

#[test]
fn rdma_write_lands_in_peer_receive_slot() {
    let bed = TestBed::new();
    let payload = b"written without a receive";
    let (to_client, from_server) = mpsc::channel();
    let (to_server, from_client) = mpsc::channel();

    let (written, status) = bed.run_pair(
        move |provider, stream| {
            let conn = Connection::establish(provider, &config(SERVER_DEVICE, 2), stream).unwrap();
            let target = conn.arena().recv_sge(1).unwrap();
            to_client.send((target.addr, conn.resources().mr().rkey())).unwrap();
            from_client.recv().unwrap();
            let written = conn.arena().read(1, payload.len()).unwrap();
            conn.close();
            written
        },
        move |provider, stream| {
            let conn = Connection::establish(provider, &config(CLIENT_DEVICE, 2), stream).unwrap();
            let (addr, rkey) = from_server.recv().unwrap();
            conn.arena().write(1, payload).unwrap();
            let wr = SendWr::new(1, WrOpcode::RdmaWrite)
                .flags(SendFlags::SIGNALED)
                .sg(conn.arena().send_sge(1, payload.len()).unwrap())
                .rdma(addr, rkey);
            conn.qps()[1].post_send(&wr).unwrap();
            let wcs = conn.poll(1).unwrap();
            to_server.send(()).unwrap();
            conn.close();
            (wcs[0].tag(), wcs[0].opcode())
        },
    );
    assert_eq!(written, payload);
    assert_eq!(status, (1, WcOpcode::RdmaWrite));
    bed.assert_clean();
}

#[test]
fn rdma_read_with_wrong_rkey_is_rejected() {
    let bed = TestBed::new();
    let (to_client, from_server) = mpsc::channel();
    let (to_server, from_client) = mpsc::channel();

    let ((), err) = bed.run_pair(
        move |provider, stream| {
            let conn = Connection::establish(provider, &config(SERVER_DEVICE, 1), stream).unwrap();
            let sge = conn.arena().send_sge(0, 8).unwrap();
            to_client.send((sge.addr, conn.resources().mr().rkey())).unwrap();
            from_client.recv().unwrap();
            conn.close();
        },
        move |provider, stream| {
            let conn = Connection::establish(provider, &config(CLIENT_DEVICE, 1), stream).unwrap();
            let (addr, rkey) = from_server.recv().unwrap();
            let wr = SendWr::new(0, WrOpcode::RdmaRead)
                .flags(SendFlags::SIGNALED)
                .sg(conn.arena().recv_sge(0).unwrap())
                .rdma(addr, rkey ^ 0x5a5a);
            conn.qps()[0].post_send(&wr).unwrap();
            let err = conn.poll(1).unwrap_err();
            to_server.send(()).unwrap();
            conn.close();
            err
        },
    );
    assert!(
        matches!(err, Error::WorkCompletion { tag: 0, status: WcStatus::RemAccessErr, .. }),
        "{err}"
    );
    bed.assert_clean();
}
