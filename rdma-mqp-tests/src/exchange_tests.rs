//! Metadata exchange over a real TCP control channel.

use std::io::{ErrorKind as IoErrorKind, Write};

use rdma_mqp::config::Config;
use rdma_mqp::device::Gid;
use rdma_mqp::exchange::{
    ConnectionIdentifier, CountPolicy, RECORD_LEN, encode, exchange, read_identifiers,
};
use rdma_mqp::qp::QpState;
use rdma_mqp::session::Connection;
use rdma_mqp::{Error, ErrorKind};
use rdma_mqp_tests::{CLIENT_DEVICE, SERVER_DEVICE, TestBed, config, tcp_pair};

fn ids(base: u32, n: usize, last_octet: u8) -> Vec<ConnectionIdentifier> {
    (0..n)
        .map(|i| ConnectionIdentifier {
            qp_num: base + i as u32,
            lid: 0,
            gid: Gid::from_ipv4([10, 0, 0, last_octet]),
        })
        .collect()
}

#[test]
fn both_sides_receive_the_others_identifiers() {
    let (mut server, mut client) = tcp_pair();
    let server_ids = ids(0x100, 4, 1);
    let client_ids = ids(0x200, 4, 2);

    let (got_by_server, got_by_client) = std::thread::scope(|s| {
        let local = server_ids.clone();
        let h = s.spawn(move || exchange(&mut server, &local).unwrap());
        let got = exchange(&mut client, &client_ids).unwrap();
        (h.join().unwrap(), got)
    });
    assert_eq!(got_by_server, client_ids);
    assert_eq!(got_by_client, server_ids);
}

#[test]
fn strict_count_mismatch_fails_both_peers() {
    let bed = TestBed::new();
    let (server, client) = bed.run_pair(
        |provider, stream| {
            Connection::establish(provider, &config(SERVER_DEVICE, 4), stream).map(|_| ())
        },
        |provider, stream| {
            Connection::establish(provider, &config(CLIENT_DEVICE, 2), stream).map(|_| ())
        },
    );
    for result in [server, client] {
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Handshake(_)), "{err}");
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
    bed.assert_clean();
}

#[test]
fn lenient_policy_pairs_the_common_prefix() {
    fn lenient(device: &str, n: usize) -> Config {
        Config {
            count_policy: CountPolicy::Lenient,
            ..config(device, n)
        }
    }
    let bed = TestBed::new();
    let msg = b"prefix only";

    let (server, client) = bed.run_pair(
        |provider, stream| {
            let mut conn = Connection::establish(provider, &lenient(SERVER_DEVICE, 4), stream)?;
            assert_eq!(conn.qps().len(), 2);
            assert_eq!(conn.peers().len(), 2);
            let all = conn.resources().qps();
            assert_eq!(all.len(), 4);
            assert_eq!(all[1].state()?, QpState::Rts);
            assert_eq!(all[2].state()?, QpState::Init);
            assert_eq!(all[3].state()?, QpState::Init);
            let received = conn.serve_round(b"ack")?;
            conn.close();
            Ok::<_, Error>(received)
        },
        |provider, stream| {
            let mut conn = Connection::establish(provider, &lenient(CLIENT_DEVICE, 2), stream)?;
            assert_eq!(conn.peers().len(), 4);
            let replies = conn.client_round(msg)?;
            conn.close();
            Ok::<_, Error>(replies)
        },
    );
    assert_eq!(server.unwrap(), vec![msg.to_vec(); 2]);
    assert_eq!(client.unwrap(), vec![b"ack".to_vec(); 2]);
    bed.assert_clean();
}

#[test]
fn oversized_peer_count_is_rejected() {
    let (mut server, mut client) = tcp_pair();
    client.write_all(&17u32.to_le_bytes()).unwrap();
    let err = read_identifiers(&mut server).unwrap_err();
    assert!(matches!(err, Error::Handshake(_)), "{err}");
}

#[test]
fn peer_closing_mid_record_is_a_transport_error() {
    let (mut server, mut client) = tcp_pair();
    let full = encode(&ids(0x300, 2, 3));
    let cut = full.len() - RECORD_LEN + 5;
    client.write_all(&full[..cut]).unwrap();
    drop(client);

    let err = read_identifiers(&mut server).unwrap_err();
    match &err {
        Error::Transport { source, .. } => assert_eq!(source.kind(), IoErrorKind::UnexpectedEof),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[test]
fn bring_up_against_a_silent_peer_fails_cleanly() {
    let bed = TestBed::new();
    let (server, client) = tcp_pair();
    drop(client);
    let err = Connection::establish(bed.provider(), &config(SERVER_DEVICE, 2), server)
        .err()
        .expect("bring-up must fail");
    assert!(matches!(err, Error::Transport { .. }), "{err}");
    bed.assert_clean();
}
