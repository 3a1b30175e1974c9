//! Shared fixtures for the rdma-mqp integration tests.
//!
//! Every test runs both peers in one process: a [`TestBed`] owns a software
//! fabric with two devices (`soft0` for the server side, `soft1` for the
//! client side) and hands out connected TCP streams on 127.0.0.1.

use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use rdma_mqp::config::Config;
use rdma_mqp::provider::SharedProvider;
use rdma_mqp::resources::{ResourceConfig, TransportResources};
use rdma_mqp::soft::SoftFabric;

pub const SERVER_DEVICE: &str = "soft0";
pub const CLIENT_DEVICE: &str = "soft1";

/// Install a test-friendly subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A connected pair of TCP streams on the loopback interface.
pub fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    let client = TcpStream::connect(addr).expect("connect");
    let (server, _) = listener.accept().expect("accept");
    (server, client)
}

/// Peer configuration with everything but the device and QP count defaulted.
pub fn config(device: &str, num_qp: usize) -> Config {
    Config {
        device: Some(device.to_string()),
        num_qp,
        ..Default::default()
    }
}

pub struct TestBed {
    pub fabric: Arc<SoftFabric>,
}

impl Default for TestBed {
    fn default() -> Self {
        Self::new()
    }
}

impl TestBed {
    pub fn new() -> Self {
        init_tracing();
        Self {
            fabric: SoftFabric::with_devices(&[SERVER_DEVICE, CLIENT_DEVICE]).shared(),
        }
    }

    pub fn provider(&self) -> SharedProvider {
        Arc::clone(&self.fabric) as SharedProvider
    }

    /// Create resources for `num_qp` QPs on `device`.
    pub fn resources(&self, device: &str, num_qp: usize) -> TransportResources {
        let config = ResourceConfig {
            device: Some(device.to_string()),
            num_qp,
            ..Default::default()
        };
        TransportResources::create(self.provider(), &config).expect("create resources")
    }

    /// Run `server` on a second thread and `client` on this one, each with
    /// its end of a fresh control connection.
    pub fn run_pair<S, C, RS, RC>(&self, server: S, client: C) -> (RS, RC)
    where
        S: FnOnce(SharedProvider, TcpStream) -> RS + Send,
        RS: Send,
        C: FnOnce(SharedProvider, TcpStream) -> RC,
    {
        let (server_stream, client_stream) = tcp_pair();
        let server_provider = self.provider();
        let client_provider = self.provider();
        thread::scope(|s| {
            let handle = s.spawn(move || server(server_provider, server_stream));
            let rc = client(client_provider, client_stream);
            (handle.join().expect("server thread panicked"), rc)
        })
    }

    /// Nothing left allocated and nothing released twice.
    pub fn assert_clean(&self) {
        assert_eq!(self.fabric.live_resources(), 0, "leaked provider objects");
        assert_eq!(self.fabric.failed_releases(), 0, "failed releases");
    }
}
