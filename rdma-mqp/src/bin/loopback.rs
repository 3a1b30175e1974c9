//! Two peers on one software fabric: a server and a client bring up N RC
//! connections over a TCP control channel on 127.0.0.1, exchange one message
//! per QP and tear everything down.

use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context as _, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use rdma_mqp::config::{Config, DEFAULT_GID_INDEX, DEFAULT_NUM_QP, DEFAULT_TCP_PORT};
use rdma_mqp::exchange::CountPolicy;
use rdma_mqp::provider::SharedProvider;
use rdma_mqp::resources::DEFAULT_BUF_SIZE;
use rdma_mqp::session::Connection;
use rdma_mqp::soft::SoftFabric;

#[derive(Parser, Debug)]
#[command(name = "mqp-loopback")]
#[command(about = "Multi-QP RC bring-up and ping-pong over a software fabric")]
struct Cli {
    /// Number of queue pairs per peer
    #[arg(short = 'n', long, default_value_t = DEFAULT_NUM_QP)]
    num_qp: usize,

    /// Control-channel TCP port (0 picks a free one)
    #[arg(short = 'p', long, default_value_t = DEFAULT_TCP_PORT)]
    port: u16,

    /// GID table index
    #[arg(short = 'g', long, default_value_t = DEFAULT_GID_INDEX)]
    gid_index: u32,

    /// Registered buffer size in bytes
    #[arg(short = 'b', long, default_value_t = DEFAULT_BUF_SIZE)]
    buf_size: usize,

    /// Message the client sends on every QP
    #[arg(short = 'm', long, default_value = "hello from client")]
    message: String,

    /// Reply the server sends on every QP
    #[arg(long, default_value = "hello from server")]
    reply: String,

    /// Completion poll timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Pair min(local, peer) QPs instead of failing on a count mismatch
    #[arg(long)]
    lenient: bool,
}

impl Cli {
    fn config(&self, device: &str) -> Config {
        Config {
            device: Some(device.to_string()),
            gid_index: self.gid_index,
            num_qp: self.num_qp,
            buf_size: self.buf_size,
            tcp_port: self.port,
            poll_timeout: Duration::from_millis(self.timeout_ms),
            count_policy: if self.lenient {
                CountPolicy::Lenient
            } else {
                CountPolicy::Strict
            },
            ..Default::default()
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let server_config = cli.config("soft0");
    let client_config = cli.config("soft1");
    server_config.validate()?;

    let fabric = SoftFabric::with_devices(&["soft0", "soft1"]).shared();
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, server_config.tcp_port))
        .with_context(|| format!("bind control port {}", server_config.tcp_port))?;
    let addr = listener.local_addr()?;
    tracing::info!("control channel on {addr}");

    let server_provider: SharedProvider = Arc::clone(&fabric) as SharedProvider;
    let reply = cli.reply.clone().into_bytes();
    let server = thread::spawn(move || -> anyhow::Result<Vec<Vec<u8>>> {
        let mut conn = Connection::accept(server_provider, &server_config, &listener)
            .context("server bring-up")?;
        let received = conn.serve_round(&reply).context("server round")?;
        conn.close();
        Ok(received)
    });

    let client_provider: SharedProvider = Arc::clone(&fabric) as SharedProvider;
    let client = (|| -> anyhow::Result<Vec<Vec<u8>>> {
        let mut conn =
            Connection::connect(client_provider, &client_config, addr).context("client bring-up")?;
        let replies = conn
            .client_round(cli.message.as_bytes())
            .context("client round")?;
        conn.close();
        Ok(replies)
    })();

    // A client that never connected leaves the server blocked in accept.
    let replies = client?;
    let received = match server.join() {
        Ok(result) => result?,
        Err(_) => bail!("server thread panicked"),
    };

    for (i, msg) in received.iter().enumerate() {
        println!("server QP[{i}] received: {}", String::from_utf8_lossy(msg));
    }
    for (i, msg) in replies.iter().enumerate() {
        println!("client QP[{i}] received: {}", String::from_utf8_lossy(msg));
    }

    if fabric.live_resources() != 0 || fabric.failed_releases() != 0 {
        bail!(
            "fabric not clean: {} live objects, {} failed releases",
            fabric.live_resources(),
            fabric.failed_releases()
        );
    }
    println!("{} QPs exchanged messages in both directions", replies.len());
    Ok(())
}
