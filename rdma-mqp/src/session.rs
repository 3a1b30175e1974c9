//! One peer's side of a multi-QP connection.
//!
//! [`Connection::establish`] runs the whole bring-up on an already-connected
//! control stream:
//!
//! 1. create resources (N QPs on one CQ),
//! 2. RESET → INIT for every QP,
//! 3. swap [`ConnectionIdentifier`]s with the peer,
//! 4. INIT → RTR with the peer's identifiers, then RTR → RTS.
//!
//! After that, [`Connection::serve_round`] and [`Connection::client_round`]
//! run one request/reply exchange across every QP.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::config::Config;
use crate::connect::{log_states, to_init_all, to_rtr_all, to_rts_all};
use crate::exchange::{ConnectionIdentifier, exchange, reconcile};
use crate::poller::CompletionPoller;
use crate::provider::SharedProvider;
use crate::qp::QueuePair;
use crate::resources::TransportResources;
use crate::transfer::{
    BufferArena, PeerReady, ReadyFence, ReceivesPosted, post_receive_all, post_send_all,
};
use crate::wc::{WcOpcode, WorkCompletion};
use crate::{Error, Result};

/// An established set of RC connections plus the control stream they were
/// negotiated on.
pub struct Connection<S: Read + Write = TcpStream> {
    res: TransportResources,
    stream: S,
    peers: Vec<ConnectionIdentifier>,
    paired: usize,
    poll_timeout: Duration,
}

impl Connection<TcpStream> {
    /// Accept one control connection on `listener` and bring up the QPs.
    pub fn accept(
        provider: SharedProvider,
        config: &Config,
        listener: &TcpListener,
    ) -> Result<Self> {
        let (stream, addr) = listener
            .accept()
            .map_err(Error::transport("accept control connection"))?;
        tracing::info!("control connection from {addr}");
        Self::establish(provider, config, stream)
    }

    /// Connect the control channel to `addr` and bring up the QPs.
    pub fn connect<A: ToSocketAddrs>(
        provider: SharedProvider,
        config: &Config,
        addr: A,
    ) -> Result<Self> {
        let stream =
            TcpStream::connect(addr).map_err(Error::transport("connect control channel"))?;
        stream
            .set_nodelay(true)
            .map_err(Error::transport("configure control channel"))?;
        Self::establish(provider, config, stream)
    }
}

impl<S: Read + Write> Connection<S> {
    /// Bring up `config.num_qp` RC connections over `stream`.
    pub fn establish(provider: SharedProvider, config: &Config, mut stream: S) -> Result<Self> {
        config.validate()?;
        let res = TransportResources::create(provider, &config.resources())?;
        let path = *res.path_params();

        to_init_all(res.qps(), path.port_num).into_result()?;
        log_states(res.qps(), "INIT");

        let local = res.local_identifiers();
        for (i, id) in local.iter().enumerate() {
            tracing::debug!("local QP[{i}]: {id}");
        }
        let peers = exchange(&mut stream, &local)?;
        for (i, id) in peers.iter().enumerate() {
            tracing::debug!("peer QP[{i}]: {id}");
        }
        let paired = reconcile(local.len(), peers.len(), config.count_policy)?;
        let active = &res.qps()[..paired];

        to_rtr_all(active, &path, &peers).into_result()?;
        log_states(active, "RTR");
        to_rts_all(active).into_result()?;
        log_states(active, "RTS");

        tracing::info!("{paired} RC connections established");
        Ok(Self {
            res,
            stream,
            peers,
            paired,
            poll_timeout: config.poll_timeout,
        })
    }

    /// All resources, including QPs left out of the pairing.
    pub fn resources(&self) -> &TransportResources {
        &self.res
    }

    /// The QPs that are connected to a peer QP (all in RTS).
    pub fn qps(&self) -> &[QueuePair] {
        &self.res.qps()[..self.paired]
    }

    /// Identifiers the peer sent, in its index order.
    pub fn peers(&self) -> &[ConnectionIdentifier] {
        &self.peers
    }

    /// Per-QP buffer slots.
    pub fn arena(&self) -> BufferArena<'_> {
        self.res.arena()
    }

    /// The control stream.
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Post one receive on every connected QP.
    pub fn post_receives(&self) -> Result<ReceivesPosted> {
        post_receive_all(self.qps(), &self.arena())
    }

    /// Tell the peer our receives are posted.
    pub fn signal_ready(&mut self, posted: ReceivesPosted) -> Result<()> {
        ReadyFence::signal(&mut self.stream, posted)
    }

    /// Wait until the peer's receives are posted.
    pub fn wait_ready(&mut self) -> Result<PeerReady> {
        ReadyFence::wait(&mut self.stream)
    }

    /// SEND `len` bytes from every connected QP's send slot.
    pub fn send_all(&self, len: usize, ready: &PeerReady) -> Result<()> {
        post_send_all(self.qps(), &self.arena(), len, ready)
    }

    /// A poller over the shared CQ honouring the configured timeout.
    pub fn poller(&self) -> CompletionPoller<'_> {
        CompletionPoller::new(self.res.cq())
            .timeout(self.poll_timeout)
            .tags(self.paired)
    }

    /// Wait for `expected` completions on the shared CQ.
    pub fn poll(&self, expected: usize) -> Result<Vec<WorkCompletion>> {
        self.poller().poll(expected)
    }

    /// Receiving side of one round: accept a message on every QP, then
    /// answer each with `reply`. Returns the received messages by QP index.
    pub fn serve_round(&mut self, reply: &[u8]) -> Result<Vec<Vec<u8>>> {
        let n = self.paired;
        let posted = self.post_receives()?;
        self.signal_ready(posted)?;
        let ready = self.wait_ready()?;

        let wcs = self.poll(n)?;
        let received = self.collect_recvs(&wcs)?;
        tracing::info!("received {n} messages");

        self.arena().write_all(reply)?;
        self.send_all(reply.len(), &ready)?;
        let sends = self.poll(n)?;
        check_each_tag_once(&sends, n, WcOpcode::Send)?;
        tracing::info!("replied on {n} QPs");
        Ok(received)
    }

    /// Sending side of one round: send `msg` on every QP and collect each
    /// QP's reply. Returns the replies by QP index.
    pub fn client_round(&mut self, msg: &[u8]) -> Result<Vec<Vec<u8>>> {
        let n = self.paired;
        self.arena().write_all(msg)?;
        let posted = self.post_receives()?;
        self.signal_ready(posted)?;
        let ready = self.wait_ready()?;

        self.send_all(msg.len(), &ready)?;
        // Sends and replies share the CQ and may interleave.
        let wcs = self.poll(2 * n)?;
        let (recvs, sends): (Vec<_>, Vec<_>) =
            wcs.into_iter().partition(|wc| wc.opcode().is_recv());
        check_each_tag_once(&sends, n, WcOpcode::Send)?;
        let replies = self.collect_recvs(&recvs)?;
        tracing::info!("sent {n} messages and received {n} replies");
        Ok(replies)
    }

    fn collect_recvs(&self, wcs: &[WorkCompletion]) -> Result<Vec<Vec<u8>>> {
        check_each_tag_once(wcs, self.paired, WcOpcode::Recv)?;
        let arena = self.arena();
        let mut out = vec![Vec::new(); self.paired];
        for wc in wcs {
            out[wc.tag()] = arena.read(wc.tag(), wc.byte_len() as usize)?;
        }
        Ok(out)
    }

    /// Release every resource and drop the control stream.
    pub fn close(self) {
        let Self { res, stream, .. } = self;
        res.destroy();
        drop(stream);
    }
}

/// Every tag in `0..n` exactly once, all with `opcode`.
fn check_each_tag_once(wcs: &[WorkCompletion], n: usize, opcode: WcOpcode) -> Result<()> {
    let mut seen = vec![false; n];
    for wc in wcs {
        if wc.opcode() != opcode {
            return Err(Error::InvalidArg(format!(
                "expected {opcode:?} completion, got {wc:?}"
            )));
        }
        match seen.get_mut(wc.tag()) {
            Some(slot) if !*slot => *slot = true,
            _ => {
                return Err(Error::InvalidArg(format!(
                    "unexpected completion tag {}",
                    wc.wr_id()
                )));
            }
        }
    }
    if wcs.len() != n {
        return Err(Error::InvalidArg(format!(
            "expected {n} {opcode:?} completions, got {}",
            wcs.len()
        )));
    }
    Ok(())
}
