//! Transfer round: per-QP buffer slots and the receive-before-send fence.
//!
//! # Buffer Architecture
//!
//! The registered buffer is split into one slot per QP. Each slot has a send
//! half and a receive half:
//!
//! ```text
//! | QP0 send | QP0 recv | QP1 send | QP1 recv | ... |
//! ```
//!
//! A work request posted on QP `i` only ever points into slot `i`, so no two
//! QPs touch the same bytes and an incoming message never lands on data that
//! is still waiting to go out.
//!
//! # Fence
//!
//! A SEND that arrives before the peer posted a receive is RNR-NAKed. The
//! receiving side therefore posts all receives, then writes one sync byte on
//! the control channel; the sending side blocks on that byte before posting
//! any send. [`ReceivesPosted`] and [`PeerReady`] make the order a
//! compile-time requirement: the only way to get them is to do the step.

use std::io::{Read, Write};

use crate::mr::MemoryRegion;
use crate::qp::QueuePair;
use crate::wr::{RecvWr, SendFlags, SendWr, Sge, WrOpcode};
use crate::{Error, Result};

/// The byte one peer writes once its receives are posted.
pub const SYNC_BYTE: u8 = b'R';

/// Per-QP view of the registered buffer.
#[derive(Clone, Copy)]
pub struct BufferArena<'a> {
    mr: &'a MemoryRegion,
    slots: usize,
    half: usize,
}

impl<'a> BufferArena<'a> {
    /// Split `mr` into `slots` equal slots; trailing bytes are unused.
    pub fn new(mr: &'a MemoryRegion, slots: usize) -> Self {
        let half = mr.length().checked_div(slots * 2).unwrap_or(0);
        Self { mr, slots, half }
    }

    /// Number of slots.
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Bytes available for one message in either direction.
    pub fn capacity(&self) -> usize {
        self.half
    }

    fn check(&self, tag: usize) -> Result<()> {
        if tag >= self.slots {
            return Err(Error::InvalidArg(format!(
                "tag {tag} out of range for {} slots",
                self.slots
            )));
        }
        Ok(())
    }

    fn send_offset(&self, tag: usize) -> usize {
        tag * self.half * 2
    }

    fn recv_offset(&self, tag: usize) -> usize {
        self.send_offset(tag) + self.half
    }

    /// Copy `msg` into the send half of slot `tag`.
    pub fn write(&self, tag: usize, msg: &[u8]) -> Result<()> {
        self.check(tag)?;
        if msg.len() > self.half {
            return Err(Error::InvalidArg(format!(
                "message of {} bytes exceeds the {}-byte slot",
                msg.len(),
                self.half
            )));
        }
        let start = self.send_offset(tag);
        let mut data = self.mr.buffer().lock();
        data[start..start + msg.len()].copy_from_slice(msg);
        data[start + msg.len()..start + self.half].fill(0);
        Ok(())
    }

    /// Copy `msg` into the send half of every slot.
    pub fn write_all(&self, msg: &[u8]) -> Result<()> {
        (0..self.slots).try_for_each(|tag| self.write(tag, msg))
    }

    /// The first `len` bytes of the receive half of slot `tag`.
    pub fn read(&self, tag: usize, len: usize) -> Result<Vec<u8>> {
        self.check(tag)?;
        let len = len.min(self.half);
        let start = self.recv_offset(tag);
        Ok(self.mr.buffer().lock()[start..start + len].to_vec())
    }

    /// Scatter-gather entry covering `len` bytes of slot `tag`'s send half.
    pub fn send_sge(&self, tag: usize, len: usize) -> Result<Sge> {
        self.check(tag)?;
        let len = u32::try_from(len.min(self.half))
            .map_err(|_| Error::InvalidArg(format!("length {len} too large")))?;
        Ok(Sge::new(
            self.mr.addr() + self.send_offset(tag) as u64,
            len,
            self.mr.lkey(),
        ))
    }

    /// Scatter-gather entry covering slot `tag`'s whole receive half.
    pub fn recv_sge(&self, tag: usize) -> Result<Sge> {
        self.check(tag)?;
        let len = u32::try_from(self.half)
            .map_err(|_| Error::InvalidArg(format!("slot of {} bytes too large", self.half)))?;
        Ok(Sge::new(
            self.mr.addr() + self.recv_offset(tag) as u64,
            len,
            self.mr.lkey(),
        ))
    }
}

/// Proof that every QP has a receive outstanding.
#[must_use = "hand this to ReadyFence::signal so the peer may start sending"]
#[derive(Debug)]
pub struct ReceivesPosted {
    count: usize,
}

impl ReceivesPosted {
    /// Receives posted, one per QP.
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Proof that the peer has posted its receives.
#[must_use = "sends may only be posted once the peer is ready"]
#[derive(Debug)]
pub struct PeerReady(());

/// The control-channel fence between receive posting and sending.
pub struct ReadyFence;

impl ReadyFence {
    /// Tell the peer our receives are posted.
    pub fn signal<W: Write>(stream: &mut W, posted: ReceivesPosted) -> Result<()> {
        stream
            .write_all(&[SYNC_BYTE])
            .and_then(|()| stream.flush())
            .map_err(Error::transport("write sync byte"))?;
        tracing::debug!("signalled peer: {} receives posted", posted.count);
        Ok(())
    }

    /// Block until the peer says its receives are posted.
    pub fn wait<R: Read>(stream: &mut R) -> Result<PeerReady> {
        let mut byte = [0u8; 1];
        stream
            .read_exact(&mut byte)
            .map_err(Error::transport("read sync byte"))?;
        if byte[0] != SYNC_BYTE {
            return Err(Error::Handshake(format!(
                "unexpected sync byte {:#04x}",
                byte[0]
            )));
        }
        tracing::debug!("peer is ready to receive");
        Ok(PeerReady(()))
    }
}

/// Post one receive per QP on its slot's receive half, tagged with its index.
pub fn post_receive_all(qps: &[QueuePair], arena: &BufferArena<'_>) -> Result<ReceivesPosted> {
    for qp in qps {
        let wr = RecvWr::new(qp.index() as u64).sg(arena.recv_sge(qp.index())?);
        qp.post_recv(&wr)?;
    }
    Ok(ReceivesPosted { count: qps.len() })
}

/// Post one signaled SEND of `len` bytes per QP from its slot's send half.
pub fn post_send_all(
    qps: &[QueuePair],
    arena: &BufferArena<'_>,
    len: usize,
    _ready: &PeerReady,
) -> Result<()> {
    for qp in qps {
        let wr = SendWr::new(qp.index() as u64, WrOpcode::Send)
            .flags(SendFlags::SIGNALED)
            .sg(arena.send_sge(qp.index(), len)?);
        qp.post_send(&wr)?;
    }
    tracing::debug!("posted {} sends of {len} bytes", qps.len());
    Ok(())
}
