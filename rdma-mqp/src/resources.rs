//! Resource manager: one context, PD, registered buffer and CQ shared by N QPs.

use std::sync::Arc;

use crate::cq::CompletionQueue;
use crate::device::{Context, Gid, PortAttr, PortState};
use crate::exchange::ConnectionIdentifier;
use crate::mr::{AccessFlags, Buffer, MemoryRegion};
use crate::pd::ProtectionDomain;
use crate::provider::SharedProvider;
use crate::qp::{QpInitAttr, QueuePair};
use crate::transfer::BufferArena;
use crate::{Error, Result};

/// Upper bound on the number of QPs per peer.
pub const MAX_QP: usize = 16;

/// Per-QP outstanding work-request limit (send and receive each).
pub const MAX_WR: u32 = 16;

/// Scatter-gather entries per work request.
pub const MAX_SGE: u32 = 1;

/// CQ depth, provisioned for every QP having a full send and receive queue.
pub const CQ_CAPACITY: u32 = MAX_QP as u32 * MAX_WR * 2;

/// Size of the registered buffer unless configured otherwise.
pub const DEFAULT_BUF_SIZE: usize = 4096;

/// Access rights for the buffer and for every QP.
pub const REMOTE_ACCESS: AccessFlags = AccessFlags::LOCAL_WRITE
    .union(AccessFlags::REMOTE_READ)
    .union(AccessFlags::REMOTE_WRITE);

/// Parameters for [`TransportResources::create`].
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    /// Device name; `None` selects the provider's first device.
    pub device: Option<String>,
    /// Physical port used for every QP.
    pub ib_port: u8,
    /// GID table index used as the local address and the source GID.
    pub gid_index: u32,
    /// Number of QPs to create.
    pub num_qp: usize,
    /// Registered buffer size in bytes.
    pub buf_size: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            device: None,
            ib_port: 1,
            gid_index: 1,
            num_qp: 1,
            buf_size: DEFAULT_BUF_SIZE,
        }
    }
}

/// Port-derived parameters every INIT→RTR transition needs.
#[derive(Debug, Clone, Copy)]
pub struct PathParams {
    pub port_num: u8,
    pub port_attr: PortAttr,
    pub sgid_index: u32,
}

/// Everything one peer owns for a multi-QP connection.
///
/// Fields are declared in release order: dropping the struct (or calling
/// [`destroy`](Self::destroy)) tears down the QPs, then the CQ, the MR, the
/// buffer, the PD and finally the context. Each wrapper also holds an `Arc`
/// to its parent, so a half-built set of resources unwinds in the same order.
pub struct TransportResources {
    qps: Vec<QueuePair>,
    cq: Arc<CompletionQueue>,
    mr: MemoryRegion,
    buffer: Arc<Buffer>,
    pd: Arc<ProtectionDomain>,
    ctx: Arc<Context>,
    path: PathParams,
    local_gid: Gid,
}

impl TransportResources {
    /// Acquire every resource for `config.num_qp` queue pairs.
    ///
    /// Stops at the first failing step. Whatever was acquired up to that
    /// point is released before the error is returned.
    pub fn create(provider: SharedProvider, config: &ResourceConfig) -> Result<Self> {
        let n = config.num_qp;
        if n == 0 || n > MAX_QP {
            return Err(Error::InvalidArg(format!(
                "QP count {n} out of range 1..={MAX_QP}"
            )));
        }
        if config.buf_size < n * 2 {
            return Err(Error::InvalidArg(format!(
                "buffer of {} bytes cannot be split across {n} QPs",
                config.buf_size
            )));
        }

        let ctx = Context::open(provider, config.device.as_deref())?;

        let port_attr = ctx.query_port(config.ib_port)?;
        if port_attr.state != PortState::Active {
            tracing::warn!(
                "port {} on {} is {:?}, not ACTIVE",
                config.ib_port,
                ctx.name(),
                port_attr.state
            );
        }
        tracing::debug!(
            "port {}: lid={:#06x} active_mtu={}",
            config.ib_port,
            port_attr.lid,
            port_attr.active_mtu
        );

        let local_gid = ctx.query_gid(config.ib_port, config.gid_index)?;
        tracing::debug!("GID[{}] = {local_gid}", config.gid_index);

        let pd = ctx.alloc_pd()?;

        let buffer = Buffer::zeroed(config.buf_size);
        let mr = pd.reg_mr(Arc::clone(&buffer), REMOTE_ACCESS)?;
        tracing::debug!(
            "registered {} bytes at {:#x}: lkey={:#x} rkey={:#x}",
            mr.length(),
            mr.addr(),
            mr.lkey(),
            mr.rkey()
        );

        let cq = ctx.create_cq(CQ_CAPACITY)?;

        let init_attr = QpInitAttr {
            max_send_wr: MAX_WR,
            max_recv_wr: MAX_WR,
            max_send_sge: MAX_SGE,
            max_recv_sge: MAX_SGE,
            max_inline_data: 0,
            sq_sig_all: true,
        };
        let mut qps = Vec::with_capacity(n);
        for i in 0..n {
            let qp = pd.create_qp(&cq, &cq, &init_attr, i)?;
            tracing::debug!("QP[{i}]: qp_num={:#08x}", qp.qp_num());
            qps.push(qp);
        }

        tracing::info!("created {n} QPs on {} sharing one CQ", ctx.name());
        Ok(Self {
            qps,
            cq,
            mr,
            buffer,
            pd,
            ctx,
            path: PathParams {
                port_num: config.ib_port,
                port_attr,
                sgid_index: config.gid_index,
            },
            local_gid,
        })
    }

    /// Release every resource in reverse acquisition order.
    pub fn destroy(self) {
        let Self {
            qps,
            cq,
            mr,
            buffer,
            pd,
            ctx,
            ..
        } = self;
        let name = ctx.name().to_string();
        let n = qps.len();
        drop(qps);
        tracing::debug!("destroyed {n} QPs");
        drop(cq);
        tracing::debug!("destroyed CQ");
        drop(mr);
        tracing::debug!("deregistered MR");
        drop(buffer);
        drop(pd);
        tracing::debug!("deallocated PD");
        drop(ctx);
        tracing::info!("released resources on {name}");
    }

    /// The queue pairs, in index order.
    pub fn qps(&self) -> &[QueuePair] {
        &self.qps
    }

    /// Number of queue pairs.
    pub fn num_qp(&self) -> usize {
        self.qps.len()
    }

    /// The CQ every QP reports to.
    pub fn cq(&self) -> &Arc<CompletionQueue> {
        &self.cq
    }

    /// The registered buffer's memory region.
    pub fn mr(&self) -> &MemoryRegion {
        &self.mr
    }

    /// The registered buffer.
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    /// The protection domain.
    pub fn pd(&self) -> &Arc<ProtectionDomain> {
        &self.pd
    }

    /// The device context.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Port, MTU and source-GID index for RTR.
    pub fn path_params(&self) -> &PathParams {
        &self.path
    }

    /// The local GID at the configured index.
    pub fn local_gid(&self) -> Gid {
        self.local_gid
    }

    /// Per-QP slices of the registered buffer.
    pub fn arena(&self) -> BufferArena<'_> {
        BufferArena::new(&self.mr, self.qps.len())
    }

    /// What the peer needs to address each local QP, in index order.
    pub fn local_identifiers(&self) -> Vec<ConnectionIdentifier> {
        self.qps
            .iter()
            .map(|qp| ConnectionIdentifier {
                qp_num: qp.qp_num(),
                lid: self.path.port_attr.lid,
                gid: self.local_gid,
            })
            .collect()
    }
}

impl std::fmt::Debug for TransportResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResources")
            .field("device", &self.ctx.name())
            .field("qps", &self.qps)
            .field("buffer", &self.buffer)
            .finish()
    }
}
