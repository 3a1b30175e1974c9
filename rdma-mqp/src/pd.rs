//! Protection Domain.

use std::sync::Arc;

use crate::Result;
use crate::cq::CompletionQueue;
use crate::device::Context;
use crate::error::{Error, ResourceStage};
use crate::mr::{AccessFlags, Buffer, MemoryRegion};
use crate::provider::PdHandle;
use crate::qp::{QpInitAttr, QueuePair};

/// A Protection Domain.
///
/// All memory registrations and QPs belong to a PD.
pub struct ProtectionDomain {
    pub(crate) handle: PdHandle,
    pub(crate) ctx: Arc<Context>,
}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.provider.dealloc_pd(self.handle) {
            tracing::error!("dealloc_pd failed: {e}");
        }
    }
}

impl ProtectionDomain {
    /// Allocate a new PD on the given context.
    pub fn new(ctx: Arc<Context>) -> Result<Arc<Self>> {
        let handle = ctx
            .provider
            .alloc_pd(ctx.handle)
            .map_err(Error::resource(ResourceStage::AllocPd))?;
        Ok(Arc::new(Self { handle, ctx }))
    }

    /// Register `buf` with the given access rights.
    ///
    /// The returned region keeps both the buffer and `self` alive.
    pub fn reg_mr(self: &Arc<Self>, buf: Arc<Buffer>, access: AccessFlags) -> Result<MemoryRegion> {
        let info = self
            .ctx
            .provider
            .register_memory(self.handle, &buf, access)
            .map_err(Error::resource(ResourceStage::RegisterMemory))?;
        Ok(MemoryRegion {
            handle: info.handle,
            lkey: info.lkey,
            rkey: info.rkey,
            access,
            pd: Arc::clone(self),
            buf,
        })
    }

    /// Create an RC Queue Pair on this PD.
    ///
    /// `index` is the QP's position in its resource list and becomes the tag
    /// of every work request posted through it.
    pub fn create_qp(
        self: &Arc<Self>,
        send_cq: &Arc<CompletionQueue>,
        recv_cq: &Arc<CompletionQueue>,
        init_attr: &QpInitAttr,
        index: usize,
    ) -> Result<QueuePair> {
        let info = self
            .ctx
            .provider
            .create_qp(self.handle, send_cq.handle, recv_cq.handle, init_attr)
            .map_err(Error::resource(ResourceStage::CreateQp(index)))?;
        Ok(QueuePair {
            handle: info.handle,
            qp_num: info.qp_num,
            index,
            pd: Arc::clone(self),
            _send_cq: Arc::clone(send_cq),
            _recv_cq: Arc::clone(recv_cq),
        })
    }

    /// The parent context.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }
}

impl Context {
    /// Allocate a Protection Domain.
    pub fn alloc_pd(self: &Arc<Self>) -> Result<Arc<ProtectionDomain>> {
        ProtectionDomain::new(Arc::clone(self))
    }
}
