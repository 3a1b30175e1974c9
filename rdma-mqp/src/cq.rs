//! Completion Queue.

use std::sync::Arc;

use crate::Result;
use crate::device::Context;
use crate::error::{Error, ResourceStage};
use crate::provider::CqHandle;
use crate::wc::WorkCompletion;

/// A Completion Queue shared by any number of QPs.
pub struct CompletionQueue {
    pub(crate) handle: CqHandle,
    capacity: u32,
    ctx: Arc<Context>,
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.provider.destroy_cq(self.handle) {
            tracing::error!("destroy_cq failed: {e}");
        }
    }
}

impl CompletionQueue {
    /// Create a new CQ with room for `capacity` entries.
    pub fn new(ctx: Arc<Context>, capacity: u32) -> Result<Arc<Self>> {
        let handle = ctx
            .provider
            .create_cq(ctx.handle, capacity)
            .map_err(Error::resource(ResourceStage::CreateCq))?;
        Ok(Arc::new(Self {
            handle,
            capacity,
            ctx,
        }))
    }

    /// Poll up to `wc_buf.len()` completions.
    ///
    /// Returns the number of completions written to `wc_buf`.
    pub fn poll(&self, wc_buf: &mut [WorkCompletion]) -> Result<usize> {
        self.ctx
            .provider
            .poll_cq(self.handle, wc_buf)
            .map_err(Error::Poll)
    }

    /// Number of entries the CQ was created with.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl Context {
    /// Create a Completion Queue.
    pub fn create_cq(self: &Arc<Self>, capacity: u32) -> Result<Arc<CompletionQueue>> {
        CompletionQueue::new(Arc::clone(self), capacity)
    }
}

impl std::fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("handle", &self.handle)
            .field("capacity", &self.capacity)
            .finish()
    }
}
