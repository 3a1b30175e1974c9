//! Transport provider capability.
//!
//! The core never touches hardware directly. Everything it needs from a
//! verbs implementation goes through [`Provider`], which hands out opaque
//! handles and reports failures as `errno`-style [`io::Error`]s. The RAII
//! wrappers in [`device`](crate::device), [`pd`](crate::pd), [`mr`](crate::mr),
//! [`cq`](crate::cq) and [`qp`](crate::qp) own those handles and release them
//! on drop.

use std::io;
use std::sync::Arc;

use crate::device::{Gid, PortAttr};
use crate::mr::{AccessFlags, Buffer};
use crate::qp::{QpAttr, QpInitAttr, QpTransition};
use crate::wc::WorkCompletion;
use crate::wr::{RecvWr, SendWr};

/// An opened device context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u32);

/// A protection domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PdHandle(pub u32);

/// A registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MrHandle(pub u32);

/// A completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CqHandle(pub u32);

/// A queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QpHandle(pub u32);

/// What `register_memory` hands back.
#[derive(Debug, Clone, Copy)]
pub struct MrInfo {
    pub handle: MrHandle,
    pub lkey: u32,
    pub rkey: u32,
}

/// What `create_qp` hands back.
#[derive(Debug, Clone, Copy)]
pub struct QpInfo {
    pub handle: QpHandle,
    /// QP number assigned by the device (24 bits meaningful).
    pub qp_num: u32,
}

/// Shared, dynamically dispatched provider.
pub type SharedProvider = Arc<dyn Provider>;

/// Primitive verbs operations consumed by the core.
///
/// Every `create`/`alloc`/`open` call has a matching release call. The core
/// guarantees each handle is released exactly once, children before parents.
/// A failed [`modify_qp`](Provider::modify_qp) must leave the QP unchanged.
pub trait Provider: Send + Sync {
    /// Open a device by name, or the first device when `selector` is `None`.
    fn open_device(&self, selector: Option<&str>) -> io::Result<DeviceHandle>;
    fn close_device(&self, dev: DeviceHandle) -> io::Result<()>;

    /// Name of an opened device.
    fn device_name(&self, dev: DeviceHandle) -> io::Result<String>;
    fn query_port(&self, dev: DeviceHandle, port_num: u8) -> io::Result<PortAttr>;
    fn query_gid(&self, dev: DeviceHandle, port_num: u8, index: u32) -> io::Result<Gid>;

    fn alloc_pd(&self, dev: DeviceHandle) -> io::Result<PdHandle>;
    fn dealloc_pd(&self, pd: PdHandle) -> io::Result<()>;

    /// Register `buf` for the given access rights.
    fn register_memory(
        &self,
        pd: PdHandle,
        buf: &Arc<Buffer>,
        access: AccessFlags,
    ) -> io::Result<MrInfo>;
    fn deregister_memory(&self, mr: MrHandle) -> io::Result<()>;

    fn create_cq(&self, dev: DeviceHandle, capacity: u32) -> io::Result<CqHandle>;
    fn destroy_cq(&self, cq: CqHandle) -> io::Result<()>;

    /// Create an RC queue pair in RESET.
    fn create_qp(
        &self,
        pd: PdHandle,
        send_cq: CqHandle,
        recv_cq: CqHandle,
        attr: &QpInitAttr,
    ) -> io::Result<QpInfo>;
    fn destroy_qp(&self, qp: QpHandle) -> io::Result<()>;

    fn modify_qp(&self, qp: QpHandle, transition: &QpTransition) -> io::Result<()>;
    fn query_qp(&self, qp: QpHandle) -> io::Result<QpAttr>;

    fn post_send(&self, qp: QpHandle, wr: &SendWr) -> io::Result<()>;
    fn post_recv(&self, qp: QpHandle, wr: &RecvWr) -> io::Result<()>;

    /// Dequeue up to `wc.len()` completions, returning how many were written.
    fn poll_cq(&self, cq: CqHandle, wc: &mut [WorkCompletion]) -> io::Result<usize>;
}
