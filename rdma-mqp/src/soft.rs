//! In-process software provider.
//!
//! [`SoftFabric`] implements [`Provider`] without hardware. It models a set of
//! named devices on one fabric, each with a single active port and a small
//! GID table, and gives RC queue pairs the behaviour the rest of the crate
//! relies on:
//!
//! * QPs move through RESET → INIT → RTR → RTS only along legal edges, and a
//!   rejected modify leaves the QP untouched.
//! * A SEND is routed by the destination QP number and the GID (or LID) in
//!   the address handle. It waits on the receiver until a receive is posted,
//!   like an RC sender with infinite RNR retry.
//! * RDMA WRITE and READ check the remote key and the access rights of both
//!   the remote MR and the remote QP.
//! * Every object is accounted for; [`SoftFabric::live_resources`] and
//!   [`SoftFabric::failed_releases`] expose leaks and double releases.
//! * [`Fault`]s make chosen provider calls fail once.
//!
//! The whole fabric sits behind one mutex, so peers may run on different
//! threads of the same process.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::device::{Gid, Mtu, PortAttr, PortState};
use crate::mr::{AccessFlags, Buffer};
use crate::provider::{
    CqHandle, DeviceHandle, MrHandle, MrInfo, PdHandle, Provider, QpHandle, QpInfo,
};
use crate::qp::{QpAttr, QpInitAttr, QpState, QpTransition};
use crate::wc::{WcOpcode, WcStatus, WorkCompletion};
use crate::wr::{RecvWr, SendFlags, SendWr, Sge, WrOpcode};

/// The only port on a soft device.
pub const SOFT_PORT: u8 = 1;

/// First QP number handed out on a fabric.
const FIRST_QP_NUM: u32 = 0x000110;

/// A provider call that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    OpenDevice,
    DeviceName,
    QueryPort,
    QueryGid,
    AllocPd,
    RegisterMemory,
    CreateCq,
    /// The `nth` QP creation after arming, counting from 0.
    CreateQp { nth: usize },
    /// Any modify of QP `qp_num` towards `target`.
    ModifyQp { qp_num: u32, target: QpState },
}

#[derive(Debug)]
struct ArmedFault {
    fault: Fault,
    countdown: usize,
}

#[derive(Debug, Clone)]
struct SoftDevice {
    name: String,
    port: PortAttr,
    gids: Vec<Gid>,
}

impl SoftDevice {
    fn new(name: &str, ordinal: u8) -> Self {
        let mut link_local = [0u8; 16];
        link_local[0] = 0xfe;
        link_local[1] = 0x80;
        link_local[15] = ordinal;
        Self {
            name: name.to_string(),
            port: PortAttr {
                state: PortState::Active,
                active_mtu: Mtu::Mtu1024,
                lid: 0,
                gid_table_len: 2,
            },
            gids: vec![Gid(link_local), Gid::from_ipv4([10, 0, 0, ordinal])],
        }
    }
}

struct PdEntry {
    dev: u32,
}

struct MrEntry {
    pd: u32,
    buf: Arc<Buffer>,
    access: AccessFlags,
    lkey: u32,
    rkey: u32,
}

struct CqEntry {
    dev: u32,
    capacity: usize,
    entries: VecDeque<WorkCompletion>,
    overrun: bool,
}

/// A SEND waiting for the receiver to post a receive.
struct Inbound {
    src: u32,
    wr_id: u64,
    data: Vec<u8>,
    signaled: bool,
}

struct QpEntry {
    pd: u32,
    device: usize,
    send_cq: u32,
    recv_cq: u32,
    attr: QpAttr,
    recvs: VecDeque<RecvWr>,
    inbound: VecDeque<Inbound>,
    queued_sends: usize,
}

#[derive(Default)]
struct FabricState {
    devices: Vec<SoftDevice>,
    next_handle: u32,
    next_qp_num: u32,
    open: HashMap<u32, usize>,
    pds: HashMap<u32, PdEntry>,
    mrs: HashMap<u32, MrEntry>,
    cqs: HashMap<u32, CqEntry>,
    qps: HashMap<u32, QpEntry>,
    faults: Vec<ArmedFault>,
    failed_releases: usize,
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.into())
}

fn busy(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::ResourceBusy, msg.into())
}

fn injected(fault: Fault) -> io::Error {
    io::Error::other(format!("injected failure: {fault:?}"))
}

impl FabricState {
    fn handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Consume an armed fault matching `pred`, if one is due.
    fn trip(&mut self, pred: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let pos = self.faults.iter().position(|f| pred(&f.fault))?;
        let armed = &mut self.faults[pos];
        if armed.countdown > 0 {
            armed.countdown -= 1;
            return None;
        }
        Some(self.faults.remove(pos).fault)
    }

    fn fail_on(&mut self, fault: Fault) -> io::Result<()> {
        match self.trip(|f| *f == fault) {
            Some(f) => Err(injected(f)),
            None => Ok(()),
        }
    }

    fn device(&self, dev: u32) -> io::Result<&SoftDevice> {
        let index = self
            .open
            .get(&dev)
            .ok_or_else(|| invalid(format!("unknown device handle {dev}")))?;
        Ok(&self.devices[*index])
    }

    fn device_by_name_mut(&mut self, name: &str) -> io::Result<&mut SoftDevice> {
        self.devices
            .iter_mut()
            .find(|d| d.name == name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no device {name}")))
    }

    fn qp(&self, qp: u32) -> io::Result<&QpEntry> {
        self.qps
            .get(&qp)
            .ok_or_else(|| invalid(format!("unknown QP handle {qp}")))
    }

    fn qp_mut(&mut self, qp: u32) -> io::Result<&mut QpEntry> {
        self.qps
            .get_mut(&qp)
            .ok_or_else(|| invalid(format!("unknown QP handle {qp}")))
    }

    fn mr_by_lkey(&self, pd: u32, lkey: u32) -> Option<&MrEntry> {
        self.mrs.values().find(|m| m.pd == pd && m.lkey == lkey)
    }

    fn mr_by_rkey(&self, pd: u32, rkey: u32) -> Option<&MrEntry> {
        self.mrs.values().find(|m| m.pd == pd && m.rkey == rkey)
    }

    fn live(&self) -> usize {
        self.open.len() + self.pds.len() + self.mrs.len() + self.cqs.len() + self.qps.len()
    }

    fn count_release(&mut self, result: io::Result<()>) -> io::Result<()> {
        if result.is_err() {
            self.failed_releases += 1;
        }
        result
    }

    fn check_modify(&self, entry: &QpEntry, transition: &QpTransition) -> io::Result<()> {
        let attr = &entry.attr;
        if let Some(required) = transition.required()
            && attr.state != required
        {
            return Err(invalid(format!(
                "QP {:#08x}: {} -> {} is not a legal transition",
                attr.qp_num,
                attr.state,
                transition.target()
            )));
        }
        let device = &self.devices[entry.device];
        match transition {
            QpTransition::Init(a) if a.port_num != SOFT_PORT => {
                Err(invalid(format!("no port {}", a.port_num)))
            }
            QpTransition::Rtr(a) => {
                if a.ah.is_global && a.ah.grh.sgid_index as usize >= device.gids.len() {
                    return Err(invalid(format!(
                        "sgid_index {} outside GID table of {}",
                        a.ah.grh.sgid_index,
                        device.gids.len()
                    )));
                }
                if a.path_mtu > device.port.active_mtu {
                    return Err(invalid(format!(
                        "path MTU {} exceeds active MTU {}",
                        a.path_mtu, device.port.active_mtu
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Destination QP of `src`, if a packet sent now would reach a peer that
    /// is connected back to `src`.
    fn route(&self, src: &QpEntry) -> Option<u32> {
        let ah = src.attr.ah?;
        let (&handle, dest) = self
            .qps
            .iter()
            .find(|(_, q)| q.attr.qp_num == src.attr.dest_qp_num)?;
        let device = &self.devices[dest.device];
        let reachable = if ah.is_global {
            device.gids.contains(&ah.grh.dgid)
        } else {
            ah.dlid == device.port.lid
        };
        let listening = matches!(dest.attr.state, QpState::Rtr | QpState::Rts)
            && dest.attr.dest_qp_num == src.attr.qp_num;
        (reachable && listening).then_some(handle)
    }

    fn gather(&self, pd: u32, sges: &[Sge]) -> Result<Vec<u8>, WcStatus> {
        let mut data = Vec::new();
        for sge in sges {
            let mr = self.mr_by_lkey(pd, sge.lkey).ok_or(WcStatus::LocProtErr)?;
            let range = mr
                .buf
                .range_of(sge.addr, sge.length as usize)
                .ok_or(WcStatus::LocProtErr)?;
            data.extend_from_slice(&mr.buf.lock()[range]);
        }
        Ok(data)
    }

    fn scatter(&self, pd: u32, sges: &[Sge], mut data: &[u8]) -> Result<(), WcStatus> {
        for sge in sges {
            if data.is_empty() {
                break;
            }
            let n = data.len().min(sge.length as usize);
            let mr = self.mr_by_lkey(pd, sge.lkey).ok_or(WcStatus::LocProtErr)?;
            if !mr.access.contains(AccessFlags::LOCAL_WRITE) {
                return Err(WcStatus::LocProtErr);
            }
            let range = mr.buf.range_of(sge.addr, n).ok_or(WcStatus::LocProtErr)?;
            mr.buf.lock()[range].copy_from_slice(&data[..n]);
            data = &data[n..];
        }
        Ok(())
    }

    fn push_wc(&mut self, cq: u32, wc: WorkCompletion) {
        let Some(cq) = self.cqs.get_mut(&cq) else {
            return;
        };
        if cq.entries.len() >= cq.capacity {
            tracing::error!("soft CQ overrun, dropping {wc:?}");
            cq.overrun = true;
            return;
        }
        cq.entries.push_back(wc);
    }

    /// Complete a send-queue request on `qp`. Failures are always reported
    /// and move the QP to ERROR.
    fn complete_send(
        &mut self,
        qp: u32,
        wr_id: u64,
        status: WcStatus,
        opcode: WcOpcode,
        len: usize,
        signaled: bool,
    ) {
        let Some(entry) = self.qps.get_mut(&qp) else {
            return;
        };
        if status != WcStatus::Success {
            entry.attr.state = QpState::Err;
        }
        if !signaled && status == WcStatus::Success {
            return;
        }
        let wc = WorkCompletion::new(wr_id, status, opcode, len as u32, entry.attr.qp_num);
        let cq = entry.send_cq;
        self.push_wc(cq, wc);
    }

    /// Match waiting SENDs with posted receives on `dest`.
    fn drain(&mut self, dest: u32) {
        loop {
            let Some(entry) = self.qps.get_mut(&dest) else {
                return;
            };
            if entry.recvs.is_empty() || entry.inbound.is_empty() {
                return;
            }
            let (Some(recv), Some(msg)) = (entry.recvs.pop_front(), entry.inbound.pop_front())
            else {
                return;
            };
            self.deliver(dest, recv, msg);
        }
    }

    fn deliver(&mut self, dest: u32, recv: RecvWr, msg: Inbound) {
        let Some(entry) = self.qps.get(&dest) else {
            return;
        };
        let (pd, qp_num, recv_cq) = (entry.pd, entry.attr.qp_num, entry.recv_cq);
        let len = msg.data.len();

        let (recv_status, send_status) = if len as u64 > recv.total_len() {
            (WcStatus::LocLenErr, WcStatus::RemInvReqErr)
        } else {
            match self.scatter(pd, recv.sges(), &msg.data) {
                Ok(()) => (WcStatus::Success, WcStatus::Success),
                Err(status) => (status, WcStatus::RemOpErr),
            }
        };

        let byte_len = if recv_status == WcStatus::Success { len } else { 0 };
        let wc = WorkCompletion::new(recv.wr_id(), recv_status, WcOpcode::Recv, byte_len as u32, qp_num);
        self.push_wc(recv_cq, wc);
        if recv_status != WcStatus::Success
            && let Some(entry) = self.qps.get_mut(&dest)
        {
            entry.attr.state = QpState::Err;
        }

        if let Some(src) = self.qps.get_mut(&msg.src) {
            src.queued_sends = src.queued_sends.saturating_sub(1);
        }
        self.complete_send(msg.src, msg.wr_id, send_status, WcOpcode::Send, len, msg.signaled);
    }

    fn rdma_write(&self, dest: u32, remote: (u64, u32), data: &[u8]) -> WcStatus {
        let Some(entry) = self.qps.get(&dest) else {
            return WcStatus::RetryExcErr;
        };
        if !entry.attr.access.contains(AccessFlags::REMOTE_WRITE) {
            return WcStatus::RemAccessErr;
        }
        let (addr, rkey) = remote;
        match self.mr_by_rkey(entry.pd, rkey) {
            Some(mr) if mr.access.contains(AccessFlags::REMOTE_WRITE) => {
                match mr.buf.range_of(addr, data.len()) {
                    Some(range) => {
                        mr.buf.lock()[range].copy_from_slice(data);
                        WcStatus::Success
                    }
                    None => WcStatus::RemAccessErr,
                }
            }
            _ => WcStatus::RemAccessErr,
        }
    }

    fn rdma_read(&self, dest: u32, remote: (u64, u32), len: usize) -> Result<Vec<u8>, WcStatus> {
        let entry = self.qps.get(&dest).ok_or(WcStatus::RetryExcErr)?;
        if !entry.attr.access.contains(AccessFlags::REMOTE_READ) {
            return Err(WcStatus::RemAccessErr);
        }
        let (addr, rkey) = remote;
        let mr = self
            .mr_by_rkey(entry.pd, rkey)
            .filter(|mr| mr.access.contains(AccessFlags::REMOTE_READ))
            .ok_or(WcStatus::RemAccessErr)?;
        let range = mr.buf.range_of(addr, len).ok_or(WcStatus::RemAccessErr)?;
        Ok(mr.buf.lock()[range].to_vec())
    }

    fn post_send(&mut self, qp: u32, wr: &SendWr) -> io::Result<()> {
        let src = self.qp(qp)?;
        if src.attr.state != QpState::Rts {
            return Err(invalid(format!(
                "QP {:#08x} is {}, sends need RTS",
                src.attr.qp_num, src.attr.state
            )));
        }
        if wr.sges().len() > src.attr.cap.max_send_sge as usize {
            return Err(invalid(format!("{} SGEs exceed max_send_sge", wr.sges().len())));
        }
        if src.queued_sends >= src.attr.cap.max_send_wr as usize {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "send queue full"));
        }
        let signaled = src.attr.cap.sq_sig_all || wr.send_flags().contains(SendFlags::SIGNALED);
        let pd = src.pd;
        let wc_opcode = match wr.opcode() {
            WrOpcode::Send => WcOpcode::Send,
            WrOpcode::RdmaWrite => WcOpcode::RdmaWrite,
            WrOpcode::RdmaRead => WcOpcode::RdmaRead,
        };
        let wr_id = wr.wr_id();

        let Some(dest) = self.route(src) else {
            tracing::debug!("QP {:#08x}: no route to peer", src.attr.qp_num);
            self.complete_send(qp, wr_id, WcStatus::RetryExcErr, wc_opcode, 0, signaled);
            return Ok(());
        };

        match wr.opcode() {
            WrOpcode::Send => {
                let data = match self.gather(pd, wr.sges()) {
                    Ok(data) => data,
                    Err(status) => {
                        self.complete_send(qp, wr_id, status, wc_opcode, 0, signaled);
                        return Ok(());
                    }
                };
                self.qp_mut(qp)?.queued_sends += 1;
                self.qp_mut(dest)?.inbound.push_back(Inbound {
                    src: qp,
                    wr_id,
                    data,
                    signaled,
                });
                self.drain(dest);
            }
            WrOpcode::RdmaWrite => {
                let (status, len) = match self.gather(pd, wr.sges()) {
                    Ok(data) => (self.rdma_write(dest, wr.remote(), &data), data.len()),
                    Err(status) => (status, 0),
                };
                self.complete_send(qp, wr_id, status, wc_opcode, len, signaled);
            }
            WrOpcode::RdmaRead => {
                let len = wr.total_len() as usize;
                let status = match self.rdma_read(dest, wr.remote(), len) {
                    Ok(data) => self.scatter(pd, wr.sges(), &data).err().unwrap_or(WcStatus::Success),
                    Err(status) => status,
                };
                self.complete_send(qp, wr_id, status, wc_opcode, len, signaled);
            }
        }
        Ok(())
    }

    fn post_recv(&mut self, qp: u32, wr: &RecvWr) -> io::Result<()> {
        let entry = self.qp_mut(qp)?;
        if matches!(entry.attr.state, QpState::Reset | QpState::Err) {
            return Err(invalid(format!(
                "QP {:#08x} is {}, cannot post receives",
                entry.attr.qp_num, entry.attr.state
            )));
        }
        if wr.sges().len() > entry.attr.cap.max_recv_sge as usize {
            return Err(invalid(format!("{} SGEs exceed max_recv_sge", wr.sges().len())));
        }
        if entry.recvs.len() >= entry.attr.cap.max_recv_wr as usize {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "receive queue full"));
        }
        entry.recvs.push_back(wr.clone());
        self.drain(qp);
        Ok(())
    }

    /// Flush outstanding receives of a QP that entered ERROR.
    fn flush(&mut self, qp: u32) {
        let Some(entry) = self.qps.get_mut(&qp) else {
            return;
        };
        let (cq, qp_num) = (entry.recv_cq, entry.attr.qp_num);
        let flushed: Vec<_> = entry.recvs.drain(..).collect();
        for recv in flushed {
            let wc = WorkCompletion::new(recv.wr_id(), WcStatus::WrFlushErr, WcOpcode::Recv, 0, qp_num);
            self.push_wc(cq, wc);
        }
    }
}

/// A software fabric of named devices.
pub struct SoftFabric {
    state: Mutex<FabricState>,
}

impl Default for SoftFabric {
    /// A fabric with one device, `soft0`.
    fn default() -> Self {
        Self::with_devices(&["soft0"])
    }
}

impl std::fmt::Debug for SoftFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("SoftFabric")
            .field("devices", &state.devices.iter().map(|d| &d.name).collect::<Vec<_>>())
            .field("live", &state.live())
            .finish()
    }
}

impl SoftFabric {
    /// A fabric with one device per name. Device `i` gets GID index 0 =
    /// `fe80::i+1` and GID index 1 = `::ffff:10.0.0.(i+1)`.
    pub fn with_devices(names: &[&str]) -> Self {
        let devices = names
            .iter()
            .zip(1u8..)
            .map(|(name, ordinal)| SoftDevice::new(name, ordinal))
            .collect();
        Self {
            state: Mutex::new(FabricState {
                devices,
                next_qp_num: FIRST_QP_NUM,
                ..Default::default()
            }),
        }
    }

    /// Wrap in an `Arc`, ready to be handed out as a provider.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn state(&self) -> MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next matching provider call fail.
    pub fn inject(&self, fault: Fault) {
        let countdown = match fault {
            Fault::CreateQp { nth } => nth,
            _ => 0,
        };
        self.state().faults.push(ArmedFault { fault, countdown });
    }

    /// Disarm every fault that has not fired.
    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    /// Overwrite one GID table entry of a device.
    pub fn set_gid(&self, device: &str, index: u32, gid: Gid) -> io::Result<()> {
        let mut state = self.state();
        let device = state.device_by_name_mut(device)?;
        let slot = device
            .gids
            .get_mut(index as usize)
            .ok_or_else(|| invalid(format!("GID index {index} out of range")))?;
        *slot = gid;
        Ok(())
    }

    /// Change the reported state of a device's port.
    pub fn set_port_state(&self, device: &str, port_state: PortState) -> io::Result<()> {
        self.state().device_by_name_mut(device)?.port.state = port_state;
        Ok(())
    }

    /// Change the MTU a device's port reports as active.
    pub fn set_active_mtu(&self, device: &str, mtu: Mtu) -> io::Result<()> {
        self.state().device_by_name_mut(device)?.port.active_mtu = mtu;
        Ok(())
    }

    /// Objects created and not yet released.
    pub fn live_resources(&self) -> usize {
        self.state().live()
    }

    /// Release calls that failed (unknown handle or object still in use).
    pub fn failed_releases(&self) -> usize {
        self.state().failed_releases
    }

    /// Completions waiting on every CQ.
    pub fn pending_completions(&self) -> usize {
        self.state().cqs.values().map(|cq| cq.entries.len()).sum()
    }
}

impl Provider for SoftFabric {
    fn open_device(&self, selector: Option<&str>) -> io::Result<DeviceHandle> {
        let mut state = self.state();
        state.fail_on(Fault::OpenDevice)?;
        let index = match selector {
            None if state.devices.is_empty() => {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no devices"));
            }
            None => 0,
            Some(name) => state
                .devices
                .iter()
                .position(|d| d.name == name)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no device {name}")))?,
        };
        let handle = state.handle();
        state.open.insert(handle, index);
        Ok(DeviceHandle(handle))
    }

    fn close_device(&self, dev: DeviceHandle) -> io::Result<()> {
        let mut state = self.state();
        let result = if !state.open.contains_key(&dev.0) {
            Err(invalid(format!("device handle {} not open", dev.0)))
        } else if state.pds.values().any(|p| p.dev == dev.0) || state.cqs.values().any(|c| c.dev == dev.0) {
            Err(busy("device still has PDs or CQs"))
        } else {
            state.open.remove(&dev.0);
            Ok(())
        };
        state.count_release(result)
    }

    fn device_name(&self, dev: DeviceHandle) -> io::Result<String> {
        let mut state = self.state();
        state.fail_on(Fault::DeviceName)?;
        Ok(state.device(dev.0)?.name.clone())
    }

    fn query_port(&self, dev: DeviceHandle, port_num: u8) -> io::Result<PortAttr> {
        let mut state = self.state();
        state.fail_on(Fault::QueryPort)?;
        let device = state.device(dev.0)?;
        if port_num != SOFT_PORT {
            return Err(invalid(format!("{} has no port {port_num}", device.name)));
        }
        Ok(device.port)
    }

    fn query_gid(&self, dev: DeviceHandle, port_num: u8, index: u32) -> io::Result<Gid> {
        let mut state = self.state();
        state.fail_on(Fault::QueryGid)?;
        let device = state.device(dev.0)?;
        if port_num != SOFT_PORT {
            return Err(invalid(format!("{} has no port {port_num}", device.name)));
        }
        device
            .gids
            .get(index as usize)
            .copied()
            .ok_or_else(|| invalid(format!("GID index {index} out of range")))
    }

    fn alloc_pd(&self, dev: DeviceHandle) -> io::Result<PdHandle> {
        let mut state = self.state();
        state.fail_on(Fault::AllocPd)?;
        state.device(dev.0)?;
        let handle = state.handle();
        state.pds.insert(handle, PdEntry { dev: dev.0 });
        Ok(PdHandle(handle))
    }

    fn dealloc_pd(&self, pd: PdHandle) -> io::Result<()> {
        let mut state = self.state();
        let result = if !state.pds.contains_key(&pd.0) {
            Err(invalid(format!("PD handle {} not allocated", pd.0)))
        } else if state.mrs.values().any(|m| m.pd == pd.0) || state.qps.values().any(|q| q.pd == pd.0) {
            Err(busy("PD still has MRs or QPs"))
        } else {
            state.pds.remove(&pd.0);
            Ok(())
        };
        state.count_release(result)
    }

    fn register_memory(
        &self,
        pd: PdHandle,
        buf: &Arc<Buffer>,
        access: AccessFlags,
    ) -> io::Result<MrInfo> {
        let mut state = self.state();
        state.fail_on(Fault::RegisterMemory)?;
        if !state.pds.contains_key(&pd.0) {
            return Err(invalid(format!("PD handle {} not allocated", pd.0)));
        }
        if buf.is_empty() {
            return Err(invalid("cannot register an empty buffer"));
        }
        if access.intersects(AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_ATOMIC)
            && !access.contains(AccessFlags::LOCAL_WRITE)
        {
            return Err(invalid("remote write access requires local write"));
        }
        let handle = state.handle();
        let (lkey, rkey) = (0x1000 + handle, 0x8000_0000 | handle);
        state.mrs.insert(
            handle,
            MrEntry {
                pd: pd.0,
                buf: Arc::clone(buf),
                access,
                lkey,
                rkey,
            },
        );
        Ok(MrInfo {
            handle: MrHandle(handle),
            lkey,
            rkey,
        })
    }

    fn deregister_memory(&self, mr: MrHandle) -> io::Result<()> {
        let mut state = self.state();
        let result = match state.mrs.remove(&mr.0) {
            Some(_) => Ok(()),
            None => Err(invalid(format!("MR handle {} not registered", mr.0))),
        };
        state.count_release(result)
    }

    fn create_cq(&self, dev: DeviceHandle, capacity: u32) -> io::Result<CqHandle> {
        let mut state = self.state();
        state.fail_on(Fault::CreateCq)?;
        state.device(dev.0)?;
        if capacity == 0 {
            return Err(invalid("CQ capacity must be non-zero"));
        }
        let handle = state.handle();
        state.cqs.insert(
            handle,
            CqEntry {
                dev: dev.0,
                capacity: capacity as usize,
                entries: VecDeque::new(),
                overrun: false,
            },
        );
        Ok(CqHandle(handle))
    }

    fn destroy_cq(&self, cq: CqHandle) -> io::Result<()> {
        let mut state = self.state();
        let result = if !state.cqs.contains_key(&cq.0) {
            Err(invalid(format!("CQ handle {} not created", cq.0)))
        } else if state.qps.values().any(|q| q.send_cq == cq.0 || q.recv_cq == cq.0) {
            Err(busy("CQ still attached to QPs"))
        } else {
            state.cqs.remove(&cq.0);
            Ok(())
        };
        state.count_release(result)
    }

    fn create_qp(
        &self,
        pd: PdHandle,
        send_cq: CqHandle,
        recv_cq: CqHandle,
        attr: &QpInitAttr,
    ) -> io::Result<QpInfo> {
        let mut state = self.state();
        if let Some(fault) = state.trip(|f| matches!(f, Fault::CreateQp { .. })) {
            return Err(injected(fault));
        }
        let dev = state
            .pds
            .get(&pd.0)
            .ok_or_else(|| invalid(format!("PD handle {} not allocated", pd.0)))?
            .dev;
        let device = *state
            .open
            .get(&dev)
            .ok_or_else(|| invalid(format!("device handle {dev} not open")))?;
        for cq in [send_cq, recv_cq] {
            if !state.cqs.contains_key(&cq.0) {
                return Err(invalid(format!("CQ handle {} not created", cq.0)));
            }
        }
        if attr.max_send_wr == 0 || attr.max_recv_wr == 0 {
            return Err(invalid("queue depths must be non-zero"));
        }
        let handle = state.handle();
        let qp_num = state.next_qp_num & 0x00ff_ffff;
        state.next_qp_num += 1;
        state.qps.insert(
            handle,
            QpEntry {
                pd: pd.0,
                device,
                send_cq: send_cq.0,
                recv_cq: recv_cq.0,
                attr: QpAttr::reset(qp_num, *attr),
                recvs: VecDeque::new(),
                inbound: VecDeque::new(),
                queued_sends: 0,
            },
        );
        Ok(QpInfo {
            handle: QpHandle(handle),
            qp_num,
        })
    }

    fn destroy_qp(&self, qp: QpHandle) -> io::Result<()> {
        let mut state = self.state();
        let result = match state.qps.remove(&qp.0) {
            Some(_) => Ok(()),
            None => Err(invalid(format!("QP handle {} not created", qp.0))),
        };
        state.count_release(result)
    }

    fn modify_qp(&self, qp: QpHandle, transition: &QpTransition) -> io::Result<()> {
        let mut state = self.state();
        let entry = state.qp(qp.0)?;
        state.check_modify(entry, transition)?;
        let qp_num = entry.attr.qp_num;
        let target = transition.target();
        if let Some(fault) = state.trip(|f| {
            matches!(f, Fault::ModifyQp { qp_num: n, target: t } if *n == qp_num && *t == target)
        }) {
            return Err(injected(fault));
        }
        let entry = state.qp_mut(qp.0)?;
        entry.attr.apply(transition);
        match transition {
            QpTransition::Err => state.flush(qp.0),
            QpTransition::Reset => {
                let entry = state.qp_mut(qp.0)?;
                entry.recvs.clear();
                entry.inbound.clear();
            }
            _ => {}
        }
        Ok(())
    }

    fn query_qp(&self, qp: QpHandle) -> io::Result<QpAttr> {
        Ok(self.state().qp(qp.0)?.attr)
    }

    fn post_send(&self, qp: QpHandle, wr: &SendWr) -> io::Result<()> {
        self.state().post_send(qp.0, wr)
    }

    fn post_recv(&self, qp: QpHandle, wr: &RecvWr) -> io::Result<()> {
        self.state().post_recv(qp.0, wr)
    }

    fn poll_cq(&self, cq: CqHandle, wc: &mut [WorkCompletion]) -> io::Result<usize> {
        let mut state = self.state();
        let cq = state
            .cqs
            .get_mut(&cq.0)
            .ok_or_else(|| invalid(format!("CQ handle {} not created", cq.0)))?;
        if cq.overrun {
            return Err(io::Error::other("completion queue overrun"));
        }
        let n = wc.len().min(cq.entries.len());
        for (slot, entry) in wc.iter_mut().zip(cq.entries.drain(..n)) {
            *slot = entry;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devices_get_distinct_gids() {
        let fabric = SoftFabric::with_devices(&["soft0", "soft1"]);
        let a = fabric.open_device(Some("soft0")).unwrap();
        let b = fabric.open_device(Some("soft1")).unwrap();
        let ga = fabric.query_gid(a, SOFT_PORT, 1).unwrap();
        let gb = fabric.query_gid(b, SOFT_PORT, 1).unwrap();
        assert_ne!(ga, gb);
        assert_eq!(ga, Gid::from_ipv4([10, 0, 0, 1]));
        assert!(fabric.query_gid(a, SOFT_PORT, 2).is_err());
        assert!(fabric.query_port(a, 2).is_err());
        fabric.close_device(a).unwrap();
        fabric.close_device(b).unwrap();
        assert_eq!(fabric.live_resources(), 0);
    }

    #[test]
    fn unknown_device_is_not_found() {
        let fabric = SoftFabric::default();
        let err = fabric.open_device(Some("mlx5_9")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn release_of_busy_or_unknown_objects_is_counted() {
        let fabric = SoftFabric::default();
        let dev = fabric.open_device(None).unwrap();
        let pd = fabric.alloc_pd(dev).unwrap();
        assert!(fabric.close_device(dev).is_err());
        fabric.dealloc_pd(pd).unwrap();
        assert!(fabric.dealloc_pd(pd).is_err());
        fabric.close_device(dev).unwrap();
        assert_eq!(fabric.failed_releases(), 2);
        assert_eq!(fabric.live_resources(), 0);
    }

    #[test]
    fn create_qp_fault_counts_down() {
        let fabric = SoftFabric::default();
        let dev = fabric.open_device(None).unwrap();
        let pd = fabric.alloc_pd(dev).unwrap();
        let cq = fabric.create_cq(dev, 8).unwrap();
        fabric.inject(Fault::CreateQp { nth: 1 });
        let attr = QpInitAttr::default();
        let first = fabric.create_qp(pd, cq, cq, &attr).unwrap();
        assert!(fabric.create_qp(pd, cq, cq, &attr).is_err());
        let third = fabric.create_qp(pd, cq, cq, &attr).unwrap();
        assert_eq!(third.qp_num, first.qp_num + 1);
        fabric.destroy_qp(first.handle).unwrap();
        fabric.destroy_qp(third.handle).unwrap();
        fabric.destroy_cq(cq).unwrap();
        fabric.dealloc_pd(pd).unwrap();
        fabric.close_device(dev).unwrap();
        assert_eq!(fabric.live_resources(), 0);
    }

    #[test]
    fn illegal_transition_leaves_qp_in_reset() {
        let fabric = SoftFabric::default();
        let dev = fabric.open_device(None).unwrap();
        let pd = fabric.alloc_pd(dev).unwrap();
        let cq = fabric.create_cq(dev, 8).unwrap();
        let qp = fabric.create_qp(pd, cq, cq, &QpInitAttr::default()).unwrap();
        let rts = QpTransition::Rts(crate::qp::RtsAttr {
            timeout: 14,
            retry_cnt: 7,
            rnr_retry: 7,
            sq_psn: 0,
            max_rd_atomic: 1,
        });
        assert!(fabric.modify_qp(qp.handle, &rts).is_err());
        assert_eq!(fabric.query_qp(qp.handle).unwrap().state, QpState::Reset);
        let wr = RecvWr::new(0);
        assert!(fabric.post_recv(qp.handle, &wr).is_err());
    }

    #[test]
    fn cq_overrun_is_reported() {
        let fabric = SoftFabric::default();
        let dev = fabric.open_device(None).unwrap();
        let pd = fabric.alloc_pd(dev).unwrap();
        let cq = fabric.create_cq(dev, 1).unwrap();
        let qp = fabric.create_qp(pd, cq, cq, &QpInitAttr::default()).unwrap();
        let init = QpTransition::Init(crate::qp::InitAttr {
            port_num: SOFT_PORT,
            pkey_index: 0,
            access: AccessFlags::LOCAL_WRITE,
        });
        fabric.modify_qp(qp.handle, &init).unwrap();
        fabric.post_recv(qp.handle, &RecvWr::new(0)).unwrap();
        fabric.post_recv(qp.handle, &RecvWr::new(1)).unwrap();
        // Flushing two receives into a one-entry CQ.
        fabric.modify_qp(qp.handle, &QpTransition::Err).unwrap();
        let mut wc = [WorkCompletion::default(); 4];
        assert!(fabric.poll_cq(cq, &mut wc).is_err());
    }
}
