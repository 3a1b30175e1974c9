//! Device context and port addressing.

use std::fmt;
use std::sync::Arc;

use crate::Result;
use crate::error::{Error, ResourceStage};
use crate::provider::{DeviceHandle, SharedProvider};

/// A 16-byte global identifier (`ibv_gid`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    /// The all-zero GID.
    pub const ZERO: Gid = Gid([0; 16]);

    /// Raw bytes in network order.
    pub fn raw(&self) -> &[u8; 16] {
        &self.0
    }

    /// Whether every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// IPv4-mapped GID (`::ffff:a.b.c.d`) as used by RoCEv2.
    pub fn from_ipv4(octets: [u8; 4]) -> Self {
        let mut raw = [0u8; 16];
        raw[10] = 0xff;
        raw[11] = 0xff;
        raw[12..].copy_from_slice(&octets);
        Gid(raw)
    }
}

impl fmt::Display for Gid {
    /// Eight colon-separated groups of four hex digits.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pair) in self.0.chunks_exact(2).enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}{:02x}", pair[0], pair[1])?;
        }
        Ok(())
    }
}

/// Path MTU enum (`ibv_mtu`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mtu {
    Mtu256,
    Mtu512,
    Mtu1024,
    Mtu2048,
    Mtu4096,
}

impl Mtu {
    /// MTU in bytes.
    pub fn bytes(self) -> u32 {
        match self {
            Self::Mtu256 => 256,
            Self::Mtu512 => 512,
            Self::Mtu1024 => 1024,
            Self::Mtu2048 => 2048,
            Self::Mtu4096 => 4096,
        }
    }
}

impl fmt::Display for Mtu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes", self.bytes())
    }
}

/// Logical port state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Down,
    Init,
    Armed,
    Active,
}

/// Port attributes relevant to connection setup.
#[derive(Debug, Clone, Copy)]
pub struct PortAttr {
    pub state: PortState,
    /// MTU currently negotiated on the link. Used as the RTR path MTU.
    pub active_mtu: Mtu,
    /// Local ID (0 on RoCE ports).
    pub lid: u16,
    /// Number of entries in the port's GID table.
    pub gid_table_len: u32,
}

/// An opened device context.
///
/// All child resources (PD, CQ, QP, MR) hold an `Arc<Context>` to keep the
/// context alive; it is closed when the last of them is gone.
pub struct Context {
    pub(crate) provider: SharedProvider,
    pub(crate) handle: DeviceHandle,
    name: String,
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(e) = self.provider.close_device(self.handle) {
            tracing::error!("close_device({}) failed: {e}", self.name);
        } else {
            tracing::debug!("closed device {}", self.name);
        }
    }
}

impl Context {
    /// Open a device by name, or the provider's first device.
    pub fn open(provider: SharedProvider, selector: Option<&str>) -> Result<Arc<Self>> {
        let handle = provider
            .open_device(selector)
            .map_err(Error::resource(ResourceStage::OpenDevice))?;
        // Build the guard before asking for the name so a failure still closes it.
        let mut ctx = Context {
            provider,
            handle,
            name: String::new(),
        };
        ctx.name = ctx.provider.device_name(handle).unwrap_or_else(|e| {
            tracing::warn!("device_name failed: {e}");
            "<unknown>".to_string()
        });
        tracing::info!("opened device {}", ctx.name);
        Ok(Arc::new(ctx))
    }

    /// The device name (e.g. `"soft0"`, `"mlx5_0"`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Query port attributes.
    pub fn query_port(&self, port_num: u8) -> Result<PortAttr> {
        self.provider
            .query_port(self.handle, port_num)
            .map_err(Error::resource(ResourceStage::QueryPort))
    }

    /// Query a single GID entry by index.
    pub fn query_gid(&self, port_num: u8, index: u32) -> Result<Gid> {
        self.provider
            .query_gid(self.handle, port_num, index)
            .map_err(Error::resource(ResourceStage::QueryGid))
    }

    /// The provider this context was opened on.
    pub fn provider(&self) -> &SharedProvider {
        &self.provider
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gid_display_groups_pairs() {
        let gid = Gid::from_ipv4([10, 0, 0, 7]);
        assert_eq!(gid.to_string(), "0000:0000:0000:0000:0000:ffff:0a00:0007");
    }

    #[test]
    fn zero_gid() {
        assert!(Gid::ZERO.is_zero());
        assert!(!Gid::from_ipv4([192, 168, 1, 1]).is_zero());
    }

    #[test]
    fn mtu_ordering_follows_size() {
        assert!(Mtu::Mtu1024 < Mtu::Mtu4096);
        assert_eq!(Mtu::Mtu2048.bytes(), 2048);
    }
}
