//! Process-level configuration.

use std::time::Duration;

use crate::exchange::CountPolicy;
use crate::poller::DEFAULT_POLL_TIMEOUT;
use crate::resources::{DEFAULT_BUF_SIZE, MAX_QP, ResourceConfig};
use crate::{Error, Result};

/// TCP port of the control channel.
pub const DEFAULT_TCP_PORT: u16 = 18515;

/// QPs per peer when not configured.
pub const DEFAULT_NUM_QP: usize = 4;

/// Physical port used when not configured.
pub const DEFAULT_IB_PORT: u8 = 1;

/// GID index used when not configured (the RoCEv2 IPv4 entry on most NICs).
pub const DEFAULT_GID_INDEX: u32 = 1;

/// Everything one peer needs to bring up its side of a connection.
#[derive(Debug, Clone)]
pub struct Config {
    /// Device name; `None` selects the first device.
    pub device: Option<String>,
    pub ib_port: u8,
    pub gid_index: u32,
    pub num_qp: usize,
    /// Registered buffer size in bytes, split across all QPs.
    pub buf_size: usize,
    /// Control-channel TCP port.
    pub tcp_port: u16,
    /// Upper bound on one completion wait.
    pub poll_timeout: Duration,
    pub count_policy: CountPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: None,
            ib_port: DEFAULT_IB_PORT,
            gid_index: DEFAULT_GID_INDEX,
            num_qp: DEFAULT_NUM_QP,
            buf_size: DEFAULT_BUF_SIZE,
            tcp_port: DEFAULT_TCP_PORT,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            count_policy: CountPolicy::Strict,
        }
    }
}

impl Config {
    /// Reject settings the core cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.num_qp == 0 || self.num_qp > MAX_QP {
            return Err(Error::InvalidArg(format!(
                "num_qp must be in 1..={MAX_QP}, got {}",
                self.num_qp
            )));
        }
        if self.ib_port == 0 {
            return Err(Error::InvalidArg("ib_port must be at least 1".into()));
        }
        if self.buf_size < self.num_qp * 2 {
            return Err(Error::InvalidArg(format!(
                "buf_size {} too small for {} QPs",
                self.buf_size, self.num_qp
            )));
        }
        if self.poll_timeout.is_zero() {
            return Err(Error::InvalidArg("poll_timeout must be non-zero".into()));
        }
        Ok(())
    }

    /// The subset handed to the resource manager.
    pub fn resources(&self) -> ResourceConfig {
        ResourceConfig {
            device: self.device.clone(),
            ib_port: self.ib_port,
            gid_index: self.gid_index,
            num_qp: self.num_qp,
            buf_size: self.buf_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert!(config.num_qp <= MAX_QP);
        assert_eq!(config.poll_timeout, Duration::from_secs(5));
    }

    #[test]
    fn qp_count_bounds() {
        for n in [0, MAX_QP + 1] {
            let config = Config {
                num_qp: n,
                ..Default::default()
            };
            assert!(matches!(config.validate(), Err(Error::InvalidArg(_))));
        }
    }

    #[test]
    fn buffer_must_cover_every_slot() {
        let config = Config {
            num_qp: 16,
            buf_size: 16,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
