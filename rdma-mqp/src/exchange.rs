//! Out-of-band metadata exchange over a connected byte stream.
//!
//! # Wire format
//!
//! ```text
//! u32 count
//! count × { u32 qp_num, u16 lid, u8[16] gid }   // 22 bytes each, no padding
//! ```
//!
//! Integers are little-endian. Each peer writes its whole message, then reads
//! the peer's. Both sides must follow that order; nothing here arbitrates it.

use std::fmt;
use std::io::{self, Read, Write};

use crate::device::Gid;
use crate::resources::MAX_QP;
use crate::{Error, Result};

/// Size of the count prefix.
pub const COUNT_LEN: usize = 4;

/// Size of one packed identifier record.
pub const RECORD_LEN: usize = 4 + 2 + 16;

/// What a peer needs to address one QP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionIdentifier {
    /// QP number (24 bits meaningful).
    pub qp_num: u32,
    /// Local ID of the port.
    pub lid: u16,
    /// GID at the configured index.
    pub gid: Gid,
}

impl fmt::Display for ConnectionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "qp_num={:#08x} lid={:#06x} gid={}",
            self.qp_num, self.lid, self.gid
        )
    }
}

impl ConnectionIdentifier {
    /// Packed wire form.
    pub fn to_bytes(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[..4].copy_from_slice(&self.qp_num.to_le_bytes());
        out[4..6].copy_from_slice(&self.lid.to_le_bytes());
        out[6..].copy_from_slice(self.gid.raw());
        out
    }

    /// Parse one packed record.
    pub fn from_bytes(raw: &[u8; RECORD_LEN]) -> Self {
        let mut gid = [0u8; 16];
        gid.copy_from_slice(&raw[6..]);
        Self {
            qp_num: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            lid: u16::from_le_bytes([raw[4], raw[5]]),
            gid: Gid(gid),
        }
    }
}

/// What to do when the peer reports a different QP count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CountPolicy {
    /// Refuse the handshake.
    #[default]
    Strict,
    /// Warn and pair only the first `min(local, peer)` QPs by index.
    Lenient,
}

/// Encode a full message: count prefix plus every record.
pub fn encode(ids: &[ConnectionIdentifier]) -> Vec<u8> {
    let mut out = Vec::with_capacity(COUNT_LEN + ids.len() * RECORD_LEN);
    out.extend_from_slice(&(ids.len() as u32).to_le_bytes());
    for id in ids {
        out.extend_from_slice(&id.to_bytes());
    }
    out
}

/// Decode a full message produced by [`encode`].
pub fn decode(mut bytes: &[u8]) -> Result<Vec<ConnectionIdentifier>> {
    read_identifiers(&mut bytes)
}

/// Fill `buf` completely, accumulating partial reads.
///
/// A read returning zero bytes means the peer closed the stream, which is
/// fatal here.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8], op: &'static str) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(Error::Transport {
                    op,
                    source: io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("peer closed after {filled} of {} bytes", buf.len()),
                    ),
                });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::Transport { op, source: e }),
        }
    }
    Ok(())
}

/// Write the local count and records in one blocking pass.
pub fn write_identifiers<W: Write>(w: &mut W, ids: &[ConnectionIdentifier]) -> Result<()> {
    if ids.len() > MAX_QP {
        return Err(Error::InvalidArg(format!(
            "{} identifiers exceed the limit of {MAX_QP}",
            ids.len()
        )));
    }
    w.write_all(&encode(ids))
        .and_then(|()| w.flush())
        .map_err(Error::transport("write identifiers"))?;
    tracing::debug!("sent {} local identifiers", ids.len());
    Ok(())
}

/// Read the peer's count and records.
pub fn read_identifiers<R: Read>(r: &mut R) -> Result<Vec<ConnectionIdentifier>> {
    let mut count = [0u8; COUNT_LEN];
    read_full(r, &mut count, "read peer QP count")?;
    let count = u32::from_le_bytes(count) as usize;
    if count > MAX_QP {
        return Err(Error::Handshake(format!(
            "peer QP count {count} exceeds the limit of {MAX_QP}"
        )));
    }

    let mut raw = vec![0u8; count * RECORD_LEN];
    read_full(r, &mut raw, "read peer identifiers")?;
    let ids = raw
        .chunks_exact(RECORD_LEN)
        .map(|chunk| {
            let mut rec = [0u8; RECORD_LEN];
            rec.copy_from_slice(chunk);
            ConnectionIdentifier::from_bytes(&rec)
        })
        .collect::<Vec<_>>();
    tracing::debug!("received {} peer identifiers", ids.len());
    Ok(ids)
}

/// Send `local`, then receive the peer's identifiers.
pub fn exchange<S: Read + Write>(
    stream: &mut S,
    local: &[ConnectionIdentifier],
) -> Result<Vec<ConnectionIdentifier>> {
    write_identifiers(stream, local)?;
    read_identifiers(stream)
}

/// Decide how many QPs can be paired by index.
pub fn reconcile(local: usize, peer: usize, policy: CountPolicy) -> Result<usize> {
    if peer == 0 {
        return Err(Error::Handshake("peer reported no QPs".into()));
    }
    if local == peer {
        return Ok(local);
    }
    match policy {
        CountPolicy::Strict => Err(Error::Handshake(format!(
            "peer has {peer} QPs, local side has {local}"
        ))),
        CountPolicy::Lenient => {
            let paired = local.min(peer);
            tracing::warn!(
                "peer QP count ({peer}) does not match local ({local}); pairing the first {paired}"
            );
            Ok(paired)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(qp_num: u32) -> ConnectionIdentifier {
        ConnectionIdentifier {
            qp_num,
            lid: 0x1234,
            gid: Gid::from_ipv4([10, 1, 2, 3]),
        }
    }

    #[test]
    fn record_layout_is_packed_little_endian() {
        let raw = sample(0x00ab_cdef).to_bytes();
        assert_eq!(raw.len(), 22);
        assert_eq!(&raw[..4], &[0xef, 0xcd, 0xab, 0x00]);
        assert_eq!(&raw[4..6], &[0x34, 0x12]);
        assert_eq!(&raw[16..], &[0xff, 0xff, 10, 1, 2, 3]);
    }

    #[test]
    fn message_round_trip_keeps_zero_gid() {
        let ids = vec![
            sample(7),
            ConnectionIdentifier {
                qp_num: 0x00ff_ffff,
                lid: 0,
                gid: Gid::ZERO,
            },
        ];
        let bytes = encode(&ids);
        assert_eq!(bytes.len(), COUNT_LEN + 2 * RECORD_LEN);
        assert_eq!(decode(&bytes).unwrap(), ids);
    }

    #[test]
    fn truncated_message_is_transport_error() {
        let bytes = encode(&[sample(1), sample(2)]);
        let err = decode(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, Error::Transport { .. }), "{err}");
    }

    #[test]
    fn oversized_count_is_rejected() {
        let bytes = 17u32.to_le_bytes();
        assert!(matches!(decode(&bytes), Err(Error::Handshake(_))));
    }

    #[test]
    fn partial_reads_are_accumulated() {
        struct Trickle<'a>(&'a [u8]);
        impl Read for Trickle<'_> {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                let n = buf.len().min(3).min(self.0.len());
                buf[..n].copy_from_slice(&self.0[..n]);
                self.0 = &self.0[n..];
                Ok(n)
            }
        }
        let ids = vec![sample(1), sample(2), sample(3)];
        let bytes = encode(&ids);
        assert_eq!(read_identifiers(&mut Trickle(&bytes)).unwrap(), ids);
    }

    #[test]
    fn reconcile_policies() {
        assert_eq!(reconcile(4, 4, CountPolicy::Strict).unwrap(), 4);
        assert!(matches!(
            reconcile(4, 2, CountPolicy::Strict),
            Err(Error::Handshake(_))
        ));
        assert_eq!(reconcile(4, 2, CountPolicy::Lenient).unwrap(), 2);
        assert_eq!(reconcile(2, 4, CountPolicy::Lenient).unwrap(), 2);
        assert!(reconcile(2, 0, CountPolicy::Lenient).is_err());
    }
}
