//! Multi-QP reliable-connection bring-up.
//!
//! Establishes N parallel RC queue pairs between two peers: creates the
//! resources, swaps connection identifiers over a TCP control channel, drives
//! every QP through RESET → INIT → RTR → RTS and attributes completions from
//! one shared CQ back to the originating QP.
//!
//! RDMA resources are RAII wrappers with `Arc`-based ownership to enforce
//! correct destruction order. The verbs primitives themselves come from a
//! [`Provider`](provider::Provider); [`soft::SoftFabric`] is an in-process
//! implementation.

pub mod config;
pub mod connect;
pub mod cq;
pub mod device;
pub mod error;
pub mod exchange;
pub mod mr;
pub mod pd;
pub mod poller;
pub mod provider;
pub mod qp;
pub mod resources;
pub mod session;
pub mod soft;
pub mod transfer;
pub mod wc;
pub mod wr;

pub use error::{Error, ErrorKind, Result};
