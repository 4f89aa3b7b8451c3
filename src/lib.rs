//! Distributed Cache Core: a content-addressed, peer-to-peer download cache
//! subsystem for the KotORModSync mod installer.
//!
//! A resource is identified either by a provider-supplied `MetadataHash`
//! (before its bytes are known) or, once downloaded, by a `ContentId`
//! derived from the canonical bencoded form of its descriptor (§3/§4.4).
//! [`optimizer::CacheOptimizer`] is the facade most callers need; everything
//! else in this crate is a component it composes.

pub mod bencode;
pub mod blocklist;
pub mod config;
pub mod descriptor;
pub mod diagnostics;
pub mod error;
pub mod gateway;
pub mod hash;
pub mod ids;
pub mod logging;
pub mod optimizer;
pub mod port;
pub mod registry;
pub mod swarm;

pub use config::DccConfig;
pub use error::{DccError, DccResult};
pub use optimizer::{CacheOptimizer, DownloadResult, DownloadSource};
