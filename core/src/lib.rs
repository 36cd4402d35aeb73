//! FS2 Core
//!
//! A peer-to-peer file sharing system with two cooperating roles over one
//! wire protocol:
//!
//! - A **client** exports directory trees as read-only HTTP shares,
//!   registers with indexnodes, and downloads files from other peers in
//!   ranged chunks.
//! - An **indexnode** aggregates the file lists of registered clients into
//!   one searchable virtual filesystem and redirects download requests to
//!   the peers that hold the bytes.
//!
//! A client can also elect itself as an *auto-indexnode* over UDP adverts
//! when no dedicated indexnode is present, at which point it runs both
//! roles in one process.
//!
//! # Module structure
//!
//! - `protocol/`: public surface (configs, errors, constants, hash type)
//! - `wire/`: file-list codecs (binary and XML) and the UDP advert format
//! - `http/`: hand-rolled HTTP/1.1 primitives shared by both roles
//! - `indexnode/`: the aggregation engine and its endpoints
//! - `client/`: share engine, file server, communicator, downloads,
//!   auto-indexnode election
//! - `resilience/`: token buckets and upload slots
//! - `data/`: atomic state persistence helpers
//!
//! # Quick start
//!
//! ```ignore
//! use fs2_core::{ClientConfig, ClientNode};
//!
//! let config = ClientConfig::new()
//!     .with_alias("bob")
//!     .with_indexnode("http://indexnode.local:42424");
//! let client = ClientNode::start(config).await?;
//! client.add_share("music", "/home/bob/music".into()).await?;
//! ```

pub mod protocol;

pub mod data;
pub mod http;
pub mod resilience;
pub mod wire;

pub mod client;
pub mod indexnode;

pub use client::ClientNode;
pub use indexnode::IndexNode;
pub use protocol::{ClientConfig, Fs2Error, FileHash, IndexnodeConfig, ShareType};
