/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Tandem is a synchronous multi-master replication engine for transactional
//! databases. A database server embeds it as its replication provider: locally
//! prepared transaction write-sets are replicated to every cluster member, assigned a
//! cluster-wide total order, certified against concurrent transactions, and applied in
//! identical order everywhere — single-copy consistency without per-transaction
//! coordinator election.
//!
//! ## Layers
//!
//! - [`reactor`]: a single-threaded cooperative I/O reactor with pluggable stream
//!   engines (TLS slots in here).
//! - [`gmcast`], [`evs`], [`pc`]: the group communication stack — a TCP mesh with
//!   gossip discovery, extended virtual synchrony (reliable totally-ordered safe
//!   delivery with membership views), and primary-component determination.
//! - [`gcs`]: sequencing and flow control — global seqno assignment over the ordered
//!   stream, bounded action FIFOs, cluster-wide backpressure.
//! - [`cache`]: the seqno-indexed write-set cache backing incremental state transfer
//!   and recovery.
//! - [`cert`]: certification — optimistic conflict detection by key intersection over
//!   a trailing window.
//! - [`replicator`]: the state machine tying it together and the public API
//!   ([`Replicator`](replicator::Replicator), [`ReplicationHandler`]).
//!
//! ## Embedding
//!
//! Implement [`ReplicationHandler`] for your database, then
//! [`Replicator::connect`](replicator::Replicator::connect) with a [`Configuration`]
//! and a transport ([`Gmcast`](gmcast::Gmcast) in production). Call
//! [`replicate`](replicator::Replicator::replicate) at prepare time and
//! [`commit`](replicator::Replicator::commit) once the transaction is durable.

pub mod cache;

pub mod cert;

pub mod config;

pub mod event_bus;

pub mod events;

pub mod evs;

pub mod gcs;

pub mod gmcast;

pub mod logging;

pub mod network;

pub mod pc;

pub mod reactor;

pub mod replicator;

pub mod types;

// Re-exports of the embedding surface.
pub use config::Configuration;
pub use replicator::{ReplicationError, ReplicationHandler, Replicator};
pub use types::basic::{MemberId, Seqno, StateId, TrxId};
pub use types::view::{View, ViewKind};
pub use types::writeset::{WriteSet, WsFlags, WsKey};
