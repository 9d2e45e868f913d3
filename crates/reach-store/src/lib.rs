// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Embedded relational storage for Reach: WAL-mode SQLite, blob CAS, events, snapshots, audit."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! The storage driver exclusively owns the database handle. Concurrency is
//! multi-reader, single-writer: WAL mode at the file level, a connection
//! mutex per [`Store`] handle in-process. A busy write surfaces as a
//! structured [`StoreError::Busy`] (`transient_io`), never as corruption.
//! Blob writes go through temp-file + atomic rename and are verified against
//! their stored content hash on every read.

mod audit;
mod blobs;
mod driver;
mod events;
mod migrations;
mod runs;

pub use blobs::{BlobMeta, CasOptions, EvictionPolicy};
pub use driver::{Store, StoreError};
pub use migrations::SCHEMA_VERSION;
