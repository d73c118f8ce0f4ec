//! Wahub Storage — persistence seams for the session hosting service.
//!
//! Two external stores back the runtime, both treated as swappable
//! collaborators behind traits:
//!
//! # Document store ([`DocumentStore`])
//!
//! Holds the per-session status projection and the coordinator's instance
//! and ownership records. The trait's vocabulary is deliberately narrow:
//! whole-document get/set, **dotted-field patches** (never whole-object
//! replacement, so concurrent writers of unrelated fields don't trample
//! each other), collection scans, and a single-document compare-and-swap
//! used for ownership acquisition.
//!
//! # Object store ([`ObjectStore`])
//!
//! Holds encrypted session blob backups under flat string keys. Get/put/
//! list/delete, nothing else.
//!
//! [`MemoryDocumentStore`], [`MemoryObjectStore`], and [`FsObjectStore`]
//! are the in-tree implementations; production backends implement the same
//! traits out of tree.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod doc;
mod error;
mod memory_doc;
mod object;

pub use doc::{DocPath, DocumentStore, FieldPatch, apply_patch, get_field};
pub use error::{StorageError, StorageResult};
pub use memory_doc::MemoryDocumentStore;
pub use object::{FsObjectStore, MemoryObjectStore, ObjectStore};
