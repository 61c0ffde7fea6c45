// Copyright 2025-2026 The skillrt Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! # skillrt
//!
//! Runtime core for the SKilL binary interchange format (SKilL v1.0): reads
//! and writes SKilL files, materializes strongly typed object graphs into
//! storage pools indexed by stable numeric IDs, and serializes them back in
//! full-rewrite ("compress") and incremental ("append") modes. Generated,
//! per-schema bindings link against this engine; without bindings the crate
//! is fully usable through its reflective value API.
//!
//! # Architecture
//!
//! The runtime is built from four tightly coupled subsystems:
//!
//! - **Type/pool system** - the type hierarchy as a forest of storage pools
//!   sharing one contiguous backing array per hierarchy, with per-block
//!   bookkeeping of static and dynamic instance counts
//! - **Field encoding** - the SKilL field-type catalogue with one uniform
//!   read/write/offset contract for every type
//! - **String pool** - lazy, position-indexed string loading with
//!   at-most-once materialization and deduplicating serialization
//! - **Parallel field pipeline** - per-chunk decode jobs over the mapped
//!   input after parse, and the symmetric parallel write pipeline over a
//!   mapped output
//!
//! # Key Components
//!
//! - [`SkillState`] - a SKilL file materialized as a live object graph
//! - [`FieldType`] / [`FieldValue`] - the type catalogue and its values
//! - [`StringPool`] - lazy strings with deduplicating write and append
//! - [`pools`] - storage pools, blocks, chunks and iteration orders
//! - [`streams`] - mapped file access and the binary primitive set
//! - [`Error`] and [`Result`] - crate-wide error handling
//!
//! # Usage Examples
//!
//! ```rust,no_run
//! use skillrt::{FieldType, FieldValue, SkillState};
//!
//! // build a graph from scratch and write it
//! let mut state = SkillState::create();
//! let node = state.make_base_pool("node")?;
//! let next = state.add_field(node, "next", FieldType::Reference(0))?;
//!
//! let a = state.make(node)?;
//! let b = state.make(node)?;
//! state.set(&a, next, FieldValue::Ref(b.clone()))?;
//! state.set(&b, next, FieldValue::Ref(a.clone()))?; // cycles are fine
//! state.write("graph.sf")?;
//!
//! // read it back; field data decodes in parallel
//! let state = SkillState::open("graph.sf")?;
//! let node = state.pool_by_name("node").unwrap();
//! assert_eq!(state.size(node), 2);
//! # Ok::<(), skillrt::Error>(())
//! ```
//!
//! # Concurrency
//!
//! Parsing and layout planning are single-threaded; field-chunk decoding and
//! field-chunk writing fan out onto the shared worker pool. Each job touches
//! one field's storage behind its own lock and a disjoint region of the
//! mapped file, so jobs never order against each other. The string pool is
//! the one structure shared by all decoders and serializes its cache misses
//! internally.
//!
//! # References
//!
//! - SKilL v1.0 reference manual §G (serialization of types and fields)

#[macro_use]
pub(crate) mod error;

/// Field declarations and their generic storage strategies.
///
/// A [`fields::FieldDeclaration`] ties a name and type to an owning pool and
/// records where in the file its payload lives. Values are held by one of
/// two strategies, direct columns or identity-keyed distributed maps, with
/// lazy decoding layered on the latter. Restrictions hook in here as well.
pub mod fields;

/// The SKilL field-type catalogue.
///
/// [`FieldType`] is the closed set of types a field can carry, from constant
/// integers through strings, annotations and pool references up to the
/// compound container types. Every variant obeys the same
/// read/write/offset contract; [`FieldValue`] is the dynamic value
/// representation the reflective API works with.
pub mod fieldtypes;

/// Instances of user types and their shared handles.
///
/// A [`SkillObject`] carries its pool membership and a mutable ID encoding
/// the lifecycle: unassigned, deleted, or index+1 into its base pool's
/// backing array.
pub mod objects;

/// Storage pools, blocks, chunks and iteration orders.
///
/// Pools of one type hierarchy share a single contiguous backing array owned
/// by the base pool; the forest maintains the weak type order that file
/// layout, iteration and ID assignment follow. Per-block and per-chunk
/// bookkeeping for both serialization modes lives here too.
pub mod pools;

/// The state: one SKilL file materialized in memory.
///
/// [`SkillState`] is the main entry point: it owns the string pool, the type
/// forest and the mapped input, and exposes pool/field creation, instance
/// management, value access, and the compress and append serialization
/// modes.
pub mod state;

/// File abstraction and binary stream primitives.
///
/// Memory-mapped (and in-memory) inputs, the writable output mapping the
/// parallel write pipeline partitions, and the bounded readers and writers
/// for the SKilL primitive set including v64.
pub mod streams;

/// Lazy, position-indexed string pool.
///
/// Strings materialize on first access from their recorded file positions;
/// serialization deduplicates and assigns IDs, preserving existing ones in
/// append mode.
pub mod strings;

/// Convenient re-exports of the most commonly used types.
pub mod prelude;

pub use error::Error;

/// The result type used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

pub use fields::{FieldRestriction, FieldStrategy};
pub use fieldtypes::{FieldType, FieldValue};
pub use objects::{Obj, SkillObject};
pub use pools::{Pool, PoolId};
pub use state::{FieldId, SkillState};
pub use strings::StringPool;
