/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Main file / top-level module for the codelayout library.

// Make the scheduling internals public for fuzzing.
#[cfg(feature = "fuzzing")]
pub mod scheduling;
#[cfg(not(feature = "fuzzing"))]
mod scheduling;

mod analysis;
mod data_structures;
mod dominance;
mod exception_map;
mod image;
mod interface;
mod linker_heap;
mod natural_loops;
mod placement;
mod post_dominance;
mod region;
mod relocation;
mod traversal;

#[cfg(test)]
mod test_graphs;

pub use crate::interface::*;
