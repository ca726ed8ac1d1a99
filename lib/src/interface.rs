/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! This is the top level interface for the codelayout library.

use std::fmt;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

// Stuff that is defined by the library

// Sets and maps of things, and typed indices.

pub use crate::data_structures::{
  BitSet, BlockIx, BlockSet, EdgeIx, InstIx, LoopIx, Map, MethodIx, MyRange,
  RegionIx, Set, SlotIx, TypedIx, TypedIxVec,
};

// Analyses, for clients that want to look at them directly.

pub use crate::analysis::{
  AnalysisCache, AnalysisError, AnalysisKind, AnalysisLock, ControlFlowGraph,
  EdgeKind,
};
pub use crate::dominance::Dominance;
pub use crate::natural_loops::{LoopEntry, NaturalLoops};
pub use crate::post_dominance::PostDominance;
pub use crate::traversal::{EdgeClass, PostOrder, SpanningTree};

// Scheduling, placement and image construction.

pub use crate::exception_map::{ExceptionMap, ExceptionRange, HandlerEntry};
pub use crate::image::{
  CodeMap, DataItem, DataRef, EmitSink, ImageError, ImageLayout, ImageSection,
  PlacedRegion,
};
pub use crate::linker_heap::{
  HeapRange, MemoryAttributes, MemoryRange, MemoryUsage,
  PlacementRequirements, SortedLinkerHeap,
};
pub use crate::placement::PlacementError;
pub use crate::region::{
  Annotation, AnnotationKind, Region, RegionContext, RelocTarget,
};
pub use crate::relocation::{
  reconstruct as reconstruct_relocations, RelocationRecord,
};
pub use crate::scheduling::Schedule;

/// An exception type, as named by the front end.  The library only ever
/// compares these, or asks the front end about subtyping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ExceptionType(pub u32);

/// One entry of a block's protection list: the handler block, and the type
/// it catches (`None` catches everything).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlerClause {
  pub handler: BlockIx,
  pub filter: Option<ExceptionType>,
}

/// A trait defined by the client to provide access to its block graph.
pub trait Function {
  /// A name for diagnostics; also how other methods refer to this one.
  fn name(&self) -> &str;

  // -------------
  // CFG traversal
  // -------------

  /// Allow iteration over basic blocks (in instruction order).
  fn blocks(&self) -> MyRange<BlockIx>;

  /// Get the function's entry block.
  fn entry_block(&self) -> BlockIx;

  /// Provide the range of instruction indices contained in each block.
  fn block_insns(&self, block: BlockIx) -> MyRange<InstIx>;

  /// Get CFG successors for a given block, including the handlers that
  /// protect it.
  fn block_succs(&self, block: BlockIx) -> Vec<BlockIx>;

  // -------------------
  // Block classification
  // -------------------

  /// Is this block the start of an exception handler?
  fn is_exception_handler(&self, block: BlockIx) -> bool;

  /// Does this block end in dead control flow (a trap, or anything else that
  /// never continues)?
  fn is_dead(&self, block: BlockIx) -> bool;

  /// Is this instruction a call to something that never returns?
  fn is_no_return_call(&self, insn: InstIx) -> bool;

  // ----------
  // Exceptions
  // ----------

  /// The handlers protecting a block, innermost first.
  fn block_handlers(&self, block: BlockIx) -> Vec<HandlerClause>;

  /// Is `ty` the same as, or derived from, `of`?
  fn is_subtype_of(&self, ty: ExceptionType, of: ExceptionType) -> bool {
    ty == of
  }
}

/// The instruction encoder.  It estimates sizes before anything is placed,
/// and later writes the real bytes once the block order is known.
pub trait Encoder<F: Function> {
  /// A lower bound on the bytes `emit` will produce for this instruction.
  /// Zero means the instruction may vanish entirely (e.g. a jump to the
  /// next block).
  fn min_size(&self, func: &F, insn: InstIx) -> u32;

  /// Append the encoding of `insn` to the sink's region.  The sink says
  /// where the block sits in the final order and at which encoding level
  /// the instruction must be emitted.
  fn emit(
    &self, func: &F, insn: InstIx, sink: &mut EmitSink,
  ) -> Result<(), ImageError>;

  /// Write a filler into a region that ended up with no bytes at all.
  fn fill_empty_region(&self, region: &mut Region);

  /// The highest encoding level `emit` understands.  Instructions start at
  /// level zero and are escalated when their operands turn out not to fit.
  fn max_encoding_level(&self) -> u8 {
    0
  }
}

/// The target platform: where memory is and what may go there.
pub trait Platform {
  /// The declared physical memory ranges.
  fn memory_map(&self) -> Vec<MemoryRange>;

  /// Where a block's code may be placed.
  fn code_placement(&self, cold: bool) -> PlacementRequirements;

  /// Where data goes, unless a data item says otherwise.
  fn data_placement(&self) -> PlacementRequirements;
}

//=============================================================================
// Options

/// Knobs for the image build.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct LayoutOptions {
  /// Place cold code alongside hot code in the first placement pass, rather
  /// than after the hot code of every method.
  pub include_cold_code_in_first_pass: bool,

  /// How many times the image may be re-emitted after encoding-level
  /// escalations before giving up.
  pub max_restarts: u32,

  /// Zero runs shorter than this many words are encoded as data in the
  /// relocation records.
  pub min_zero_run_words: u32,

  /// Verify that overlapping regions agree on their bytes.
  pub check_consistency: bool,

  /// Extra alignment for the start of each method's hot code.
  pub entry_block_alignment: Option<u32>,
}

impl Default for LayoutOptions {
  fn default() -> Self {
    Self {
      include_cold_code_in_first_pass: false,
      max_restarts: 8,
      min_zero_run_words: 4,
      check_consistency: true,
      entry_block_alignment: None,
    }
  }
}

//=============================================================================
// Errors

#[derive(Clone, Debug)]
pub enum LayoutError {
  Analysis(AnalysisError),
  Placement(PlacementError),
  Image(ImageError),
}

impl fmt::Display for LayoutError {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      LayoutError::Analysis(err) => write!(fmt, "analysis error: {}", err),
      LayoutError::Placement(err) => write!(fmt, "placement error: {}", err),
      LayoutError::Image(err) => write!(fmt, "image error: {}", err),
    }
  }
}

impl std::error::Error for LayoutError {}

impl From<AnalysisError> for LayoutError {
  fn from(err: AnalysisError) -> Self {
    LayoutError::Analysis(err)
  }
}

impl From<PlacementError> for LayoutError {
  fn from(err: PlacementError) -> Self {
    LayoutError::Placement(err)
  }
}

impl From<ImageError> for LayoutError {
  fn from(err: ImageError) -> Self {
    LayoutError::Image(err)
  }
}

//=============================================================================
// Entry points

/// Compute the block order for a single function.  Block sizes come from the
/// encoder's minimum-size estimates.
#[inline(never)]
pub fn schedule_blocks<F: Function, E: Encoder<F>>(
  func: &F, encoder: &E,
) -> Result<Schedule, LayoutError> {
  let analyses = AnalysisCache::new(func)?;
  let _lock = analyses.lock_all();
  let sizes = crate::scheduling::estimate_block_sizes(func, encoder);
  Ok(crate::scheduling::schedule(&analyses, &sizes)?)
}

/// Lay out a whole image: schedule every function, emit and place code and
/// data, apply relocations, and derive the relocation and exception tables.
#[inline(never)]
pub fn layout_image<F: Function, E: Encoder<F>, P: Platform>(
  funcs: &[F], data: &[DataItem], encoder: &E, platform: &P,
  options: &LayoutOptions,
) -> Result<ImageLayout, LayoutError> {
  crate::image::ImageBuilder::new(funcs, data, encoder, platform, options)
    .build()
}
