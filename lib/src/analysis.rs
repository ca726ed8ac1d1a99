/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

#![allow(non_snake_case)]

//! The control-flow graph arena, and the per-function cache of structural
//! analyses computed over it.

use log::{debug, trace};
use smallvec::SmallVec;

use std::cell::{Cell, OnceCell};
use std::fmt;
use std::rc::Rc;

use crate::data_structures::{BlockIx, EdgeIx, InstIx, MyRange, TypedIxVec};
use crate::dominance::Dominance;
use crate::interface::Function;
use crate::natural_loops::NaturalLoops;
use crate::post_dominance::PostDominance;
use crate::traversal::{PostOrder, SpanningTree};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnalysisError {
  /// The function's entry block isn't one of its blocks.
  InvalidEntry(BlockIx),

  /// A block names a successor that doesn't exist.
  InvalidSuccessor { from: BlockIx, to: BlockIx },

  /// A structural property that every well-formed graph has doesn't hold.
  /// This always indicates a bug in whoever built the graph.
  InvariantViolation(String),

  /// Cached analyses can't be thrown away while a compilation holds them.
  Locked { what: AnalysisKind },
}

impl fmt::Display for AnalysisError {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      AnalysisError::InvalidEntry(bix) => {
        write!(fmt, "entry block {:?} does not exist", bix)
      }
      AnalysisError::InvalidSuccessor { from, to } => write!(
        fmt,
        "block {:?} has successor {:?}, which does not exist",
        from, to
      ),
      AnalysisError::InvariantViolation(msg) => {
        write!(fmt, "invariant violation: {}", msg)
      }
      AnalysisError::Locked { what } => {
        write!(fmt, "can't invalidate {:?} while it is locked", what)
      }
    }
  }
}

//=============================================================================
// The control flow graph, as an arena of edges.  Edges are named by EdgeIx
// and blocks by the client's BlockIx.  Nothing here holds references back
// into the client's function, so the analyses can own it freely.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeKind {
  /// Ordinary control flow.
  Normal,
  /// Flow into an exception handler.
  Exception,
}

#[derive(Clone, Copy, Debug)]
pub struct Edge {
  pub pred: BlockIx,
  pub succ: BlockIx,
  pub kind: EdgeKind,
}

#[derive(Clone)]
pub struct BlockInfo {
  pub insns: MyRange<InstIx>,
  // Both lists are in the order the client reported successors.
  pub succ_edges: SmallVec<[EdgeIx; 2]>,
  pub pred_edges: SmallVec<[EdgeIx; 4]>,
  pub is_handler: bool,
  pub is_dead: bool,
}

pub struct ControlFlowGraph {
  pub entry: BlockIx,
  pub edges: TypedIxVec<EdgeIx, Edge>,
  pub blocks: TypedIxVec<BlockIx, BlockInfo>,
}

impl ControlFlowGraph {
  #[inline(never)]
  pub fn create<F: Function>(func: &F) -> Result<Self, AnalysisError> {
    let nBlocks = func.blocks().len() as u32;
    let entry = func.entry_block();
    if entry.get() >= nBlocks {
      return Err(AnalysisError::InvalidEntry(entry));
    }

    let mut blocks = TypedIxVec::<BlockIx, BlockInfo>::new();
    for bix in func.blocks() {
      blocks.push(BlockInfo {
        insns: func.block_insns(bix),
        succ_edges: SmallVec::new(),
        pred_edges: SmallVec::new(),
        is_handler: func.is_exception_handler(bix),
        is_dead: func.is_dead(bix),
      });
    }

    let mut edges = TypedIxVec::<EdgeIx, Edge>::new();
    for bix in func.blocks() {
      for succ in func.block_succs(bix) {
        if succ.get() >= nBlocks {
          return Err(AnalysisError::InvalidSuccessor { from: bix, to: succ });
        }
        // Successor lists are sets; a two-way branch whose arms agree still
        // only makes one edge.
        let dup = blocks[bix].succ_edges.iter().any(|e| edges[*e].succ == succ);
        if dup {
          continue;
        }
        let kind = if blocks[succ].is_handler {
          EdgeKind::Exception
        } else {
          EdgeKind::Normal
        };
        let eix = EdgeIx::new(edges.len());
        edges.push(Edge { pred: bix, succ, kind });
        blocks[bix].succ_edges.push(eix);
        blocks[succ].pred_edges.push(eix);
      }
    }

    debug!(
      "ControlFlowGraph::create: {} blocks, {} edges",
      blocks.len(),
      edges.len()
    );
    Ok(ControlFlowGraph { entry, edges, blocks })
  }

  pub fn num_blocks(&self) -> u32 {
    self.blocks.len()
  }

  pub fn succs<'a>(&'a self, bix: BlockIx) -> impl Iterator<Item = BlockIx> + 'a {
    self.blocks[bix].succ_edges.iter().map(move |e| self.edges[*e].succ)
  }

  pub fn preds<'a>(&'a self, bix: BlockIx) -> impl Iterator<Item = BlockIx> + 'a {
    self.blocks[bix].pred_edges.iter().map(move |e| self.edges[*e].pred)
  }

  /// Successors reached through ordinary control flow only.
  pub fn normal_succs<'a>(
    &'a self, bix: BlockIx,
  ) -> impl Iterator<Item = BlockIx> + 'a {
    self.blocks[bix]
      .succ_edges
      .iter()
      .filter(move |e| self.edges[**e].kind == EdgeKind::Normal)
      .map(move |e| self.edges[*e].succ)
  }
}

//=============================================================================
// The analysis cache.  Every analysis is computed on first request and kept
// until the cache is invalidated.  A compilation that relies on the cached
// results takes an AnalysisLock for the duration; invalidation is refused
// while any lock is outstanding.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AnalysisKind {
  SpanningTree,
  PostOrder,
  Dominance,
  PostDominance,
  NaturalLoops,
}

const NUM_ANALYSIS_KINDS: usize = 5;

const ALL_ANALYSIS_KINDS: [AnalysisKind; NUM_ANALYSIS_KINDS] = [
  AnalysisKind::SpanningTree,
  AnalysisKind::PostOrder,
  AnalysisKind::Dominance,
  AnalysisKind::PostDominance,
  AnalysisKind::NaturalLoops,
];

#[derive(Default)]
struct LockCounts {
  counts: [Cell<u32>; NUM_ANALYSIS_KINDS],
}

impl LockCounts {
  fn get(&self, kind: AnalysisKind) -> &Cell<u32> {
    &self.counts[kind as usize]
  }
}

/// A scoped hold on a group of cached analyses.  Dropping it releases every
/// analysis it covers, whichever way the holder exits.
pub struct AnalysisLock {
  counts: Rc<LockCounts>,
  kinds: SmallVec<[AnalysisKind; NUM_ANALYSIS_KINDS]>,
}

impl AnalysisLock {
  pub fn covers(&self, kind: AnalysisKind) -> bool {
    self.kinds.contains(&kind)
  }
}

impl Drop for AnalysisLock {
  fn drop(&mut self) {
    for kind in self.kinds.iter() {
      let count = self.counts.get(*kind);
      debug_assert!(count.get() > 0);
      count.set(count.get() - 1);
    }
    trace!("AnalysisLock: released {:?}", self.kinds);
  }
}

pub struct AnalysisCache<'a, F: Function> {
  func: &'a F,
  cfg: ControlFlowGraph,
  index_insns: bool,
  spanning_tree: OnceCell<SpanningTree>,
  post_order: OnceCell<PostOrder>,
  dominance: OnceCell<Dominance>,
  post_dominance: OnceCell<PostDominance>,
  loops: OnceCell<NaturalLoops>,
  locks: Rc<LockCounts>,
}

impl<'a, F: Function> AnalysisCache<'a, F> {
  pub fn new(func: &'a F) -> Result<Self, AnalysisError> {
    Ok(Self {
      func,
      cfg: ControlFlowGraph::create(func)?,
      index_insns: false,
      spanning_tree: OnceCell::new(),
      post_order: OnceCell::new(),
      dominance: OnceCell::new(),
      post_dominance: OnceCell::new(),
      loops: OnceCell::new(),
      locks: Rc::new(LockCounts::default()),
    })
  }

  /// Ask the spanning tree to also number every instruction it passes.
  pub fn with_insn_indexing(mut self) -> Self {
    self.index_insns = true;
    self
  }

  pub fn func(&self) -> &'a F {
    self.func
  }

  pub fn cfg(&self) -> &ControlFlowGraph {
    &self.cfg
  }

  pub fn spanning_tree(&self) -> &SpanningTree {
    self
      .spanning_tree
      .get_or_init(|| SpanningTree::compute(&self.cfg, self.index_insns))
  }

  pub fn post_order(&self) -> &PostOrder {
    self.post_order.get_or_init(|| PostOrder::compute(&self.cfg))
  }

  pub fn dominance(&self) -> Result<&Dominance, AnalysisError> {
    if let Some(dom) = self.dominance.get() {
      return Ok(dom);
    }
    let dom = Dominance::compute(&self.cfg, self.post_order())?;
    Ok(self.dominance.get_or_init(|| dom))
  }

  pub fn post_dominance(&self) -> Result<&PostDominance, AnalysisError> {
    if let Some(pdom) = self.post_dominance.get() {
      return Ok(pdom);
    }
    let pdom = PostDominance::compute(&self.cfg, self.post_order())?;
    Ok(self.post_dominance.get_or_init(|| pdom))
  }

  pub fn natural_loops(&self) -> Result<&NaturalLoops, AnalysisError> {
    if let Some(loops) = self.loops.get() {
      return Ok(loops);
    }
    let loops =
      NaturalLoops::compute(&self.cfg, self.spanning_tree(), self.dominance()?)?;
    Ok(self.loops.get_or_init(|| loops))
  }

  pub fn lock(&self, kinds: &[AnalysisKind]) -> AnalysisLock {
    for kind in kinds {
      let count = self.locks.get(*kind);
      count.set(count.get() + 1);
    }
    trace!("AnalysisLock: acquired {:?}", kinds);
    AnalysisLock { counts: self.locks.clone(), kinds: kinds.iter().cloned().collect() }
  }

  pub fn lock_all(&self) -> AnalysisLock {
    self.lock(&ALL_ANALYSIS_KINDS)
  }

  pub fn is_locked(&self, kind: AnalysisKind) -> bool {
    self.locks.get(kind).get() > 0
  }

  /// Throw away every cached analysis, e.g. after the client has changed the
  /// graph.  Fails without touching anything if some analysis is locked.
  pub fn invalidate(&mut self) -> Result<(), AnalysisError> {
    for kind in ALL_ANALYSIS_KINDS.iter() {
      if self.is_locked(*kind) {
        return Err(AnalysisError::Locked { what: *kind });
      }
    }
    self.cfg = ControlFlowGraph::create(self.func)?;
    self.spanning_tree = OnceCell::new();
    self.post_order = OnceCell::new();
    self.dominance = OnceCell::new();
    self.post_dominance = OnceCell::new();
    self.loops = OnceCell::new();
    debug!("AnalysisCache: invalidated");
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::test_graphs::TestGraph;

  #[test]
  fn bad_graphs_are_rejected() {
    let mut g = TestGraph::new(&[&[1], &[]]);
    g.entry = 5;
    assert_eq!(
      AnalysisCache::new(&g).err(),
      Some(AnalysisError::InvalidEntry(BlockIx::new(5)))
    );
    let g = TestGraph::new(&[&[1], &[7]]);
    assert_eq!(
      ControlFlowGraph::create(&g).err(),
      Some(AnalysisError::InvalidSuccessor {
        from: BlockIx::new(1),
        to: BlockIx::new(7)
      })
    );
  }

  #[test]
  fn duplicate_successors_make_one_edge() {
    let g = TestGraph::new(&[&[1, 1], &[]]);
    let cfg = ControlFlowGraph::create(&g).unwrap();
    assert_eq!(cfg.edges.len(), 1);
    assert_eq!(cfg.preds(BlockIx::new(1)).count(), 1);
  }

  #[test]
  fn handler_edges_are_exceptional() {
    let mut g = TestGraph::new(&[&[1], &[], &[1]]);
    g.protect(0, 2, None);
    let cfg = ControlFlowGraph::create(&g).unwrap();
    let kinds: Vec<EdgeKind> = cfg.edges.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EdgeKind::Normal, EdgeKind::Exception, EdgeKind::Normal]);
    let normal: Vec<BlockIx> = cfg.normal_succs(BlockIx::new(0)).collect();
    assert_eq!(normal, vec![BlockIx::new(1)]);
  }

  #[test]
  fn analyses_are_cached() {
    let g = TestGraph::new(&[&[1, 2], &[3], &[3], &[]]);
    let cache = AnalysisCache::new(&g).unwrap();
    let a = cache.dominance().unwrap() as *const Dominance;
    let b = cache.dominance().unwrap() as *const Dominance;
    assert_eq!(a, b);
    assert_eq!(cache.natural_loops().unwrap().len(), 0);
    assert!(cache.post_dominance().unwrap().reaches_exit(BlockIx::new(0)));
  }

  #[test]
  fn locks_block_invalidation_until_dropped() {
    let g = TestGraph::new(&[&[1], &[]]);
    let mut cache = AnalysisCache::new(&g).unwrap();
    {
      let lock = cache.lock(&[AnalysisKind::Dominance]);
      assert!(lock.covers(AnalysisKind::Dominance));
      assert!(!lock.covers(AnalysisKind::NaturalLoops));
      assert!(cache.is_locked(AnalysisKind::Dominance));
      let again = cache.lock_all();
      drop(again);
      assert!(cache.is_locked(AnalysisKind::Dominance));
      assert!(!cache.is_locked(AnalysisKind::PostOrder));
      std::mem::forget(lock);
    }
    assert_eq!(
      cache.invalidate(),
      Err(AnalysisError::Locked { what: AnalysisKind::Dominance })
    );
  }

  #[test]
  fn invalidate_recomputes() {
    let g = TestGraph::new(&[&[1], &[]]);
    let mut cache = AnalysisCache::new(&g).unwrap();
    {
      let _lock = cache.lock_all();
      assert_eq!(cache.spanning_tree().num_reachable(), 2);
    }
    assert!(cache.invalidate().is_ok());
    assert_eq!(cache.spanning_tree().num_reachable(), 2);
  }
}
