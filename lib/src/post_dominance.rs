/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

#![allow(non_snake_case)]

//! Post-dominators, as a plain bit-vector fixpoint over the reachable part of
//! the graph.
//!
//! Exception handlers that never rejoin normal flow are treated like any
//! other block, not as additional exits.  In graphs whose exceptional flow is
//! irreducible this under-counts post-dominators.

use log::debug;

use crate::analysis::{AnalysisError, ControlFlowGraph};
use crate::data_structures::{BlockIx, BlockSet, TypedIxVec};
use crate::traversal::PostOrder;

pub struct PostDominance {
  /// Reflexive.  Blocks without successors only have themselves.
  pdom_sets: TypedIxVec<BlockIx, BlockSet>,
  ipdom: TypedIxVec<BlockIx, Option<BlockIx>>,
  reaches_exit: BlockSet,
}

impl PostDominance {
  #[inline(never)]
  pub fn compute(
    cfg: &ControlFlowGraph, po: &PostOrder,
  ) -> Result<Self, AnalysisError> {
    debug!("PostDominance::compute: begin");
    let nBlocks = cfg.num_blocks();
    let reachable = |b: BlockIx| po.index[b].is_some();

    // === BEGIN fixpoint ===
    //
    let mut pdom_sets =
      TypedIxVec::<BlockIx, BlockSet>::filled(nBlocks, BlockSet::full(nBlocks));
    let mut exits = Vec::<BlockIx>::new();
    for bix in cfg.blocks.range() {
      let hasSuccs = cfg.succs(bix).any(|s| reachable(s));
      if !reachable(bix) || !hasSuccs {
        pdom_sets[bix] = BlockSet::unit(nBlocks, bix);
        if reachable(bix) {
          exits.push(bix);
        }
      }
    }

    let mut changed = true;
    let mut rounds = 0;
    while changed {
      changed = false;
      rounds += 1;
      // Post-order visits successors before predecessors, mostly.
      for &bix in po.order.iter() {
        let mut succs = cfg.succs(bix).filter(|s| reachable(*s));
        let first = match succs.next() {
          Some(s) => s,
          None => continue,
        };
        let mut new_set = pdom_sets[first].clone();
        for succ in succs {
          new_set.intersect(&pdom_sets[succ]);
        }
        new_set.insert(bix);
        if new_set != pdom_sets[bix] {
          pdom_sets[bix] = new_set;
          changed = true;
        }
      }
    }
    debug!("PostDominance::compute: converged after {} rounds", rounds);
    //
    // === END fixpoint ===

    // Blocks from which no exit can be reached keep the "everything" set the
    // fixpoint started from; they have no meaningful post-dominators.
    let mut reaches_exit = BlockSet::empty(nBlocks);
    let mut worklist = exits.clone();
    for &e in exits.iter() {
      reaches_exit.insert(e);
    }
    while let Some(bix) = worklist.pop() {
      for pred in cfg.preds(bix) {
        if reachable(pred) && reaches_exit.insert(pred) {
          worklist.push(pred);
        }
      }
    }

    let ipdom = immediate_post_dominators(&po.order, &pdom_sets, &reaches_exit)?;

    debug!("PostDominance::compute: end, {} exits", exits.len());
    Ok(PostDominance { pdom_sets, ipdom, reaches_exit })
  }

  pub fn post_dominates(&self, p: BlockIx, bix: BlockIx) -> bool {
    self.pdom_sets[bix].contains(p)
  }

  pub fn post_dominance_set(&self, bix: BlockIx) -> &BlockSet {
    &self.pdom_sets[bix]
  }

  pub fn ipdom(&self, bix: BlockIx) -> Option<BlockIx> {
    self.ipdom[bix]
  }

  pub fn reaches_exit(&self, bix: BlockIx) -> bool {
    self.reaches_exit.contains(bix)
  }
}

// Of the strict post-dominators of a block, drop every one that also
// post-dominates another candidate.  What is left is the nearest.  The
// post-dominators of a block that reaches an exit form a chain, so a
// fixpoint result never leaves more than one.
fn immediate_post_dominators(
  order: &[BlockIx], pdom_sets: &TypedIxVec<BlockIx, BlockSet>,
  reaches_exit: &BlockSet,
) -> Result<TypedIxVec<BlockIx, Option<BlockIx>>, AnalysisError> {
  let mut ipdom =
    TypedIxVec::<BlockIx, Option<BlockIx>>::filled(pdom_sets.len(), None);
  for &bix in order.iter() {
    if !reaches_exit.contains(bix) {
      continue;
    }
    let mut candidates = pdom_sets[bix].clone();
    candidates.delete(bix);
    let cands = candidates.to_vec();
    for &c in cands.iter() {
      for &d in cands.iter() {
        if c != d && pdom_sets[c].contains(d) {
          candidates.delete(d);
        }
      }
    }
    match candidates.card() {
      0 => {}
      1 => ipdom[bix] = candidates.iter().next(),
      n => {
        return Err(AnalysisError::InvariantViolation(format!(
          "block {:?} has {} immediate post-dominators: {:?}",
          bix, n, candidates
        )))
      }
    }
  }
  Ok(ipdom)
}
