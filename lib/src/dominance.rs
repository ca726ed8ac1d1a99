/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

#![allow(non_snake_case)]

//! Dominators, after Cooper, Harvey and Kennedy, "A Simple, Fast Dominance
//! Algorithm".  Method-level graphs are small, so the iterative scheme wins
//! over Lengauer-Tarjan on simplicity.

use log::debug;

use crate::analysis::{AnalysisError, ControlFlowGraph};
use crate::data_structures::{BlockIx, BlockSet, TypedIxVec};
use crate::traversal::PostOrder;

pub struct Dominance {
  entry: BlockIx,
  /// The entry maps to itself; unreachable blocks map to None.
  idom: TypedIxVec<BlockIx, Option<BlockIx>>,
  /// Reflexive: every reachable block is in its own set.
  dom_sets: TypedIxVec<BlockIx, BlockSet>,
  frontier: TypedIxVec<BlockIx, BlockSet>,
}

// Walk the two fingers up the partially built tree until they meet.  The
// finger with the smaller post-order number is the deeper one.
fn intersect(
  idom: &TypedIxVec<BlockIx, Option<BlockIx>>,
  po_index: &TypedIxVec<BlockIx, Option<u32>>, mut b1: BlockIx,
  mut b2: BlockIx,
) -> Result<BlockIx, AnalysisError> {
  let number = |b: BlockIx| {
    po_index[b].ok_or_else(|| {
      AnalysisError::InvariantViolation(format!(
        "dominator walk reached unreachable block {:?}",
        b
      ))
    })
  };
  let up = |b: BlockIx| {
    idom[b].ok_or_else(|| {
      AnalysisError::InvariantViolation(format!(
        "dominator walk reached block {:?} with no dominator yet",
        b
      ))
    })
  };
  while b1 != b2 {
    while number(b1)? < number(b2)? {
      b1 = up(b1)?;
    }
    while number(b2)? < number(b1)? {
      b2 = up(b2)?;
    }
  }
  Ok(b1)
}

#[inline(never)]
fn compute_idoms(
  cfg: &ControlFlowGraph, po: &PostOrder,
) -> Result<TypedIxVec<BlockIx, Option<BlockIx>>, AnalysisError> {
  let mut idom = TypedIxVec::<BlockIx, Option<BlockIx>>::filled(
    cfg.num_blocks(),
    None,
  );
  idom[cfg.entry] = Some(cfg.entry);

  let mut changed = true;
  let mut rounds = 0;
  while changed {
    changed = false;
    rounds += 1;
    for bix in po.reverse_post_order() {
      if bix == cfg.entry {
        continue;
      }
      let mut reachablePreds = 0;
      let mut new_idom = None;
      for pred in cfg.preds(bix) {
        if po.index[pred].is_none() {
          continue;
        }
        reachablePreds += 1;
        if idom[pred].is_none() {
          continue;
        }
        new_idom = match new_idom {
          None => Some(pred),
          Some(cur) => Some(intersect(&idom, &po.index, pred, cur)?),
        };
      }
      if reachablePreds == 0 {
        return Err(AnalysisError::InvariantViolation(format!(
          "reachable block {:?} has no predecessors",
          bix
        )));
      }
      let new_idom = match new_idom {
        Some(b) => b,
        None => {
          return Err(AnalysisError::InvariantViolation(format!(
            "no predecessor of {:?} has a dominator",
            bix
          )))
        }
      };
      if idom[bix] != Some(new_idom) {
        idom[bix] = Some(new_idom);
        changed = true;
      }
    }
  }
  debug!("compute_idoms: converged after {} rounds", rounds);
  Ok(idom)
}

impl Dominance {
  #[inline(never)]
  pub fn compute(
    cfg: &ControlFlowGraph, po: &PostOrder,
  ) -> Result<Self, AnalysisError> {
    debug!("Dominance::compute: begin");
    let nBlocks = cfg.num_blocks();
    let idom = compute_idoms(cfg, po)?;

    // === BEGIN dominance sets ===
    //
    // Each set is the chain of immediate dominators up to the entry.  Doing
    // them in reverse post-order means the idom's set is always ready.
    let mut dom_sets =
      TypedIxVec::<BlockIx, BlockSet>::filled(nBlocks, BlockSet::empty(nBlocks));
    for bix in po.reverse_post_order() {
      let mut set = match idom[bix] {
        Some(d) if d != bix => dom_sets[d].clone(),
        _ => BlockSet::empty(nBlocks),
      };
      set.insert(bix);
      dom_sets[bix] = set;
    }
    //
    // === END dominance sets ===

    // === BEGIN dominance frontier ===
    //
    let mut frontier =
      TypedIxVec::<BlockIx, BlockSet>::filled(nBlocks, BlockSet::empty(nBlocks));
    for bix in po.reverse_post_order() {
      let preds: Vec<BlockIx> =
        cfg.preds(bix).filter(|p| po.index[*p].is_some()).collect();
      if preds.len() < 2 {
        continue;
      }
      let stop = idom[bix];
      for pred in preds {
        let mut runner = Some(pred);
        while let Some(r) = runner {
          if Some(r) == stop {
            break;
          }
          if !frontier[r].insert(bix) {
            // Already walked from here.
            break;
          }
          runner = idom[r].filter(|d| *d != r);
        }
      }
    }
    //
    // === END dominance frontier ===

    debug!("Dominance::compute: end");
    Ok(Dominance { entry: cfg.entry, idom, dom_sets, frontier })
  }

  /// The immediate dominator; the entry block is its own.
  pub fn idom(&self, bix: BlockIx) -> Option<BlockIx> {
    self.idom[bix]
  }

  pub fn dominates(&self, d: BlockIx, bix: BlockIx) -> bool {
    self.dom_sets[bix].contains(d)
  }

  pub fn strictly_dominates(&self, d: BlockIx, bix: BlockIx) -> bool {
    d != bix && self.dominates(d, bix)
  }

  pub fn dominance_set(&self, bix: BlockIx) -> &BlockSet {
    &self.dom_sets[bix]
  }

  pub fn frontier(&self, bix: BlockIx) -> &BlockSet {
    &self.frontier[bix]
  }

  pub fn entry(&self) -> BlockIx {
    self.entry
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::test_graphs::TestGraph;

  fn dominance(g: &TestGraph) -> Dominance {
    let cfg = ControlFlowGraph::create(g).unwrap();
    let po = PostOrder::compute(&cfg);
    Dominance::compute(&cfg, &po).unwrap()
  }

  fn b(n: u32) -> BlockIx {
    BlockIx::new(n)
  }

  #[test]
  fn diamond() {
    // A=0 -> B=1, C=2 -> D=3
    let dom = dominance(&TestGraph::new(&[&[1, 2], &[3], &[3], &[]]));
    assert_eq!(dom.idom(b(0)), Some(b(0)));
    assert_eq!(dom.idom(b(1)), Some(b(0)));
    assert_eq!(dom.idom(b(2)), Some(b(0)));
    assert_eq!(dom.idom(b(3)), Some(b(0)));
    assert_eq!(dom.dominance_set(b(0)).to_vec(), vec![b(0)]);
    assert_eq!(dom.dominance_set(b(3)).to_vec(), vec![b(0), b(3)]);
    assert_eq!(dom.frontier(b(1)).to_vec(), vec![b(3)]);
    assert_eq!(dom.frontier(b(2)).to_vec(), vec![b(3)]);
    assert!(dom.frontier(b(0)).is_empty());
    assert!(dom.frontier(b(3)).is_empty());
  }

  #[test]
  fn every_block_dominates_itself() {
    let g = TestGraph::new(&[&[1], &[2, 3], &[1], &[4, 5], &[5], &[]]);
    let dom = dominance(&g);
    for n in 0..6 {
      assert!(dom.dominates(b(n), b(n)));
      assert!(dom.dominates(b(0), b(n)));
    }
    // The only way to 2 is through 1.
    assert!(dom.strictly_dominates(b(1), b(2)));
    assert_eq!(dom.idom(b(5)), Some(b(3)));
  }

  #[test]
  fn loop_frontier() {
    // 0 -> 1 -> 2 -> 1, 2 -> 3
    let dom = dominance(&TestGraph::new(&[&[1], &[2], &[1, 3], &[]]));
    assert_eq!(dom.idom(b(3)), Some(b(2)));
    // The loop header is in its own frontier, and the latch's.
    assert_eq!(dom.frontier(b(1)).to_vec(), vec![b(1)]);
    assert_eq!(dom.frontier(b(2)).to_vec(), vec![b(1)]);
  }

  #[test]
  fn irreducible() {
    // 0 -> 1, 0 -> 2, 1 <-> 2
    let dom = dominance(&TestGraph::new(&[&[1, 2], &[2], &[1]]));
    assert_eq!(dom.idom(b(1)), Some(b(0)));
    assert_eq!(dom.idom(b(2)), Some(b(0)));
    assert_eq!(dom.frontier(b(1)).to_vec(), vec![b(2)]);
    assert_eq!(dom.frontier(b(2)).to_vec(), vec![b(1)]);
  }

  #[test]
  fn unreachable_blocks_are_ignored() {
    // 2 is unreachable but jumps into 1.
    let dom = dominance(&TestGraph::new(&[&[1], &[], &[1]]));
    assert_eq!(dom.idom(b(1)), Some(b(0)));
    assert_eq!(dom.idom(b(2)), None);
    assert!(dom.frontier(b(0)).is_empty());
  }
}
