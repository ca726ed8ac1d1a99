/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

#![allow(non_snake_case)]

//! Natural loops, found from back edges (edges whose target dominates their
//! source), plus loop depths and loop exit points.

use log::{debug, trace};

use crate::analysis::{AnalysisError, ControlFlowGraph, EdgeKind};
use crate::data_structures::{BlockIx, BlockSet, LoopIx, TypedIxVec};
use crate::dominance::Dominance;
use crate::traversal::SpanningTree;

#[derive(Clone, Debug)]
pub struct LoopEntry {
  pub header: BlockIx,
  pub members: BlockSet,
  /// Members with a normal (non-exception) edge leaving the loop.
  pub exits: BlockSet,
  /// How many loops, counting this one, contain the header.
  pub depth: u32,
}

pub struct NaturalLoops {
  loops: TypedIxVec<LoopIx, LoopEntry>,
  block_depth: TypedIxVec<BlockIx, u32>,
  exit_points: BlockSet,
}

impl NaturalLoops {
  #[inline(never)]
  pub fn compute(
    cfg: &ControlFlowGraph, st: &SpanningTree, dom: &Dominance,
  ) -> Result<Self, AnalysisError> {
    debug!("NaturalLoops::compute: begin");
    let nBlocks = cfg.num_blocks();
    let mut loops = TypedIxVec::<LoopIx, LoopEntry>::new();

    // === BEGIN find loops ===
    //
    for &bix in st.pre_order.iter() {
      for head in cfg.succs(bix) {
        if !dom.dominates(head, bix) {
          continue;
        }
        // Some loop with this header already covers this back edge.
        let covered = loops
          .iter()
          .any(|lp| lp.header == head && lp.members.contains(bix));
        if covered {
          continue;
        }

        let mut members = BlockSet::unit(nBlocks, bix);
        members.insert(head);
        let mut worklist = vec![bix];
        while let Some(m) = worklist.pop() {
          if m == head {
            continue;
          }
          for pred in cfg.preds(m) {
            if st.is_reachable(pred) && members.insert(pred) {
              worklist.push(pred);
            }
          }
        }

        for &m in members.to_vec().iter() {
          if !dom.dominates(head, m) {
            return Err(AnalysisError::InvariantViolation(format!(
              "loop header {:?} does not dominate member {:?}",
              head, m
            )));
          }
        }

        if loops.iter().any(|lp| lp.members == members) {
          continue;
        }
        trace!(
          "NaturalLoops: back edge {:?} -> {:?}, members {:?}",
          bix,
          head,
          members
        );
        loops.push(LoopEntry {
          header: head,
          members,
          exits: BlockSet::empty(nBlocks),
          depth: 0,
        });
      }
    }
    //
    // === END find loops ===

    // === BEGIN depths and exits ===
    //
    // A block's depth counts the loop entries containing it.  Two entries
    // sharing a header both count.
    let mut block_depth = TypedIxVec::<BlockIx, u32>::filled(nBlocks, 0);
    for &bix in st.pre_order.iter() {
      block_depth[bix] =
        loops.iter().filter(|lp| lp.members.contains(bix)).count() as u32;
    }

    let mut exit_points = BlockSet::empty(nBlocks);
    for lp in loops.iter_mut() {
      lp.depth = block_depth[lp.header];
      for m in lp.members.to_vec() {
        let leaves = cfg.blocks[m].succ_edges.iter().any(|e| {
          let edge = &cfg.edges[*e];
          edge.kind == EdgeKind::Normal && !lp.members.contains(edge.succ)
        });
        if leaves {
          lp.exits.insert(m);
          exit_points.insert(m);
        }
      }
    }
    //
    // === END depths and exits ===

    debug!("NaturalLoops::compute: end, {} loops", loops.len());
    Ok(NaturalLoops { loops, block_depth, exit_points })
  }

  pub fn len(&self) -> u32 {
    self.loops.len()
  }

  pub fn loops(&self) -> &TypedIxVec<LoopIx, LoopEntry> {
    &self.loops
  }

  pub fn get(&self, lix: LoopIx) -> &LoopEntry {
    &self.loops[lix]
  }

  pub fn depth_of(&self, bix: BlockIx) -> u32 {
    self.block_depth[bix]
  }

  /// Is this block an exit point of any loop?
  pub fn is_exit_point(&self, bix: BlockIx) -> bool {
    self.exit_points.contains(bix)
  }

  /// Loops ordered innermost first; ties keep discovery order.
  pub fn deepest_first(&self) -> Vec<LoopIx> {
    let mut res: Vec<LoopIx> = self.loops.range().into_iter().collect();
    res.sort_by_key(|lix| std::cmp::Reverse(self.loops[*lix].depth));
    res
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::test_graphs::TestGraph;
  use crate::traversal::PostOrder;

  fn loops(g: &TestGraph) -> NaturalLoops {
    let cfg = ControlFlowGraph::create(g).unwrap();
    let st = SpanningTree::compute(&cfg, false);
    let po = PostOrder::compute(&cfg);
    let dom = Dominance::compute(&cfg, &po).unwrap();
    NaturalLoops::compute(&cfg, &st, &dom).unwrap()
  }

  fn b(n: u32) -> BlockIx {
    BlockIx::new(n)
  }

  #[test]
  fn self_loop() {
    // A=0 -> A, A -> B=1
    let nl = loops(&TestGraph::new(&[&[0, 1], &[]]));
    assert_eq!(nl.len(), 1);
    let lp = nl.get(LoopIx::new(0));
    assert_eq!(lp.header, b(0));
    assert_eq!(lp.members.to_vec(), vec![b(0)]);
    assert_eq!(lp.exits.to_vec(), vec![b(0)]);
    assert_eq!(lp.depth, 1);
    assert_eq!(nl.depth_of(b(0)), 1);
    assert_eq!(nl.depth_of(b(1)), 0);
  }

  #[test]
  fn no_loops_in_a_diamond() {
    let nl = loops(&TestGraph::new(&[&[1, 2], &[3], &[3], &[]]));
    assert_eq!(nl.len(), 0);
    for n in 0..4 {
      assert_eq!(nl.depth_of(b(n)), 0);
    }
  }

  #[test]
  fn nested_loops() {
    // 0 -> 1 (outer header) -> 2 (inner header) -> 3 -> 2, 3 -> 4 -> 1,
    // 4 -> 5 exits.
    let g = TestGraph::new(&[&[1], &[2], &[3], &[2, 4], &[1, 5], &[]]);
    let nl = loops(&g);
    assert_eq!(nl.len(), 2);
    let order = nl.deepest_first();
    let inner = nl.get(order[0]);
    let outer = nl.get(order[1]);
    assert_eq!(inner.header, b(2));
    assert_eq!(inner.members.to_vec(), vec![b(2), b(3)]);
    assert_eq!(inner.exits.to_vec(), vec![b(3)]);
    assert_eq!(inner.depth, 2);
    assert_eq!(outer.header, b(1));
    assert_eq!(outer.members.to_vec(), vec![b(1), b(2), b(3), b(4)]);
    assert_eq!(outer.exits.to_vec(), vec![b(4)]);
    assert_eq!(outer.depth, 1);
    assert_eq!(nl.depth_of(b(3)), 2);
    assert_eq!(nl.depth_of(b(4)), 1);
    assert!(nl.is_exit_point(b(3)));
    assert!(!nl.is_exit_point(b(2)));
  }

  #[test]
  fn two_back_edges_share_a_header() {
    // 0 -> 1 -> 2 -> 1 and 1 -> 3 -> 1; both back edges target 1, but the
    // closures differ, so these stay two entries with one header.
    let g = TestGraph::new(&[&[1], &[2, 3, 4], &[1], &[1], &[]]);
    let nl = loops(&g);
    assert_eq!(nl.len(), 2);
    assert_eq!(nl.depth_of(b(1)), 2);
    assert_eq!(nl.depth_of(b(2)), 1);
    assert_eq!(nl.depth_of(b(3)), 1);
    assert_eq!(nl.depth_of(b(4)), 0);
    for lp in nl.loops().iter() {
      assert_eq!(lp.header, b(1));
      assert_eq!(lp.depth, 2);
    }
  }

  #[test]
  fn covered_back_edges_make_one_loop() {
    // 0 -> 1 -> 2 <-> 3, with 2 -> 1 and 3 -> 1.  The closure of 2 -> 1
    // already holds 3, so 3 -> 1 adds nothing.  3 -> 2 is an inner loop.
    let g = TestGraph::new(&[&[1], &[2], &[3, 1], &[2, 1]]);
    let nl = loops(&g);
    let headed_by_1: Vec<&LoopEntry> =
      nl.loops().iter().filter(|lp| lp.header == b(1)).collect();
    assert_eq!(headed_by_1.len(), 1);
    assert_eq!(headed_by_1[0].members.to_vec(), vec![b(1), b(2), b(3)]);
    assert_eq!(nl.len(), 2);
    assert_eq!(nl.depth_of(b(3)), 2);
  }

  #[test]
  fn exception_edges_do_not_make_exits() {
    // Loop 1 <-> 2 leaving from 1, with 2 protected by handler 3.
    let mut g = TestGraph::new(&[&[1], &[2, 4], &[1], &[4], &[]]);
    g.protect(2, 3, None);
    let nl = loops(&g);
    assert_eq!(nl.len(), 1);
    let lp = nl.get(LoopIx::new(0));
    assert_eq!(lp.exits.to_vec(), vec![b(1)]);
  }
}
