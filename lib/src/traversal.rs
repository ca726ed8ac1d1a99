/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

#![allow(non_snake_case)]

//! Depth-first traversal of the block graph, with edge classification, and
//! the two numberings built on top of it: discovery (pre-)order and
//! post-order.

use log::debug;
use smallvec::SmallVec;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

use crate::analysis::ControlFlowGraph;
use crate::data_structures::{BlockIx, EdgeIx, InstIx, TypedIxVec};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum EdgeClass {
  Tree,
  Forward,
  Back,
  Cross,
}

/// Callbacks made by `depth_first_walk`.  Each block is entered exactly once
/// and exited exactly once; each edge out of a visited block is classified
/// exactly once.
pub trait Visitor {
  fn enter_block(&mut self, _bix: BlockIx) {}
  fn exit_block(&mut self, _bix: BlockIx) {}
  fn classify_edge(&mut self, _eix: EdgeIx, _class: EdgeClass) {}
}

/// What the walk itself knows at the end: discovery numbers and the
/// spanning-tree parent of every visited block.
pub struct WalkResult {
  pub pre_index: TypedIxVec<BlockIx, Option<u32>>,
  pub parent: TypedIxVec<BlockIx, Option<BlockIx>>,
}

// The order in which a block's out-edges are taken: everything leading to a
// live block first, then edges into dead blocks, each group in the client's
// order.
fn ordered_succ_edges(
  cfg: &ControlFlowGraph, bix: BlockIx,
) -> SmallVec<[EdgeIx; 4]> {
  let mut res = SmallVec::<[EdgeIx; 4]>::new();
  for &eix in cfg.blocks[bix].succ_edges.iter() {
    if !cfg.blocks[cfg.edges[eix].succ].is_dead {
      res.push(eix);
    }
  }
  for &eix in cfg.blocks[bix].succ_edges.iter() {
    if cfg.blocks[cfg.edges[eix].succ].is_dead {
      res.push(eix);
    }
  }
  res
}

// Is `anc` an ancestor of (or the same as) `desc` in the spanning tree built
// so far?  Walks parent pointers up from the deeper node; stops as soon as
// the discovery numbers say the answer must be no.
fn is_tree_ancestor(
  pre_index: &TypedIxVec<BlockIx, Option<u32>>,
  parent: &TypedIxVec<BlockIx, Option<BlockIx>>, anc: BlockIx, desc: BlockIx,
) -> bool {
  let ancIx = match pre_index[anc] {
    Some(ix) => ix,
    None => return false,
  };
  let mut cur = Some(desc);
  while let Some(bix) = cur {
    if bix == anc {
      return true;
    }
    match pre_index[bix] {
      Some(ix) if ix > ancIx => cur = parent[bix],
      _ => return false,
    }
  }
  false
}

/// Generic depth-first walk from the entry block.  Uses an explicit stack, so
/// deep graphs don't exhaust the native one.
#[inline(never)]
pub fn depth_first_walk<V: Visitor>(
  cfg: &ControlFlowGraph, visitor: &mut V,
) -> WalkResult {
  let nBlocks = cfg.num_blocks();
  let mut pre_index = TypedIxVec::<BlockIx, Option<u32>>::filled(nBlocks, None);
  let mut parent =
    TypedIxVec::<BlockIx, Option<BlockIx>>::filled(nBlocks, None);
  let mut next_index = 0;

  let mut stack = Vec::<(BlockIx, SmallVec<[EdgeIx; 4]>, usize)>::new();

  pre_index[cfg.entry] = Some(next_index);
  next_index += 1;
  visitor.enter_block(cfg.entry);
  stack.push((cfg.entry, ordered_succ_edges(cfg, cfg.entry), 0));

  while let Some((bix, edges, pos)) = stack.last_mut() {
    if *pos >= edges.len() {
      visitor.exit_block(*bix);
      stack.pop();
      continue;
    }
    let eix = edges[*pos];
    *pos += 1;
    let pred = *bix;
    let succ = cfg.edges[eix].succ;

    match (pre_index[pred], pre_index[succ]) {
      (_, None) => {
        visitor.classify_edge(eix, EdgeClass::Tree);
        pre_index[succ] = Some(next_index);
        next_index += 1;
        parent[succ] = Some(pred);
        visitor.enter_block(succ);
        stack.push((succ, ordered_succ_edges(cfg, succ), 0));
      }
      (Some(predIx), Some(succIx)) => {
        let class = if predIx < succIx {
          if is_tree_ancestor(&pre_index, &parent, pred, succ) {
            EdgeClass::Forward
          } else {
            EdgeClass::Cross
          }
        } else if is_tree_ancestor(&pre_index, &parent, succ, pred) {
          EdgeClass::Back
        } else {
          EdgeClass::Cross
        };
        visitor.classify_edge(eix, class);
      }
      (None, Some(_)) => unreachable!("walking out of an unvisited block"),
    }
  }

  WalkResult { pre_index, parent }
}

//=============================================================================
// Spanning tree: discovery order, tree parents and edge classes.

pub struct SpanningTree {
  /// Blocks in discovery order.  Unreachable blocks don't appear.
  pub pre_order: Vec<BlockIx>,
  pub pre_index: TypedIxVec<BlockIx, Option<u32>>,
  pub parent: TypedIxVec<BlockIx, Option<BlockIx>>,
  pub edge_class: TypedIxVec<EdgeIx, Option<EdgeClass>>,
  /// Instructions of the visited blocks, in discovery order.  Only filled in
  /// when instruction indexing was requested.
  pub insn_order: Vec<InstIx>,
  pub insn_index: Vec<Option<u32>>,
}

struct SpanningTreeBuilder<'a> {
  cfg: &'a ControlFlowGraph,
  index_insns: bool,
  pre_order: Vec<BlockIx>,
  edge_class: TypedIxVec<EdgeIx, Option<EdgeClass>>,
  insn_order: Vec<InstIx>,
}

impl<'a> Visitor for SpanningTreeBuilder<'a> {
  fn enter_block(&mut self, bix: BlockIx) {
    self.pre_order.push(bix);
    if self.index_insns {
      for iix in self.cfg.blocks[bix].insns {
        self.insn_order.push(iix);
      }
    }
  }
  fn classify_edge(&mut self, eix: EdgeIx, class: EdgeClass) {
    debug_assert!(self.edge_class[eix].is_none());
    self.edge_class[eix] = Some(class);
  }
}

impl SpanningTree {
  #[inline(never)]
  pub fn compute(cfg: &ControlFlowGraph, index_insns: bool) -> Self {
    debug!("SpanningTree::compute: begin");
    let mut builder = SpanningTreeBuilder {
      cfg,
      index_insns,
      pre_order: Vec::new(),
      edge_class: TypedIxVec::filled(cfg.edges.len(), None),
      insn_order: Vec::new(),
    };
    let walk = depth_first_walk(cfg, &mut builder);

    let mut insn_index = Vec::<Option<u32>>::new();
    if index_insns {
      let nInsns = cfg
        .blocks
        .iter()
        .map(|b| if b.insns.len() > 0 { b.insns.first().get() as usize + b.insns.len() } else { 0 })
        .max()
        .unwrap_or(0);
      insn_index.resize(nInsns, None);
      for (n, iix) in builder.insn_order.iter().enumerate() {
        insn_index[iix.get() as usize] = Some(n as u32);
      }
    }

    debug!(
      "SpanningTree::compute: end, {} of {} blocks reachable",
      builder.pre_order.len(),
      cfg.num_blocks()
    );
    SpanningTree {
      pre_order: builder.pre_order,
      pre_index: walk.pre_index,
      parent: walk.parent,
      edge_class: builder.edge_class,
      insn_order: builder.insn_order,
      insn_index,
    }
  }

  pub fn is_reachable(&self, bix: BlockIx) -> bool {
    self.pre_index[bix].is_some()
  }

  pub fn num_reachable(&self) -> u32 {
    self.pre_order.len() as u32
  }

  pub fn class_of(&self, eix: EdgeIx) -> Option<EdgeClass> {
    self.edge_class[eix]
  }
}

//=============================================================================
// Post-order: same walk, numbering blocks as they are left rather than as
// they are entered.

pub struct PostOrder {
  pub order: Vec<BlockIx>,
  pub index: TypedIxVec<BlockIx, Option<u32>>,
}

struct PostOrderBuilder {
  order: Vec<BlockIx>,
}

impl Visitor for PostOrderBuilder {
  fn exit_block(&mut self, bix: BlockIx) {
    self.order.push(bix);
  }
}

impl PostOrder {
  #[inline(never)]
  pub fn compute(cfg: &ControlFlowGraph) -> Self {
    debug!("PostOrder::compute: begin");
    let mut builder = PostOrderBuilder { order: Vec::new() };
    depth_first_walk(cfg, &mut builder);
    let mut index = TypedIxVec::filled(cfg.num_blocks(), None);
    for (n, bix) in builder.order.iter().enumerate() {
      index[*bix] = Some(n as u32);
    }
    debug!("PostOrder::compute: end, {} blocks", builder.order.len());
    PostOrder { order: builder.order, index }
  }

  pub fn reverse_post_order<'a>(
    &'a self,
  ) -> impl Iterator<Item = BlockIx> + 'a {
    self.order.iter().rev().cloned()
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::test_graphs::TestGraph;

  fn tree(g: &TestGraph) -> (ControlFlowGraph, SpanningTree) {
    let cfg = ControlFlowGraph::create(g).unwrap();
    let st = SpanningTree::compute(&cfg, true);
    (cfg, st)
  }

  fn class(
    cfg: &ControlFlowGraph, st: &SpanningTree, from: u32, to: u32,
  ) -> EdgeClass {
    for eix in cfg.edges.range() {
      let e = &cfg.edges[eix];
      if e.pred == BlockIx::new(from) && e.succ == BlockIx::new(to) {
        return st.class_of(eix).unwrap();
      }
    }
    panic!("no edge {} -> {}", from, to);
  }

  #[test]
  fn diamond_edges() {
    // 0 -> 1 -> 3, 0 -> 2 -> 3
    let g = TestGraph::new(&[&[1, 2], &[3], &[3], &[]]);
    let (cfg, st) = tree(&g);
    let order: Vec<u32> = st.pre_order.iter().map(|b| b.get()).collect();
    assert_eq!(order, vec![0, 1, 3, 2]);
    assert_eq!(class(&cfg, &st, 0, 1), EdgeClass::Tree);
    assert_eq!(class(&cfg, &st, 1, 3), EdgeClass::Tree);
    assert_eq!(class(&cfg, &st, 0, 2), EdgeClass::Tree);
    assert_eq!(class(&cfg, &st, 2, 3), EdgeClass::Cross);
  }

  #[test]
  fn loops_and_forward_edges() {
    // 0 -> 1 -> 2 -> 1, 0 -> 2 is forward, 2 -> 2 is a self loop
    let g = TestGraph::new(&[&[1, 2], &[2], &[1, 2, 3], &[]]);
    let (cfg, st) = tree(&g);
    assert_eq!(class(&cfg, &st, 0, 1), EdgeClass::Tree);
    assert_eq!(class(&cfg, &st, 1, 2), EdgeClass::Tree);
    assert_eq!(class(&cfg, &st, 2, 1), EdgeClass::Back);
    assert_eq!(class(&cfg, &st, 2, 2), EdgeClass::Back);
    assert_eq!(class(&cfg, &st, 0, 2), EdgeClass::Forward);
  }

  #[test]
  fn dead_successors_are_visited_last() {
    // Block 1 is dead; although it comes first in 0's successor list, 2 is
    // discovered before it.
    let mut g = TestGraph::new(&[&[1, 2], &[], &[]]);
    g.dead[1] = true;
    let (_cfg, st) = tree(&g);
    let order: Vec<u32> = st.pre_order.iter().map(|b| b.get()).collect();
    assert_eq!(order, vec![0, 2, 1]);
  }

  #[test]
  fn unreachable_blocks_get_no_index() {
    let g = TestGraph::new(&[&[2], &[2], &[]]);
    let (cfg, st) = tree(&g);
    assert!(!st.is_reachable(BlockIx::new(1)));
    assert_eq!(st.num_reachable(), 2);
    let po = PostOrder::compute(&cfg);
    assert_eq!(po.order, vec![BlockIx::new(2), BlockIx::new(0)]);
    assert_eq!(po.index[BlockIx::new(1)], None);
  }

  #[test]
  fn insns_are_indexed_in_discovery_order() {
    // Three blocks with two instructions each; discovery order 0, 2, 1.
    let mut g = TestGraph::new(&[&[2], &[], &[1]]);
    g.insns_per_block = 2;
    let (_cfg, st) = tree(&g);
    let order: Vec<u32> = st.insn_order.iter().map(|i| i.get()).collect();
    assert_eq!(order, vec![0, 1, 4, 5, 2, 3]);
    assert_eq!(st.insn_index[4], Some(2));
  }
}
