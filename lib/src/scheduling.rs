/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

#![allow(non_snake_case)]

//! Block scheduling.
//!
//! Every block starts out in its own atomic slot.  Slots are then merged
//! bottom-up into compound slots, each merge fixing that the left slot's
//! blocks come immediately before the right slot's.  The merge candidates
//! come from a handful of structural patterns: straight-line chains, loop
//! exits and if/then/else shapes.  Once nothing more can be merged, the
//! remaining top-level slots are numbered in a topological walk, hot slots
//! first and cold slots last.
//!
//! A slot's weight orders the candidates.  Loop depth dominates everything
//! (`nBlocks * 8^depth`), then hot versus cold, then discovery order.

use bitflags::bitflags;
use log::{debug, trace};
use smallvec::SmallVec;

use std::cell::Cell;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

use crate::analysis::{AnalysisCache, AnalysisError, ControlFlowGraph};
use crate::data_structures::{BlockIx, BlockSet, Set, SlotIx, TypedIxVec};
use crate::interface::{Encoder, Function};
use crate::natural_loops::NaturalLoops;
use crate::traversal::SpanningTree;

const COLD_CODE_BIAS: i64 = 1_000_000;
const LOOP_DEPTH_BASE: i64 = 8;

//=============================================================================
// Size estimates and cold code

/// Sum the encoder's minimum sizes over each block.
#[inline(never)]
pub fn estimate_block_sizes<F: Function, E: Encoder<F>>(
  func: &F, encoder: &E,
) -> TypedIxVec<BlockIx, u32> {
  let mut sizes = TypedIxVec::<BlockIx, u32>::new();
  for bix in func.blocks() {
    let mut size = 0u32;
    for iix in func.block_insns(bix) {
      size = size.saturating_add(encoder.min_size(func, iix));
    }
    sizes.push(size);
  }
  sizes
}

/// Blocks that will rarely run: exception handlers, dead ends, calls that
/// never return, and everything only reachable through those.  A block that
/// the entry can reach without passing through cold code is never cold.
#[inline(never)]
pub fn compute_cold_blocks<F: Function>(
  func: &F, cfg: &ControlFlowGraph, st: &SpanningTree,
) -> BlockSet {
  let nBlocks = cfg.num_blocks();

  let mut seeds = BlockSet::empty(nBlocks);
  for &bix in st.pre_order.iter() {
    let info = &cfg.blocks[bix];
    let noReturn = info.insns.into_iter().any(|iix| func.is_no_return_call(iix));
    if info.is_handler || info.is_dead || noReturn {
      seeds.insert(bix);
    }
  }

  // Reachable from the entry through hot blocks only.
  let mut hot = BlockSet::unit(nBlocks, cfg.entry);
  let mut worklist = vec![cfg.entry];
  while let Some(bix) = worklist.pop() {
    for succ in cfg.succs(bix) {
      if !seeds.contains(succ) && hot.insert(succ) {
        worklist.push(succ);
      }
    }
  }

  // Reachable from any cold block.
  let mut cold = seeds.clone();
  let mut worklist = seeds.to_vec();
  while let Some(bix) = worklist.pop() {
    for succ in cfg.succs(bix) {
      if cold.insert(succ) {
        worklist.push(succ);
      }
    }
  }

  for bix in hot.iter() {
    cold.delete(bix);
  }
  debug!(
    "compute_cold_blocks: {} seeds, {} transitively cold",
    seeds.card(),
    cold.card()
  );
  cold
}

//=============================================================================
// Slots

bitflags! {
  /// How an edge looks from one of its endpoints.
  #[derive(Clone, Copy, Debug, PartialEq, Eq)]
  struct SlotEdgeFlavor: u8 {
    const INBOUND = 1 << 0;
    const OUTBOUND = 1 << 1;
    /// The source isn't the last atomic slot of its top-level slot.
    const SOURCE_IS_INTERNAL = 1 << 2;
    /// The destination isn't the first atomic slot of its top-level slot.
    const DESTINATION_IS_INTERNAL = 1 << 3;
  }
}

/// An edge between two atomic slots, stored on the top-level slots that own
/// them.
#[derive(Clone, Copy, Debug)]
struct SlotEdge {
  source: SlotIx,
  destination: SlotIx,
  flavor: SlotEdgeFlavor,
}

impl SlotEdge {
  /// Connects the last block of one top-level slot to the first block of
  /// another, so the two could still be placed back to back.
  fn is_boundary(&self) -> bool {
    !self.flavor.intersects(
      SlotEdgeFlavor::SOURCE_IS_INTERNAL
        | SlotEdgeFlavor::DESTINATION_IS_INTERNAL,
    )
  }
}

#[derive(Clone, Debug)]
enum SlotKind {
  Atomic { block: BlockIx, zero_length_preds: SmallVec<[BlockIx; 2]> },
  Compound { left: SlotIx, right: SlotIx },
}

#[derive(Clone, Debug)]
struct Slot {
  kind: SlotKind,
  weight: i64,
  parent: Option<SlotIx>,
  // Leftmost and rightmost atomic slots.  Fixed at creation, since a
  // compound slot's children never change.
  first: SlotIx,
  last: SlotIx,
  cold: bool,
  // Only meaningful on top-level slots.
  edges: SmallVec<[SlotEdge; 4]>,
  // Only meaningful on atomic slots.
  sched_index: Option<u32>,
}

/// A working set of top-level slots, iterated in insertion order.
struct SlotSet {
  items: Vec<SlotIx>,
  members: Set<SlotIx>,
}

impl SlotSet {
  fn new() -> Self {
    SlotSet { items: Vec::new(), members: Set::empty() }
  }
  fn from_vec(v: &[SlotIx]) -> Self {
    let mut s = SlotSet::new();
    for x in v {
      s.insert(*x);
    }
    s
  }
  fn insert(&mut self, s: SlotIx) {
    if self.members.insert(s) {
      self.items.push(s);
    }
  }
  fn contains(&self, s: SlotIx) -> bool {
    self.members.contains(s)
  }
  fn len(&self) -> usize {
    self.items.len()
  }
}

struct Scheduler<'a> {
  cfg: &'a ControlFlowGraph,
  st: &'a SpanningTree,
  loops: &'a NaturalLoops,
  sizes: &'a TypedIxVec<BlockIx, u32>,
  cold: BlockSet,

  slots: TypedIxVec<SlotIx, Slot>,
  // Union-find over merges: following `leader` links always ends at the
  // current top-level slot.
  leader: Vec<Cell<SlotIx>>,
  block_slot: TypedIxVec<BlockIx, Option<SlotIx>>,
  alias_of: TypedIxVec<BlockIx, Option<BlockIx>>,
  // Atomic slots in creation order; that is also the order in which the
  // final numbering walk starts from them.
  atomics: Vec<SlotIx>,
  top_levels: Vec<SlotIx>,
  num_merges: u32,
}

impl<'a> Scheduler<'a> {
  fn new(
    cfg: &'a ControlFlowGraph, st: &'a SpanningTree, loops: &'a NaturalLoops,
    sizes: &'a TypedIxVec<BlockIx, u32>, cold: BlockSet,
  ) -> Self {
    let nBlocks = cfg.num_blocks();
    Scheduler {
      cfg,
      st,
      loops,
      sizes,
      cold,
      slots: TypedIxVec::new(),
      leader: Vec::new(),
      block_slot: TypedIxVec::filled(nBlocks, None),
      alias_of: TypedIxVec::filled(nBlocks, None),
      atomics: Vec::new(),
      top_levels: Vec::new(),
      num_merges: 0,
    }
  }

  // === BEGIN slot basics ===

  fn top(&self, s: SlotIx) -> SlotIx {
    let mut root = s;
    loop {
      let next = self.leader[root.get() as usize].get();
      if next == root {
        break;
      }
      root = next;
    }
    let mut cur = s;
    while cur != root {
      let next = self.leader[cur.get() as usize].get();
      self.leader[cur.get() as usize].set(root);
      cur = next;
    }
    root
  }

  fn is_top(&self, s: SlotIx) -> bool {
    self.slots[s].parent.is_none()
  }

  fn block_of(&self, atomic: SlotIx) -> BlockIx {
    match &self.slots[atomic].kind {
      SlotKind::Atomic { block, .. } => *block,
      SlotKind::Compound { .. } => {
        unreachable!("block_of: {:?} is not atomic", atomic)
      }
    }
  }

  /// The atomic slots of `s`, left to right.
  fn enumerate(&self, s: SlotIx) -> Vec<SlotIx> {
    let mut res = Vec::new();
    let mut stack = vec![s];
    while let Some(cur) = stack.pop() {
      match &self.slots[cur].kind {
        SlotKind::Atomic { .. } => res.push(cur),
        SlotKind::Compound { left, right } => {
          stack.push(*right);
          stack.push(*left);
        }
      }
    }
    res
  }

  fn weight_of_block(&self, bix: BlockIx) -> i64 {
    let bias = if self.cold.contains(bix) { -COLD_CODE_BIAS } else { COLD_CODE_BIAS };
    let discovery = self.st.pre_index[bix].unwrap_or(0) as i64;
    let nested = (self.cfg.num_blocks() as i64)
      .saturating_mul(LOOP_DEPTH_BASE.saturating_pow(self.loops.depth_of(bix)));
    bias.saturating_add(discovery).saturating_add(nested)
  }

  fn new_atomic(&mut self, bix: BlockIx) -> SlotIx {
    let s = SlotIx::new(self.slots.len());
    let weight = self.weight_of_block(bix);
    self.slots.push(Slot {
      kind: SlotKind::Atomic { block: bix, zero_length_preds: SmallVec::new() },
      weight,
      parent: None,
      first: s,
      last: s,
      cold: self.cold.contains(bix),
      edges: SmallVec::new(),
      sched_index: None,
    });
    self.leader.push(Cell::new(s));
    self.block_slot[bix] = Some(s);
    self.atomics.push(s);
    self.top_levels.push(s);
    trace!("new_atomic: {:?} for {:?}, weight {}", s, bix, weight);
    s
  }

  // The one block a zero-length block can fall into.
  fn fallthrough_succ(&self, bix: BlockIx) -> Option<BlockIx> {
    let mut succs =
      self.cfg.normal_succs(bix).filter(|s| self.st.is_reachable(*s));
    match (succs.next(), succs.next()) {
      (Some(s), None) => Some(s),
      _ => None,
    }
  }

  /// Find or make the atomic slot holding `bix`.  Blocks with no bytes of
  /// their own share the slot of the block they fall into.
  fn slot_for_block(&mut self, bix: BlockIx) -> SlotIx {
    let mut chain = SmallVec::<[BlockIx; 4]>::new();
    let mut cur = bix;
    let target = loop {
      if let Some(s) = self.block_slot[cur] {
        break s;
      }
      if chain.contains(&cur) {
        // A cycle of empty blocks; somebody has to own a slot.
        break self.new_atomic(cur);
      }
      if self.sizes[cur] == 0 {
        if let Some(next) = self.fallthrough_succ(cur) {
          chain.push(cur);
          cur = next;
          continue;
        }
      }
      break self.new_atomic(cur);
    };
    let targetBlock = self.block_of(target);
    for &z in chain.iter() {
      if self.block_slot[z].is_none() {
        self.block_slot[z] = Some(target);
        self.alias_of[z] = Some(targetBlock);
        if let SlotKind::Atomic { zero_length_preds, .. } =
          &mut self.slots[target].kind
        {
          zero_length_preds.push(z);
        }
        trace!("slot_for_block: {:?} aliases {:?}", z, targetBlock);
      }
    }
    target
  }

  // === END slot basics ===

  // === BEGIN connections ===

  fn record_edge(
    &mut self, owner: SlotIx, source: SlotIx, destination: SlotIx,
    flavor: SlotEdgeFlavor,
  ) {
    let dir = flavor & (SlotEdgeFlavor::INBOUND | SlotEdgeFlavor::OUTBOUND);
    let edges = &mut self.slots[owner].edges;
    for e in edges.iter_mut() {
      if e.source == source && e.destination == destination && e.flavor.contains(dir)
      {
        e.flavor = flavor;
        return;
      }
    }
    edges.push(SlotEdge { source, destination, flavor });
  }

  /// Connect two atomic slots.  Edges inside one top-level slot are dropped;
  /// re-adding an existing edge refreshes its internal/boundary flags on
  /// both endpoints.
  fn add_connection(&mut self, source: SlotIx, destination: SlotIx) {
    if self.cfg.blocks[self.block_of(destination)].is_handler {
      return;
    }
    let ts = self.top(source);
    let td = self.top(destination);
    if ts == td {
      return;
    }
    let mut internal = SlotEdgeFlavor::empty();
    if source != self.slots[ts].last {
      internal |= SlotEdgeFlavor::SOURCE_IS_INTERNAL;
    }
    if destination != self.slots[td].first {
      internal |= SlotEdgeFlavor::DESTINATION_IS_INTERNAL;
    }
    self.record_edge(ts, source, destination, SlotEdgeFlavor::OUTBOUND | internal);
    self.record_edge(td, source, destination, SlotEdgeFlavor::INBOUND | internal);
  }

  #[inline(never)]
  fn build_graph(&mut self) {
    let cfg = self.cfg;
    for &bix in self.st.pre_order.iter() {
      let s = self.slot_for_block(bix);
      for succ in cfg.normal_succs(bix) {
        if !self.st.is_reachable(succ) {
          continue;
        }
        let d = self.slot_for_block(succ);
        self.add_connection(s, d);
      }
    }
    debug!(
      "build_graph: {} blocks in {} atomic slots",
      self.st.num_reachable(),
      self.atomics.len()
    );
  }

  fn outbound(&self, s: SlotIx) -> impl Iterator<Item = &SlotEdge> {
    self.slots[s].edges.iter().filter(|e| e.flavor.contains(SlotEdgeFlavor::OUTBOUND))
  }

  fn inbound(&self, s: SlotIx) -> impl Iterator<Item = &SlotEdge> {
    self.slots[s].edges.iter().filter(|e| e.flavor.contains(SlotEdgeFlavor::INBOUND))
  }

  // === END connections ===

  // === BEGIN merging ===

  fn can_merge(&self, a: SlotIx, b: SlotIx) -> bool {
    a != b
      && self.is_top(a)
      && self.is_top(b)
      && self.slots[a].cold == self.slots[b].cold
  }

  /// Fix `a` immediately before `b`.  Both must be top-level.
  fn merge(&mut self, a: SlotIx, b: SlotIx, why: &str) -> SlotIx {
    debug_assert!(self.can_merge(a, b));
    let c = SlotIx::new(self.slots.len());
    let weight = self.slots[a].weight.max(self.slots[b].weight);
    let first = self.slots[a].first;
    let last = self.slots[b].last;
    let cold = self.slots[a].cold;
    self.slots.push(Slot {
      kind: SlotKind::Compound { left: a, right: b },
      weight,
      parent: None,
      first,
      last,
      cold,
      edges: SmallVec::new(),
      sched_index: None,
    });
    self.leader.push(Cell::new(c));
    self.slots[a].parent = Some(c);
    self.slots[b].parent = Some(c);
    self.leader[a.get() as usize].set(c);
    self.leader[b.get() as usize].set(c);
    self.top_levels.retain(|s| *s != a && *s != b);
    self.top_levels.push(c);

    let mut old = std::mem::take(&mut self.slots[a].edges);
    old.extend(std::mem::take(&mut self.slots[b].edges));
    for e in old {
      self.add_connection(e.source, e.destination);
    }
    self.num_merges += 1;
    trace!("merge ({}): {:?} + {:?} -> {:?}", why, a, b, c);
    c
  }

  // Is `s`, or anything containing it, in the set?
  fn in_set(&self, s: SlotIx, set: &SlotSet) -> bool {
    let mut cur = Some(s);
    while let Some(x) = cur {
      if set.contains(x) {
        return true;
      }
      cur = self.slots[x].parent;
    }
    false
  }

  /// If exactly one outbound edge of `s` leads into the set, the top-level
  /// slot it leads to.
  fn find_single_outbound(
    &self, s: SlotIx, set: &SlotSet, same_coldness: bool, boundary_only: bool,
  ) -> Option<SlotIx> {
    let mut res = None;
    for e in self.outbound(s) {
      if same_coldness && self.slots[e.destination].cold != self.slots[s].cold {
        continue;
      }
      if !self.in_set(e.destination, set) {
        continue;
      }
      if boundary_only && !e.is_boundary() {
        return None;
      }
      if res.is_some() {
        return None;
      }
      res = Some(e.destination);
    }
    res.map(|d| self.top(d))
  }

  /// If exactly one inbound edge of `s` comes from the set, the top-level
  /// slot it comes from.
  fn find_single_inbound(
    &self, s: SlotIx, set: &SlotSet, same_coldness: bool, boundary_only: bool,
  ) -> Option<SlotIx> {
    let mut res = None;
    for e in self.inbound(s) {
      if same_coldness && self.slots[e.source].cold != self.slots[s].cold {
        continue;
      }
      if !self.in_set(e.source, set) {
        continue;
      }
      if res.is_some() {
        return None;
      }
      if boundary_only && !e.is_boundary() {
        return None;
      }
      res = Some(e.source);
    }
    res.map(|src| self.top(src))
  }

  /// Top-level slots in the set, heaviest first.
  fn sorted_by_weight(&self, set: &SlotSet) -> Vec<SlotIx> {
    let mut res: Vec<SlotIx> =
      set.items.iter().cloned().filter(|s| self.is_top(*s)).collect();
    res.sort_by(|a, b| {
      self.slots[*b].weight.cmp(&self.slots[*a].weight).then(a.cmp(b))
    });
    res
  }

  /// Straight-line runs: `a`'s only boundary successor is `b`, and `b`'s
  /// only boundary predecessor is `a`.
  fn coalesce(&mut self, set: &SlotSet) -> bool {
    for &s in set.items.iter() {
      if !self.is_top(s) {
        continue;
      }
      if let Some(next) = self.find_single_outbound(s, set, true, true) {
        if self.find_single_inbound(next, set, true, true) == Some(s)
          && self.can_merge(s, next)
        {
          self.merge(s, next, "coalesce");
          return true;
        }
      }
    }
    false
  }

  /// Put a loop exit right after its only feeder.
  fn detect_loop_exit(&mut self, set: &SlotSet) -> bool {
    for &cold in [true, false].iter() {
      for s in self.sorted_by_weight(set) {
        if self.slots[s].cold != cold {
          continue;
        }
        let lastBlock = self.block_of(self.slots[s].last);
        if !self.loops.is_exit_point(lastBlock) {
          continue;
        }
        let mut preds = SmallVec::<[SlotIx; 4]>::new();
        for e in self.inbound(s) {
          if self.slots[e.source].cold != cold || !self.in_set(e.source, set) {
            continue;
          }
          let t = self.top(e.source);
          if t != s && !preds.contains(&t) {
            preds.push(t);
          }
        }
        if preds.len() == 1 && self.can_merge(preds[0], s) {
          self.merge(preds[0], s, "loop exit");
          return true;
        }
      }
    }
    false
  }

  // Exactly two outbound edges of the given coldness: their destinations'
  // top-level slots.
  fn binary_output(&self, s: SlotIx, cold: bool) -> Option<(SlotIx, SlotIx)> {
    let dests: SmallVec<[SlotIx; 4]> = self
      .outbound(s)
      .filter(|e| self.slots[e.destination].cold == cold)
      .map(|e| e.destination)
      .collect();
    if dests.len() == 2 {
      Some((self.top(dests[0]), self.top(dests[1])))
    } else {
      None
    }
  }

  // Exactly two inbound edges of the given coldness: their sources'
  // top-level slots.
  fn binary_input(&self, s: SlotIx, cold: bool) -> Option<(SlotIx, SlotIx)> {
    let srcs: SmallVec<[SlotIx; 4]> = self
      .inbound(s)
      .filter(|e| self.slots[e.source].cold == cold)
      .map(|e| e.source)
      .collect();
    if srcs.len() == 2 {
      Some((self.top(srcs[0]), self.top(srcs[1])))
    } else {
      None
    }
  }

  // if `a` then `b`; `b` continues into `c`, which is `a`'s other arm.
  fn try_linearize_if(
    &mut self, set: &SlotSet, a: SlotIx, b: SlotIx, c: SlotIx,
  ) -> bool {
    if a == b || b == c || a == c || !self.can_merge(a, b) {
      return false;
    }
    let cold = self.slots[a].cold;
    match self.binary_input(c, cold) {
      Some((x, y)) if (x == a && y == b) || (x == b && y == a) => {}
      _ => return false,
    }
    if self.find_single_inbound(b, set, true, false) != Some(a) {
      return false;
    }
    self.merge(a, b, "if-then");
    true
  }

  // if `a` then `b` else `c`, both arms continuing into the same slot.  The
  // if-block is merged with the heavier arm; on equal weights, with the arm
  // starting at the lower block index.
  fn try_linearize_if_then_else(
    &mut self, set: &SlotSet, a: SlotIx, b: SlotIx, c: SlotIx,
  ) -> bool {
    let thenOut = self.find_single_outbound(b, set, true, false);
    let elseOut = self.find_single_outbound(c, set, true, false);
    if thenOut.is_none() || thenOut != elseOut {
      return false;
    }
    let firstBlock = |s: SlotIx| self.block_of(self.slots[s].first);
    let arm = match self.slots[b].weight.cmp(&self.slots[c].weight) {
      std::cmp::Ordering::Greater => b,
      std::cmp::Ordering::Less => c,
      std::cmp::Ordering::Equal => {
        if firstBlock(b) <= firstBlock(c) {
          b
        } else {
          c
        }
      }
    };
    if !self.can_merge(a, arm) {
      return false;
    }
    self.merge(a, arm, "if-then-else");
    true
  }

  fn detect_if_block(&mut self, set: &SlotSet) -> bool {
    for &cold in [false, true].iter() {
      for s in self.sorted_by_weight(set) {
        if self.slots[s].cold != cold || !self.is_top(s) {
          continue;
        }
        let (t1, t2) = match self.binary_output(s, cold) {
          Some(pair) => pair,
          None => continue,
        };
        if !set.contains(t1) || !set.contains(t2) {
          continue;
        }
        if self.try_linearize_if(set, s, t1, t2)
          || self.try_linearize_if(set, s, t2, t1)
          || self.try_linearize_if_then_else(set, s, t1, t2)
        {
          return true;
        }
      }
    }
    false
  }

  fn order_in_set(&mut self, set: &SlotSet) -> bool {
    if set.len() <= 1 {
      return false;
    }
    self.detect_loop_exit(set) || self.detect_if_block(set) || self.coalesce(set)
  }

  fn order_in_loops(&mut self) -> bool {
    let loops = self.loops;
    for lix in loops.deepest_first() {
      let lp = loops.get(lix);
      for &cold in [false, true].iter() {
        let mut set = SlotSet::new();
        for m in lp.members.iter() {
          if let Some(s) = self.block_slot[m] {
            if self.slots[s].cold == cold {
              set.insert(self.top(s));
            }
          }
        }
        if self.order_in_set(&set) {
          return true;
        }
      }
    }
    false
  }

  #[inline(never)]
  fn order_basic_blocks(&mut self) {
    loop {
      let all = SlotSet::from_vec(&self.top_levels);
      if self.coalesce(&all) {
        continue;
      }
      if self.order_in_loops() {
        continue;
      }
      if self.order_in_set(&all) {
        continue;
      }
      break;
    }
    debug!(
      "order_basic_blocks: {} merges, {} top-level slots left",
      self.num_merges,
      self.top_levels.len()
    );
  }

  // === END merging ===

  // === BEGIN numbering ===

  fn is_scheduled(&self, top: SlotIx) -> bool {
    self.slots[self.slots[top].first].sched_index.is_some()
  }

  fn number_slot(&mut self, top: SlotIx, next: &mut u32) {
    for a in self.enumerate(top) {
      debug_assert!(self.slots[a].sched_index.is_none());
      self.slots[a].sched_index = Some(*next);
      *next += 1;
    }
  }

  // Number `top` if it belongs to this pass and all of its predecessors have
  // been seen.
  fn try_number_slot(
    &mut self, top: SlotIx, cold: bool, visited: &Set<SlotIx>, next: &mut u32,
  ) {
    if self.slots[top].cold != cold || self.is_scheduled(top) {
      return;
    }
    let ready = self.inbound(top).all(|e| visited.contains(self.top(e.source)));
    if ready {
      self.number_slot(top, next);
    }
  }

  #[inline(never)]
  fn assign_scheduling_index(&mut self) {
    let mut next = 0u32;
    for &cold in [false, true].iter() {
      let mut visited = Set::<SlotIx>::empty();
      let atomics = self.atomics.clone();
      for &atomic in atomics.iter() {
        let start = self.top(atomic);
        self.try_number_slot(start, cold, &visited, &mut next);
        if !visited.insert(start) {
          continue;
        }
        let mut stack = vec![(start, 0usize)];
        while let Some((s, pos)) = stack.last_mut() {
          let s = *s;
          let dest = self.outbound(s).nth(*pos).map(|e| e.destination);
          *pos += 1;
          let dest = match dest {
            Some(d) => self.top(d),
            None => {
              stack.pop();
              continue;
            }
          };
          self.try_number_slot(dest, cold, &visited, &mut next);
          if visited.insert(dest) {
            stack.push((dest, 0));
          }
        }
      }
      // Whatever is left sits on a cycle whose entry was reached before the
      // rest of the cycle.  By now everything has been visited.
      for &atomic in atomics.iter() {
        let top = self.top(atomic);
        if self.slots[top].cold == cold && !self.is_scheduled(top) {
          self.number_slot(top, &mut next);
        }
      }
    }
    debug!("assign_scheduling_index: {} slots numbered", next);
  }

  // === END numbering ===

  fn into_schedule(self) -> Result<Schedule, AnalysisError> {
    let nBlocks = self.cfg.num_blocks() as usize;
    let mut order = Vec::<(u32, BlockIx)>::new();
    let mut index = vec![None; nBlocks];
    let mut slot_cold = vec![false; nBlocks];
    let mut zero_length_preds = vec![Vec::new(); nBlocks];

    for &a in self.atomics.iter() {
      let idx = match self.slots[a].sched_index {
        Some(idx) => idx,
        None => {
          return Err(AnalysisError::InvariantViolation(format!(
            "slot {:?} was never scheduled",
            a
          )))
        }
      };
      if let SlotKind::Atomic { block, zero_length_preds: zs } = &self.slots[a].kind {
        order.push((idx, *block));
        index[block.get() as usize] = Some(idx);
        slot_cold[block.get() as usize] = self.slots[a].cold;
        zero_length_preds[block.get() as usize] = zs.to_vec();
        for z in zs.iter() {
          index[z.get() as usize] = Some(idx);
          slot_cold[z.get() as usize] = self.slots[a].cold;
        }
      }
    }
    order.sort();

    let mut tops: Vec<SlotIx> = self.top_levels.clone();
    tops.sort_by_key(|t| self.slots[self.slots[*t].first].sched_index);
    let groups = tops
      .iter()
      .map(|t| self.enumerate(*t).iter().map(|a| self.block_of(*a)).collect())
      .collect();

    Ok(Schedule {
      order: order.into_iter().map(|(_, b)| b).collect(),
      index,
      slot_cold,
      alias_of: self.alias_of.iter().cloned().collect(),
      zero_length_preds,
      groups,
    })
  }
}

//=============================================================================
// The result

/// The final block order of one function.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Schedule {
  /// Blocks owning a slot, in scheduling-index order.
  order: Vec<BlockIx>,
  /// Per block; zero-length blocks share the index of the block they alias.
  /// None for unreachable blocks.
  index: Vec<Option<u32>>,
  slot_cold: Vec<bool>,
  alias_of: Vec<Option<BlockIx>>,
  zero_length_preds: Vec<Vec<BlockIx>>,
  /// The blocks of each top-level slot, in order.
  groups: Vec<Vec<BlockIx>>,
}

impl Schedule {
  pub fn order(&self) -> &[BlockIx] {
    &self.order
  }

  pub fn scheduling_index(&self, bix: BlockIx) -> Option<u32> {
    self.index[bix.get() as usize]
  }

  pub fn is_scheduled(&self, bix: BlockIx) -> bool {
    self.scheduling_index(bix).is_some()
  }

  pub fn is_cold(&self, bix: BlockIx) -> bool {
    self.slot_cold[bix.get() as usize]
  }

  /// For a zero-length block, the block whose slot it shares.
  pub fn alias_of(&self, bix: BlockIx) -> Option<BlockIx> {
    self.alias_of[bix.get() as usize]
  }

  /// The block that owns `bix`'s slot: itself, or what it aliases.
  pub fn slot_block(&self, bix: BlockIx) -> BlockIx {
    self.alias_of(bix).unwrap_or(bix)
  }

  pub fn zero_length_predecessors(&self, bix: BlockIx) -> &[BlockIx] {
    &self.zero_length_preds[bix.get() as usize]
  }

  pub fn groups(&self) -> &[Vec<BlockIx>] {
    &self.groups
  }

  /// Does control leaving the end of `pre` arrive at the start of `post`
  /// without a branch?
  pub fn are_blocks_adjacent(&self, pre: BlockIx, post: BlockIx) -> bool {
    let target = self.slot_block(post);
    if let Some(t) = self.alias_of(pre) {
      return t == target;
    }
    match (self.scheduling_index(pre), self.scheduling_index(target)) {
      (Some(ip), Some(it)) => {
        it == ip + 1 && self.is_cold(pre) == self.is_cold(target)
      }
      _ => false,
    }
  }
}

/// Order the blocks of the function behind `analyses`.
#[inline(never)]
pub fn schedule<F: Function>(
  analyses: &AnalysisCache<F>, sizes: &TypedIxVec<BlockIx, u32>,
) -> Result<Schedule, AnalysisError> {
  debug!("schedule: begin ({})", analyses.func().name());
  let cfg = analyses.cfg();
  let st = analyses.spanning_tree();
  let loops = analyses.natural_loops()?;
  let cold = compute_cold_blocks(analyses.func(), cfg, st);

  let mut scheduler = Scheduler::new(cfg, st, loops, sizes, cold);
  scheduler.build_graph();
  scheduler.order_basic_blocks();
  scheduler.assign_scheduling_index();
  let res = scheduler.into_schedule()?;
  debug!("schedule: end, order {:?}", res.order());
  Ok(res)
}
