/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

#![allow(non_snake_case)]

//! Address assignment for code and data regions.
//!
//! A method's code is placed as at most two runs: its hot blocks, then its
//! cold blocks, each in scheduling order.  Each run is one allocation, so
//! blocks that the schedule calls adjacent really are adjacent in memory.

use log::{debug, trace};

use std::fmt;

use crate::data_structures::{BlockIx, RegionIx, TypedIxVec};
use crate::interface::{Encoder, Function};
use crate::linker_heap::{PlacementRequirements, SortedLinkerHeap};
use crate::region::Region;
use crate::scheduling::Schedule;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlacementError {
  /// No free range compatible with the requirements is big enough.  The
  /// image doesn't fit the target's memory map.
  OutOfMemory { what: String, size: u32, placement: PlacementRequirements },

  /// Somebody asked for the address of something that hasn't been placed.
  Unplaced { what: String },

  /// Zero-byte allocations would alias whatever comes next.
  EmptyAllocation { what: String },
}

impl fmt::Display for PlacementError {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      PlacementError::OutOfMemory { what, size, placement } => write!(
        fmt,
        "cannot allocate memory for {} ({} bytes, {:?})",
        what, size, placement
      ),
      PlacementError::Unplaced { what } => {
        write!(fmt, "{} has no address yet", what)
      }
      PlacementError::EmptyAllocation { what } => {
        write!(fmt, "refusing to place empty {}", what)
      }
    }
  }
}

/// Give a region that ended up with no bytes a filler, so it still owns an
/// address of its own.
pub fn fixup_empty_region<F: Function, E: Encoder<F>>(
  region: &mut Region, encoder: &E,
) {
  if region.is_empty() {
    encoder.fill_empty_region(region);
    trace!("fixup_empty_region: {} now {} bytes", region.context, region.size());
  }
}

/// Place `run` back to back in one allocation.  Returns the base address, or
/// None for an empty run.
pub fn place_contiguous(
  regions: &mut TypedIxVec<RegionIx, Region>, run: &[RegionIx],
  heap: &mut SortedLinkerHeap, placement: &PlacementRequirements, what: &str,
) -> Result<Option<u32>, PlacementError> {
  if run.is_empty() {
    return Ok(None);
  }
  let mut total = 0u32;
  for rix in run {
    let size = regions[*rix].size();
    if size == 0 {
      return Err(PlacementError::EmptyAllocation {
        what: regions[*rix].context.to_string(),
      });
    }
    total = total.checked_add(size).ok_or_else(|| PlacementError::OutOfMemory {
      what: what.to_string(),
      size: u32::MAX,
      placement: placement.clone(),
    })?;
  }

  let base = heap.allocate(total, 0, placement).ok_or_else(|| {
    PlacementError::OutOfMemory {
      what: what.to_string(),
      size: total,
      placement: placement.clone(),
    }
  })?;
  let mut address = base;
  for rix in run {
    regions[*rix].set_base_address(address);
    address += regions[*rix].size();
  }
  trace!("place_contiguous: {} at {:#x}..{:#x}", what, base, address);
  Ok(Some(base))
}

/// Pin a region at a fixed address, taking the span off the heap.
pub fn place_fixed(
  region: &mut Region, address: u32, heap: &mut SortedLinkerHeap,
) -> Result<(), PlacementError> {
  if region.is_empty() {
    return Err(PlacementError::EmptyAllocation { what: region.context.to_string() });
  }
  let end = address.checked_add(region.size()).ok_or_else(|| {
    PlacementError::OutOfMemory {
      what: region.context.to_string(),
      size: region.size(),
      placement: region.placement.clone(),
    }
  })?;
  heap.fixup_span(address, end);
  region.set_base_address(address);
  Ok(())
}

/// The blocks of one coldness class that own a region, in scheduling order.
pub fn code_run(
  schedule: &Schedule, block_regions: &TypedIxVec<BlockIx, Option<RegionIx>>,
  cold: bool,
) -> Vec<RegionIx> {
  schedule
    .order()
    .iter()
    .filter(|b| schedule.is_cold(**b) == cold)
    .filter_map(|b| block_regions[*b])
    .collect()
}

/// Place one method's hot or cold code.  The hot run may ask for extra
/// alignment, since it starts with the entry block.
#[inline(never)]
pub fn assign_code_addresses(
  schedule: &Schedule, block_regions: &TypedIxVec<BlockIx, Option<RegionIx>>,
  regions: &mut TypedIxVec<RegionIx, Region>, heap: &mut SortedLinkerHeap,
  cold: bool, entry_alignment: Option<u32>, what: &str,
) -> Result<(), PlacementError> {
  let run = code_run(schedule, block_regions, cold);
  if run.is_empty() {
    return Ok(());
  }
  let mut placement = regions[run[0]].placement.clone();
  if let (false, Some(align)) = (cold, entry_alignment) {
    placement.alignment = placement.alignment.max(align);
  }
  let what = format!("{} {} code", what, if cold { "cold" } else { "hot" });
  let base = place_contiguous(regions, &run, heap, &placement, &what)?;
  debug!(
    "assign_code_addresses: {}, {} regions at {:#x}",
    what,
    run.len(),
    base.unwrap_or(0)
  );
  Ok(())
}

/// The address of a block's code.  Zero-length blocks share the address of
/// the block they fall into.
pub fn block_address(
  schedule: &Schedule, block_regions: &TypedIxVec<BlockIx, Option<RegionIx>>,
  regions: &TypedIxVec<RegionIx, Region>, bix: BlockIx,
) -> Result<u32, PlacementError> {
  let owner = schedule.slot_block(bix);
  match block_regions[owner] {
    Some(rix) => regions[rix].address(),
    None => Err(PlacementError::Unplaced { what: format!("{:?}", bix) }),
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::analysis::AnalysisCache;
  use crate::data_structures::MethodIx;
  use crate::linker_heap::{MemoryAttributes, MemoryRange, MemoryUsage};
  use crate::region::RegionContext;
  use crate::scheduling::{estimate_block_sizes, schedule};
  use crate::test_graphs::{TestEncoder, TestGraph};

  fn flash() -> SortedLinkerHeap {
    SortedLinkerHeap::new(&[MemoryRange::new(
      0x1000,
      0x2000,
      MemoryAttributes::FLASH | MemoryAttributes::EXECUTE,
      MemoryUsage::CODE,
    )])
  }

  // One region per slot-owning block, filled the way TestEncoder would.
  fn emit(
    g: &TestGraph, s: &Schedule,
  ) -> (TypedIxVec<BlockIx, Option<RegionIx>>, TypedIxVec<RegionIx, Region>) {
    let mut block_regions =
      TypedIxVec::<BlockIx, Option<RegionIx>>::filled(g.succs.len() as u32, None);
    let mut regions = TypedIxVec::<RegionIx, Region>::new();
    for &bix in s.order() {
      let mut r = Region::new(
        RegionContext::Block { method: MethodIx::new(0), block: bix },
        PlacementRequirements::new(4, MemoryUsage::CODE),
      );
      r.cold = s.is_cold(bix);
      r.emit_bytes(&vec![0xAA; g.sizes[bix.get() as usize] as usize]);
      fixup_empty_region::<TestGraph, _>(&mut r, &TestEncoder);
      block_regions[bix] = Some(RegionIx::new(regions.len()));
      regions.push(r);
    }
    (block_regions, regions)
  }

  #[test]
  fn adjacent_blocks_get_adjacent_addresses() {
    let mut g = TestGraph::new(&[&[1, 2], &[3], &[3], &[4], &[]]);
    g.protect(1, 4, None);
    g.succs[3] = vec![];
    g.sizes = vec![8, 4, 12, 4, 4];
    let analyses = AnalysisCache::new(&g).unwrap();
    let s = schedule(&analyses, &estimate_block_sizes(&g, &TestEncoder)).unwrap();
    let (block_regions, mut regions) = emit(&g, &s);
    let mut heap = flash();
    for &cold in [false, true].iter() {
      assign_code_addresses(
        &s,
        &block_regions,
        &mut regions,
        &mut heap,
        cold,
        Some(16),
        "test",
      )
      .unwrap();
    }
    let order = s.order();
    for pair in order.windows(2) {
      if s.are_blocks_adjacent(pair[0], pair[1]) {
        let end = regions[block_regions[pair[0]].unwrap()].end_address().unwrap();
        let start = block_address(&s, &block_regions, &regions, pair[1]).unwrap();
        assert_eq!(end, start, "{:?} -> {:?}", pair[0], pair[1]);
      }
    }
    let entry = block_address(&s, &block_regions, &regions, BlockIx::new(0)).unwrap();
    assert_eq!(entry % 16, 0);
    assert!(heap.check().is_ok());
  }

  #[test]
  fn empty_regions_get_a_filler() {
    let mut g = TestGraph::new(&[&[1], &[2], &[]]);
    // Block 1 ends up empty, but owns a slot: it has two successors.
    g.succs[1] = vec![2, 0];
    g.sizes[1] = 0;
    let analyses = AnalysisCache::new(&g).unwrap();
    let s = schedule(&analyses, &estimate_block_sizes(&g, &TestEncoder)).unwrap();
    assert!(s.alias_of(BlockIx::new(1)).is_none());
    let (block_regions, mut regions) = emit(&g, &s);
    assert_eq!(regions[block_regions[BlockIx::new(1)].unwrap()].size(), 4);
    let mut heap = flash();
    assign_code_addresses(
      &s,
      &block_regions,
      &mut regions,
      &mut heap,
      false,
      None,
      "test",
    )
    .unwrap();
    let a = block_address(&s, &block_regions, &regions, BlockIx::new(1)).unwrap();
    let b = block_address(&s, &block_regions, &regions, BlockIx::new(2)).unwrap();
    assert_ne!(a, b);
  }

  #[test]
  fn zero_length_blocks_share_an_address() {
    let mut g = TestGraph::new(&[&[1], &[2], &[]]);
    g.sizes[1] = 0;
    let analyses = AnalysisCache::new(&g).unwrap();
    let s = schedule(&analyses, &estimate_block_sizes(&g, &TestEncoder)).unwrap();
    let (block_regions, mut regions) = emit(&g, &s);
    let mut heap = flash();
    assign_code_addresses(
      &s,
      &block_regions,
      &mut regions,
      &mut heap,
      false,
      None,
      "test",
    )
    .unwrap();
    assert_eq!(
      block_address(&s, &block_regions, &regions, BlockIx::new(1)),
      block_address(&s, &block_regions, &regions, BlockIx::new(2))
    );
    assert_eq!(
      block_address(&s, &block_regions, &regions, BlockIx::new(0)),
      Ok(0x1000)
    );
  }

  #[test]
  fn out_of_memory_names_the_culprit() {
    let mut g = TestGraph::new(&[&[1], &[]]);
    g.sizes = vec![0x800, 0x900];
    let analyses = AnalysisCache::new(&g).unwrap();
    let s = schedule(&analyses, &estimate_block_sizes(&g, &TestEncoder)).unwrap();
    let (block_regions, mut regions) = emit(&g, &s);
    let mut heap = flash();
    let err = assign_code_addresses(
      &s,
      &block_regions,
      &mut regions,
      &mut heap,
      false,
      None,
      "method f",
    )
    .unwrap_err();
    match err {
      PlacementError::OutOfMemory { what, size, .. } => {
        assert_eq!(what, "method f hot code");
        assert_eq!(size, 0x1100);
      }
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn fixed_regions_come_off_the_heap() {
    let mut heap = flash();
    let mut r = Region::new(
      RegionContext::Data { name: "vectors".to_string() },
      PlacementRequirements::new(4, MemoryUsage::CODE),
    );
    r.emit_bytes(&[1; 0x20]);
    place_fixed(&mut r, 0x1000, &mut heap).unwrap();
    assert_eq!(r.address(), Ok(0x1000));
    let pr = PlacementRequirements::new(4, MemoryUsage::CODE);
    assert_eq!(heap.allocate(4, 0, &pr), Some(0x1020));
  }
}
