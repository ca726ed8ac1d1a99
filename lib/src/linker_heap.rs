/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

#![allow(non_snake_case)]

//! The linker heap: the target's memory map as a sorted list of tagged
//! ranges, each either free or allocated.  Regions get their addresses by
//! carving allocated pieces out of free ranges.

use bitflags::bitflags;
use log::{debug, trace, warn};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

bitflags! {
  /// What kind of memory a range is.
  #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
  #[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
  pub struct MemoryAttributes: u32 {
    const RAM = 1 << 0;
    const FLASH = 1 << 1;
    const ROM = 1 << 2;
    const READ = 1 << 3;
    const WRITE = 1 << 4;
    const EXECUTE = 1 << 5;
    /// Already in place when the image starts running, so never relocated.
    const LOADED_AT_ENTRYPOINT = 1 << 6;
    /// Set on heap ranges that have been handed out.
    const ALLOCATED = 1 << 15;
  }
}

bitflags! {
  /// What a range may be used for.
  #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
  #[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
  pub struct MemoryUsage: u32 {
    const CODE = 1 << 0;
    const DATA = 1 << 1;
    const STACK = 1 << 2;
    const HEAP = 1 << 3;
    /// Holds the relocation records themselves; never relocated.
    const RELOCATION = 1 << 4;
    const BOOTSTRAP = 1 << 5;
  }
}

/// A range of the declared memory map, `[start, end)`.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct MemoryRange {
  pub start: u32,
  pub end: u32,
  pub section: Option<String>,
  pub attributes: MemoryAttributes,
  pub usage: MemoryUsage,
}

impl MemoryRange {
  pub fn new(
    start: u32, end: u32, attributes: MemoryAttributes, usage: MemoryUsage,
  ) -> Self {
    MemoryRange { start, end, section: None, attributes, usage }
  }

  pub fn with_section(mut self, section: &str) -> Self {
    self.section = Some(section.to_string());
    self
  }

  pub fn contains(&self, address: u32) -> bool {
    self.start <= address && address < self.end
  }
}

/// Where something may be placed.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct PlacementRequirements {
  /// Zero and one both mean "no alignment".
  pub alignment: u32,
  /// Extra distance from the start of the allocation to the aligned point.
  pub alignment_offset: u32,
  pub allocate_from_high_address: bool,
  /// If set, only ranges of this section qualify.
  pub section: Option<String>,
  /// Ranges must allow at least one of these usages.
  pub usage: MemoryUsage,
  /// Ranges must carry all of these attributes.
  pub attributes: MemoryAttributes,
}

impl PlacementRequirements {
  pub fn new(alignment: u32, usage: MemoryUsage) -> Self {
    PlacementRequirements {
      alignment,
      alignment_offset: 0,
      allocate_from_high_address: false,
      section: None,
      usage,
      attributes: MemoryAttributes::empty(),
    }
  }

  pub fn is_compatible(
    &self, section: &Option<String>, attributes: MemoryAttributes,
    usage: MemoryUsage,
  ) -> bool {
    if self.section.is_some() && self.section != *section {
      return false;
    }
    let wanted = self.attributes - MemoryAttributes::ALLOCATED;
    if !attributes.contains(wanted) {
      return false;
    }
    self.usage.is_empty() || self.usage.intersects(usage)
  }
}

/// One entry of the heap.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct HeapRange {
  pub start: u32,
  pub end: u32,
  pub section: Option<String>,
  pub attributes: MemoryAttributes,
  pub usage: MemoryUsage,
}

impl HeapRange {
  fn from_memory_range(rng: &MemoryRange) -> Self {
    HeapRange {
      start: rng.start,
      end: rng.end,
      section: rng.section.clone(),
      attributes: rng.attributes - MemoryAttributes::ALLOCATED,
      usage: rng.usage,
    }
  }

  fn to_memory_range(&self) -> MemoryRange {
    MemoryRange {
      start: self.start,
      end: self.end,
      section: self.section.clone(),
      attributes: self.attributes,
      usage: self.usage,
    }
  }

  fn slice_as_allocated(&self, start: u32, end: u32) -> Self {
    HeapRange {
      start,
      end,
      section: self.section.clone(),
      attributes: self.attributes | MemoryAttributes::ALLOCATED,
      usage: self.usage,
    }
  }

  fn slice_as_free(&self, start: u32, end: u32) -> Self {
    HeapRange {
      start,
      end,
      section: self.section.clone(),
      attributes: self.attributes - MemoryAttributes::ALLOCATED,
      usage: self.usage,
    }
  }

  pub fn is_allocated(&self) -> bool {
    self.attributes.contains(MemoryAttributes::ALLOCATED)
  }

  pub fn len(&self) -> u32 {
    self.end - self.start
  }

  fn same_tags(&self, other: &HeapRange) -> bool {
    self.section == other.section
      && self.attributes == other.attributes
      && self.usage == other.usage
  }

  // Could `self`, an allocated neighbour, absorb an allocation carved out of
  // the free range `rng`?
  fn absorbs_allocation_from(&self, rng: &HeapRange) -> bool {
    self.section == rng.section
      && self.attributes == (rng.attributes | MemoryAttributes::ALLOCATED)
      && self.usage == rng.usage
  }
}

fn align_up(x: u32, alignment: u32) -> Option<u32> {
  if alignment <= 1 {
    return Some(x);
  }
  let rem = x % alignment;
  if rem == 0 {
    Some(x)
  } else {
    x.checked_add(alignment - rem)
  }
}

fn align_down(x: u32, alignment: u32) -> u32 {
  if alignment <= 1 {
    x
  } else {
    x - x % alignment
  }
}

#[derive(Clone, Debug)]
pub struct SortedLinkerHeap {
  ranges: Vec<HeapRange>,
}

impl SortedLinkerHeap {
  pub fn new(memory: &[MemoryRange]) -> Self {
    let mut heap = SortedLinkerHeap { ranges: Vec::new() };
    heap.import(memory);
    heap
  }

  pub fn ranges(&self) -> &[HeapRange] {
    &self.ranges
  }

  // Insert the declared ranges in address order.  Adjacent ranges with
  // identical tags become one; overlaps are clipped off the later range.
  fn import(&mut self, memory: &[MemoryRange]) {
    let mut sorted: Vec<HeapRange> = memory
      .iter()
      .filter(|r| r.start < r.end)
      .map(HeapRange::from_memory_range)
      .collect();
    sorted.sort_by_key(|r| r.start);

    for mut rng in sorted {
      if let Some(prev) = self.ranges.last_mut() {
        if rng.start < prev.end {
          warn!(
            "SortedLinkerHeap: memory range {:#x}..{:#x} overlaps {:#x}..{:#x}",
            rng.start, rng.end, prev.start, prev.end
          );
          if rng.end <= prev.end {
            continue;
          }
          rng.start = prev.end;
        }
        if prev.end == rng.start && prev.same_tags(&rng) {
          prev.end = rng.end;
          continue;
        }
      }
      self.ranges.push(rng);
    }
    debug!("SortedLinkerHeap: imported {} ranges", self.ranges.len());
  }

  /// Reserve `size` bytes, such that the address `offset` bytes past the
  /// start (plus the requirements' own alignment offset) is aligned.  First
  /// fit over the compatible free ranges, in address order.  None if nothing
  /// fits.
  pub fn allocate(
    &mut self, size: u32, offset: u32, pr: &PlacementRequirements,
  ) -> Option<u32> {
    if size == 0 {
      return None;
    }
    let offsetForAlignment = offset.checked_add(pr.alignment_offset)?;
    let sizeForAlignment = size.checked_sub(offsetForAlignment)?;

    for pos in 0..self.ranges.len() {
      let rng = &self.ranges[pos];
      if rng.is_allocated()
        || !pr.is_compatible(&rng.section, rng.attributes, rng.usage)
      {
        continue;
      }
      if rng.len() < size {
        continue;
      }

      let ptrStart = if pr.allocate_from_high_address {
        align_down(rng.end - sizeForAlignment, pr.alignment)
      } else {
        match rng.start.checked_add(offsetForAlignment) {
          Some(p) => match align_up(p, pr.alignment) {
            Some(p) => p,
            None => continue,
          },
          None => continue,
        }
      };
      let address = match ptrStart.checked_sub(offsetForAlignment) {
        Some(a) => a,
        None => continue,
      };
      let ptrEnd = match ptrStart.checked_add(sizeForAlignment) {
        Some(e) => e,
        None => continue,
      };

      if address >= rng.start && ptrEnd <= rng.end {
        trace!(
          "SortedLinkerHeap::allocate: {} bytes at {:#x} from {:#x}..{:#x}",
          size,
          address,
          rng.start,
          rng.end
        );
        self.extract_chunk(pos, address, ptrEnd);
        return Some(address);
      }
    }
    None
  }

  // Mark `[start, end)` of the free range at `pos` as allocated.
  fn extract_chunk(&mut self, pos: usize, start: u32, end: u32) {
    let rng = self.ranges[pos].clone();
    debug_assert!(rng.start <= start && end <= rng.end && start < end);

    let mergePrev = pos > 0 && {
      let prev = &self.ranges[pos - 1];
      prev.end == rng.start && prev.absorbs_allocation_from(&rng)
    };
    let mergeNext = pos + 1 < self.ranges.len() && {
      let next = &self.ranges[pos + 1];
      next.start == rng.end && next.absorbs_allocation_from(&rng)
    };
    let flushToBottom = start == rng.start;
    let flushToTop = end == rng.end;

    if flushToBottom && flushToTop {
      // The whole range goes.
      self.ranges[pos].attributes |= MemoryAttributes::ALLOCATED;
      if mergeNext {
        self.ranges[pos].end = self.ranges[pos + 1].end;
        self.ranges.remove(pos + 1);
      }
      if mergePrev {
        self.ranges[pos - 1].end = self.ranges[pos].end;
        self.ranges.remove(pos);
      }
    } else if flushToBottom {
      if mergePrev {
        self.ranges[pos - 1].end = end;
      } else {
        self.ranges.insert(pos, rng.slice_as_allocated(start, end));
      }
      let at = if mergePrev { pos } else { pos + 1 };
      self.ranges[at].start = end;
    } else if flushToTop {
      if mergeNext {
        self.ranges[pos + 1].start = start;
      } else {
        self.ranges.insert(pos + 1, rng.slice_as_allocated(start, end));
      }
      self.ranges[pos].end = start;
    } else {
      self.ranges[pos].end = start;
      self.ranges.insert(pos + 1, rng.slice_as_allocated(start, end));
      self.ranges.insert(pos + 2, rng.slice_as_free(end, rng.end));
    }
  }

  /// Mark every free byte of `[start, end)` as allocated, across as many
  /// ranges as it touches.
  pub fn fixup_span(&mut self, start: u32, end: u32) {
    let mut pos = 0;
    while pos < self.ranges.len() {
      let rng = &self.ranges[pos];
      if !rng.is_allocated() {
        let from = rng.start.max(start);
        let to = rng.end.min(end);
        if from < to {
          self.extract_chunk(pos, from, to);
          // The list changed shape under us; start over.
          pos = 0;
          continue;
        }
      }
      pos += 1;
    }
  }

  /// Reset to the declared memory map, then mark the spans already taken by
  /// placed regions.  `spans` must be sorted by start address.
  pub fn rebuild_from_regions(
    &mut self, memory: &[MemoryRange], spans: &[(u32, u32)],
  ) {
    self.ranges.clear();
    self.import(memory);

    let mut group: Option<(u32, u32)> = None;
    for &(start, end) in spans {
      group = match group {
        Some((gs, ge)) if ge >= start => Some((gs, ge.max(end))),
        Some((gs, ge)) => {
          self.fixup_span(gs, ge);
          Some((start, end))
        }
        None => Some((start, end)),
      };
    }
    if let Some((gs, ge)) = group {
      self.fixup_span(gs, ge);
    }
  }

  /// The final state of memory, allocated ranges flagged as such.
  pub fn commit(&self) -> Vec<MemoryRange> {
    self.ranges.iter().map(|r| r.to_memory_range()).collect()
  }

  pub fn free_bytes(&self) -> u64 {
    self.ranges.iter().filter(|r| !r.is_allocated()).map(|r| r.len() as u64).sum()
  }

  /// Sorted, non-empty, non-overlapping and maximally coalesced.
  pub fn check(&self) -> Result<(), String> {
    for rng in self.ranges.iter() {
      if rng.start >= rng.end {
        return Err(format!("empty range {:#x}..{:#x}", rng.start, rng.end));
      }
    }
    for pair in self.ranges.windows(2) {
      let (a, b) = (&pair[0], &pair[1]);
      if a.end > b.start {
        return Err(format!(
          "ranges {:#x}..{:#x} and {:#x}..{:#x} overlap or are unsorted",
          a.start, a.end, b.start, b.end
        ));
      }
      if a.end == b.start && a.same_tags(b) {
        return Err(format!(
          "ranges {:#x}..{:#x} and {:#x}..{:#x} should have been merged",
          a.start, a.end, b.start, b.end
        ));
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn code_flash(start: u32, end: u32) -> MemoryRange {
    MemoryRange::new(
      start,
      end,
      MemoryAttributes::FLASH | MemoryAttributes::READ | MemoryAttributes::EXECUTE,
      MemoryUsage::CODE,
    )
  }

  fn data_ram(start: u32, end: u32) -> MemoryRange {
    MemoryRange::new(
      start,
      end,
      MemoryAttributes::RAM | MemoryAttributes::READ | MemoryAttributes::WRITE,
      MemoryUsage::DATA,
    )
  }

  fn code(alignment: u32) -> PlacementRequirements {
    PlacementRequirements::new(alignment, MemoryUsage::CODE)
  }

  #[test]
  fn import_sorts_and_coalesces() {
    let heap = SortedLinkerHeap::new(&[
      data_ram(0x2000, 0x3000),
      code_flash(0x100, 0x200),
      code_flash(0x0, 0x100),
    ]);
    let starts: Vec<(u32, u32)> =
      heap.ranges().iter().map(|r| (r.start, r.end)).collect();
    assert_eq!(starts, vec![(0x0, 0x200), (0x2000, 0x3000)]);
    assert!(heap.check().is_ok());
  }

  #[test]
  fn first_fit_from_low_addresses() {
    let mut heap = SortedLinkerHeap::new(&[code_flash(0x100, 0x200)]);
    assert_eq!(heap.allocate(0x10, 0, &code(4)), Some(0x100));
    // Lands right after the first and merges with it.
    assert_eq!(heap.allocate(0x8, 0, &code(4)), Some(0x110));
    assert_eq!(heap.ranges().len(), 2);
    assert_eq!(heap.ranges()[0].end, 0x118);
    assert!(heap.ranges()[0].is_allocated());
    assert!(heap.check().is_ok());
  }

  #[test]
  fn alignment_leaves_a_gap() {
    let mut heap = SortedLinkerHeap::new(&[code_flash(0x102, 0x200)]);
    assert_eq!(heap.allocate(4, 0, &code(16)), Some(0x110));
    let shape: Vec<(u32, u32, bool)> = heap
      .ranges()
      .iter()
      .map(|r| (r.start, r.end, r.is_allocated()))
      .collect();
    assert_eq!(
      shape,
      vec![(0x102, 0x110, false), (0x110, 0x114, true), (0x114, 0x200, false)]
    );
  }

  #[test]
  fn offset_aligns_an_interior_point() {
    let mut heap = SortedLinkerHeap::new(&[data_ram(0x1000, 0x2000)]);
    let pr = PlacementRequirements::new(16, MemoryUsage::DATA);
    // An object with an 8-byte header whose body must be 16-aligned.
    let address = heap.allocate(40, 8, &pr).unwrap();
    assert_eq!((address + 8) % 16, 0);
    assert!(address >= 0x1000);
  }

  #[test]
  fn high_addresses_first() {
    let mut heap = SortedLinkerHeap::new(&[data_ram(0x1000, 0x2000)]);
    let mut pr = PlacementRequirements::new(8, MemoryUsage::DATA);
    pr.allocate_from_high_address = true;
    assert_eq!(heap.allocate(0x20, 0, &pr), Some(0x1fe0));
    assert_eq!(heap.allocate(0x18, 0, &pr), Some(0x1fc8));
    assert!(heap.check().is_ok());
    let last = heap.ranges().last().unwrap();
    assert!(last.is_allocated());
    assert_eq!((last.start, last.end), (0x1fc8, 0x2000));
  }

  #[test]
  fn incompatible_ranges_are_skipped() {
    let mut heap = SortedLinkerHeap::new(&[
      data_ram(0x0, 0x1000),
      code_flash(0x8000, 0x9000).with_section("text"),
    ]);
    assert_eq!(heap.allocate(4, 0, &code(4)), Some(0x8000));
    let mut pr = code(4);
    pr.section = Some("boot".to_string());
    assert_eq!(heap.allocate(4, 0, &pr), None);
    pr.section = Some("text".to_string());
    pr.attributes = MemoryAttributes::EXECUTE;
    assert_eq!(heap.allocate(4, 0, &pr), Some(0x8004));
  }

  #[test]
  fn exhaustion_and_empty_requests_fail() {
    let mut heap = SortedLinkerHeap::new(&[code_flash(0x0, 0x10)]);
    assert_eq!(heap.allocate(0, 0, &code(4)), None);
    assert_eq!(heap.allocate(0x11, 0, &code(4)), None);
    assert_eq!(heap.allocate(0x10, 0, &code(4)), Some(0));
    assert_eq!(heap.allocate(1, 0, &code(1)), None);
    assert_eq!(heap.free_bytes(), 0);
  }

  #[test]
  fn whole_range_merges_both_neighbours() {
    let mut heap = SortedLinkerHeap::new(&[code_flash(0x0, 0x30)]);
    assert_eq!(heap.allocate(0x10, 0, &code(1)), Some(0x0));
    let mut pr = code(1);
    pr.allocate_from_high_address = true;
    assert_eq!(heap.allocate(0x10, 0, &pr), Some(0x20));
    assert_eq!(heap.ranges().len(), 3);
    assert_eq!(heap.allocate(0x10, 0, &code(1)), Some(0x10));
    assert_eq!(heap.ranges().len(), 1);
    assert!(heap.ranges()[0].is_allocated());
    assert!(heap.check().is_ok());
  }

  #[test]
  fn fixup_span_crosses_ranges() {
    let mut heap = SortedLinkerHeap::new(&[
      code_flash(0x0, 0x100),
      data_ram(0x100, 0x200),
    ]);
    heap.fixup_span(0x80, 0x180);
    let shape: Vec<(u32, u32, bool)> = heap
      .ranges()
      .iter()
      .map(|r| (r.start, r.end, r.is_allocated()))
      .collect();
    assert_eq!(
      shape,
      vec![
        (0x0, 0x80, false),
        (0x80, 0x100, true),
        (0x100, 0x180, true),
        (0x180, 0x200, false)
      ]
    );
    assert!(heap.check().is_ok());
  }

  #[test]
  fn rebuild_matches_the_original_allocations() {
    let memory = vec![code_flash(0x0, 0x1000)];
    let mut heap = SortedLinkerHeap::new(&memory);
    let a = heap.allocate(0x10, 0, &code(16)).unwrap();
    let b = heap.allocate(0x4, 0, &code(16)).unwrap();
    let c = heap.allocate(0x20, 0, &code(16)).unwrap();
    let mut rebuilt = SortedLinkerHeap::new(&[]);
    rebuilt.rebuild_from_regions(
      &memory,
      &[(a, a + 0x10), (b, b + 0x4), (c, c + 0x20)],
    );
    assert!(rebuilt.check().is_ok());
    let allocated = |h: &SortedLinkerHeap| -> Vec<(u32, u32)> {
      h.ranges()
        .iter()
        .filter(|r| r.is_allocated())
        .map(|r| (r.start, r.end))
        .collect()
    };
    assert_eq!(allocated(&rebuilt), allocated(&heap));
  }

  #[test]
  fn many_allocations_never_overlap() {
    let mut heap = SortedLinkerHeap::new(&[
      code_flash(0x0, 0x4000),
      data_ram(0x4000, 0x6000),
      code_flash(0x8000, 0x9000),
    ]);
    let mut seed = 12345u32;
    let mut taken = Vec::<(u32, u32)>::new();
    for _ in 0..300 {
      seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
      let size = 1 + (seed >> 16) % 64;
      let mut pr = if seed & 1 == 0 {
        code(1 << ((seed >> 8) % 5))
      } else {
        PlacementRequirements::new(4, MemoryUsage::DATA)
      };
      pr.allocate_from_high_address = seed & 2 != 0;
      if let Some(a) = heap.allocate(size, 0, &pr) {
        for &(s, e) in taken.iter() {
          assert!(a + size <= s || e <= a, "{:#x} overlaps {:#x}..{:#x}", a, s, e);
        }
        taken.push((a, a + size));
      }
      assert_eq!(heap.check(), Ok(()));
    }
    assert!(!taken.is_empty());
  }
}
