/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Regions: the addressable pieces of the image.  A region holds the encoded
//! bytes of one block or one data item, the annotations that still need
//! patching once addresses are known, and, once placed, its base address.

use log::trace;

use std::fmt;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

use crate::data_structures::{BlockIx, InstIx, MethodIx, RegionIx};
use crate::linker_heap::{PlacementRequirements, SortedLinkerHeap};
use crate::placement::PlacementError;

/// What a region holds.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum RegionContext {
  Block { method: MethodIx, block: BlockIx },
  Data { name: String },
}

impl fmt::Display for RegionContext {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      RegionContext::Block { method, block } => {
        write!(fmt, "{:?} of method {:?}", block, method)
      }
      RegionContext::Data { name } => write!(fmt, "data '{}'", name),
    }
  }
}

/// What an annotation's address refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum RelocTarget {
  /// The first byte of a block's code.
  Block { method: MethodIx, block: BlockIx },
  /// The address a region is referred to by: its base plus its pointer
  /// offset.
  Region(RegionIx),
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum AnnotationKind {
  /// The 32-bit word at the annotation holds `target + addend`.
  Absolute { target: RelocTarget, addend: i32 },
  /// The low `bits` bits of the word at the annotation hold the signed byte
  /// distance from the annotation to the target.  When that doesn't fit,
  /// the instruction in `origin` has to be re-encoded at a higher level.
  Relative { target: RelocTarget, bits: u8, origin: Option<(MethodIx, InstIx)> },
  /// Marks an offset for diagnostics; patches nothing.
  Marker { label: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Annotation {
  pub offset: u32,
  pub size: u32,
  pub kind: AnnotationKind,
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Region {
  pub context: RegionContext,
  pub placement: PlacementRequirements,
  pub cold: bool,
  /// Distance from the start of the region to the address that refers to
  /// it, e.g. past an object header.
  pub pointer_offset: u32,
  base_address: Option<u32>,
  payload: Vec<u8>,
  // Sorted by offset.
  annotations: Vec<Annotation>,
}

impl Region {
  pub fn new(context: RegionContext, placement: PlacementRequirements) -> Self {
    Region {
      context,
      placement,
      cold: false,
      pointer_offset: 0,
      base_address: None,
      payload: Vec::new(),
      annotations: Vec::new(),
    }
  }

  // === BEGIN payload ===

  pub fn emit_u8(&mut self, value: u8) {
    self.payload.push(value);
  }

  pub fn emit_u16(&mut self, value: u16) {
    self.payload.extend_from_slice(&value.to_le_bytes());
  }

  pub fn emit_u32(&mut self, value: u32) {
    self.payload.extend_from_slice(&value.to_le_bytes());
  }

  pub fn emit_bytes(&mut self, bytes: &[u8]) {
    self.payload.extend_from_slice(bytes);
  }

  /// Pad with zeroes up to a multiple of `alignment`.
  pub fn align(&mut self, alignment: u32) {
    if alignment > 1 {
      while self.payload.len() as u32 % alignment != 0 {
        self.payload.push(0);
      }
    }
  }

  pub fn size(&self) -> u32 {
    self.payload.len() as u32
  }

  pub fn is_empty(&self) -> bool {
    self.payload.is_empty()
  }

  pub fn payload(&self) -> &[u8] {
    &self.payload
  }

  pub fn read_u32(&self, offset: u32) -> Option<u32> {
    let at = offset as usize;
    let bytes = self.payload.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
  }

  /// Overwrite the word at `offset`.  False if it lies outside the payload.
  pub fn patch_u32(&mut self, offset: u32, value: u32) -> bool {
    let at = offset as usize;
    match self.payload.get_mut(at..at + 4) {
      Some(bytes) => {
        bytes.copy_from_slice(&value.to_le_bytes());
        true
      }
      None => false,
    }
  }

  // === END payload ===

  /// Record an annotation at `offset`, keeping them sorted.
  pub fn annotate(&mut self, offset: u32, size: u32, kind: AnnotationKind) {
    let pos = self.annotations.partition_point(|a| a.offset <= offset);
    self.annotations.insert(pos, Annotation { offset, size, kind });
  }

  pub fn annotations(&self) -> &[Annotation] {
    &self.annotations
  }

  // === BEGIN addresses ===

  pub fn base_address(&self) -> Option<u32> {
    self.base_address
  }

  pub fn is_placed(&self) -> bool {
    self.base_address.is_some()
  }

  pub fn set_base_address(&mut self, address: u32) {
    self.base_address = Some(address);
  }

  pub fn address(&self) -> Result<u32, PlacementError> {
    self
      .base_address
      .ok_or_else(|| PlacementError::Unplaced { what: self.context.to_string() })
  }

  pub fn end_address(&self) -> Result<u32, PlacementError> {
    Ok(self.address()? + self.size())
  }

  /// The address other code uses to refer to this region.
  pub fn pointer_address(&self) -> Result<u32, PlacementError> {
    Ok(self.address()? + self.pointer_offset)
  }

  pub fn contains_address(&self, address: u32) -> bool {
    match self.base_address {
      Some(base) => base <= address && address < base + self.size(),
      None => false,
    }
  }

  /// Reserve room for this region on the heap and take the address.
  pub fn assign_absolute_address(
    &mut self, heap: &mut SortedLinkerHeap,
  ) -> Result<u32, PlacementError> {
    if self.is_empty() {
      return Err(PlacementError::EmptyAllocation { what: self.context.to_string() });
    }
    match heap.allocate(self.size(), self.pointer_offset, &self.placement) {
      Some(address) => {
        trace!("Region: {} at {:#x}, {} bytes", self.context, address, self.size());
        self.base_address = Some(address);
        Ok(address)
      }
      None => Err(PlacementError::OutOfMemory {
        what: self.context.to_string(),
        size: self.size(),
        placement: self.placement.clone(),
      }),
    }
  }

  // === END addresses ===

  /// Forget the contents and the address, ready to be emitted again.
  pub fn clear(&mut self) {
    self.payload.clear();
    self.annotations.clear();
    self.base_address = None;
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::linker_heap::{MemoryAttributes, MemoryRange, MemoryUsage};

  fn data_region(name: &str) -> Region {
    Region::new(
      RegionContext::Data { name: name.to_string() },
      PlacementRequirements::new(4, MemoryUsage::DATA),
    )
  }

  #[test]
  fn payload_is_little_endian() {
    let mut r = data_region("x");
    r.emit_u8(1);
    r.emit_u16(0x0302);
    r.align(4);
    r.emit_u32(0x0807_0605);
    assert_eq!(r.payload(), &[1, 2, 3, 0, 5, 6, 7, 8]);
    assert_eq!(r.read_u32(4), Some(0x0807_0605));
    assert!(r.patch_u32(0, 0xdead_beef));
    assert_eq!(r.read_u32(0), Some(0xdead_beef));
    assert!(!r.patch_u32(6, 0));
    assert_eq!(r.read_u32(6), None);
  }

  #[test]
  fn annotations_stay_sorted() {
    let mut r = data_region("x");
    let marker = |l: &str| AnnotationKind::Marker { label: l.to_string() };
    r.annotate(8, 0, marker("c"));
    r.annotate(0, 0, marker("a"));
    r.annotate(4, 0, marker("b"));
    r.annotate(4, 0, marker("b2"));
    let offsets: Vec<u32> = r.annotations().iter().map(|a| a.offset).collect();
    assert_eq!(offsets, vec![0, 4, 4, 8]);
    assert_eq!(r.annotations()[2].kind, marker("b2"));
  }

  #[test]
  fn placement_errors() {
    let mut heap = SortedLinkerHeap::new(&[MemoryRange::new(
      0x100,
      0x108,
      MemoryAttributes::RAM,
      MemoryUsage::DATA,
    )]);
    let mut r = data_region("small");
    assert_eq!(
      r.assign_absolute_address(&mut heap),
      Err(PlacementError::EmptyAllocation { what: "data 'small'".to_string() })
    );
    assert!(r.address().is_err());
    r.emit_u32(7);
    r.pointer_offset = 4;
    assert_eq!(r.assign_absolute_address(&mut heap), Ok(0x100));
    assert_eq!(r.pointer_address(), Ok(0x104));
    assert!(r.contains_address(0x103));
    assert!(!r.contains_address(0x104));

    let mut big = data_region("big");
    big.emit_bytes(&[0; 8]);
    match big.assign_absolute_address(&mut heap) {
      Err(PlacementError::OutOfMemory { size, .. }) => assert_eq!(size, 8),
      other => panic!("unexpected {:?}", other),
    }
  }
}
