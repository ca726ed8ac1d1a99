/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

#![allow(non_snake_case)]

//! The whole-image driver.
//!
//! Every method is analysed and scheduled once.  Then, as often as needed:
//! emit all code and data into regions, place them, and patch the
//! relocations.  A PC-relative reference that doesn't reach its target
//! bumps the encoding level of the instruction that made it, and the image
//! is emitted again from scratch.  Once a round goes through cleanly, the
//! regions are collected into the final image, and the relocation records,
//! exception maps and code maps are derived from it.

use log::{debug, info, trace};

use std::fmt;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

use crate::analysis::{AnalysisCache, AnalysisLock};
use crate::data_structures::{
  BlockIx, InstIx, Map, MethodIx, RegionIx, TypedIxVec,
};
use crate::exception_map::{ExceptionMap, HandlerEntry};
use crate::interface::{Encoder, Function, LayoutError, LayoutOptions, Platform};
use crate::linker_heap::{
  MemoryAttributes, MemoryRange, MemoryUsage, PlacementRequirements,
  SortedLinkerHeap,
};
use crate::placement::{
  assign_code_addresses, block_address, fixup_empty_region, place_fixed,
};
use crate::region::{AnnotationKind, Region, RegionContext, RelocTarget};
use crate::relocation::{self, RelocationRecord};
use crate::scheduling::{estimate_block_sizes, schedule, Schedule};

//=============================================================================
// Errors

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageError {
  /// Two regions overlap and disagree about the bytes at `address`.
  Inconsistency { address: u32 },

  /// A reference names something that doesn't exist or was never placed.
  UnresolvedTarget { what: String },

  /// An instruction needs a longer encoding than the encoder has.
  EncodingLevelExhausted { what: String },

  /// The image kept needing re-emission.
  RestartLimit { restarts: u32 },
}

impl fmt::Display for ImageError {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      ImageError::Inconsistency { address } => write!(
        fmt,
        "overlapping regions have different payloads at {:#x}",
        address
      ),
      ImageError::UnresolvedTarget { what } => {
        write!(fmt, "unresolved reference to {}", what)
      }
      ImageError::EncodingLevelExhausted { what } => {
        write!(fmt, "no encoding of {} reaches its target", what)
      }
      ImageError::RestartLimit { restarts } => {
        write!(fmt, "gave up after {} restarts", restarts)
      }
    }
  }
}

//=============================================================================
// Inputs

/// A reference from a data item to a method or another data item.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct DataRef {
  pub offset: u32,
  pub target: String,
  pub addend: i32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct DataItem {
  pub name: String,
  pub payload: Vec<u8>,
  /// Falls back to the platform's data placement.
  pub placement: Option<PlacementRequirements>,
  /// Pins the item at this address.
  pub fixed_address: Option<u32>,
  pub pointer_offset: u32,
  pub refs: Vec<DataRef>,
}

impl DataItem {
  pub fn new(name: &str, payload: Vec<u8>) -> Self {
    DataItem {
      name: name.to_string(),
      payload,
      placement: None,
      fixed_address: None,
      pointer_offset: 0,
      refs: Vec::new(),
    }
  }
}

// Names that code and data may refer to.
struct Targets {
  methods: Map<String, (MethodIx, BlockIx)>,
  data: Map<String, RegionIx>,
}

impl Targets {
  fn resolve(&self, name: &str) -> Option<RelocTarget> {
    if let Some((method, block)) = self.methods.get(name) {
      return Some(RelocTarget::Block { method: *method, block: *block });
    }
    self.data.get(name).map(|rix| RelocTarget::Region(*rix))
  }
}

//=============================================================================
// The sink handed to the encoder

/// Where an encoder writes one instruction.
pub struct EmitSink<'a> {
  region: &'a mut Region,
  method: MethodIx,
  block: BlockIx,
  insn: InstIx,
  level: u8,
  schedule: &'a Schedule,
  targets: &'a Targets,
}

impl<'a> EmitSink<'a> {
  pub fn emit_u8(&mut self, value: u8) {
    self.region.emit_u8(value);
  }

  pub fn emit_u16(&mut self, value: u16) {
    self.region.emit_u16(value);
  }

  pub fn emit_u32(&mut self, value: u32) {
    self.region.emit_u32(value);
  }

  pub fn emit_bytes(&mut self, bytes: &[u8]) {
    self.region.emit_bytes(bytes);
  }

  /// Bytes emitted into the current region so far.
  pub fn offset(&self) -> u32 {
    self.region.size()
  }

  pub fn method(&self) -> MethodIx {
    self.method
  }

  pub fn block(&self) -> BlockIx {
    self.block
  }

  pub fn insn(&self) -> InstIx {
    self.insn
  }

  /// Zero unless an earlier round found this instruction's operands out of
  /// reach.
  pub fn encoding_level(&self) -> u8 {
    self.level
  }

  /// Does the current block fall straight into `target`?  If so, a jump to
  /// it can be left out.
  pub fn falls_through_to(&self, target: BlockIx) -> bool {
    self.schedule.are_blocks_adjacent(self.block, target)
  }

  pub fn block_target(&self, block: BlockIx) -> RelocTarget {
    RelocTarget::Block { method: self.method, block }
  }

  /// The entry of the method called `name`.
  pub fn method_target(&self, name: &str) -> Result<RelocTarget, ImageError> {
    match self.targets.methods.get(name) {
      Some((method, block)) => {
        Ok(RelocTarget::Block { method: *method, block: *block })
      }
      None => Err(ImageError::UnresolvedTarget { what: format!("method '{}'", name) }),
    }
  }

  pub fn data_target(&self, name: &str) -> Result<RelocTarget, ImageError> {
    match self.targets.data.get(name) {
      Some(rix) => Ok(RelocTarget::Region(*rix)),
      None => Err(ImageError::UnresolvedTarget { what: format!("data '{}'", name) }),
    }
  }

  /// Emit a word that will hold `target + addend`.
  pub fn add_absolute(&mut self, target: RelocTarget, addend: i32) {
    let offset = self.offset();
    self.region.annotate(offset, 4, AnnotationKind::Absolute { target, addend });
    self.region.emit_u32(0);
  }

  /// Emit `word`, whose low `bits` bits will hold the distance from the
  /// word to `target`.
  pub fn add_relative(&mut self, target: RelocTarget, bits: u8, word: u32) {
    let offset = self.offset();
    let origin = Some((self.method, self.insn));
    self.region.annotate(offset, 4, AnnotationKind::Relative { target, bits, origin });
    self.region.emit_u32(word);
  }

  pub fn add_marker(&mut self, label: &str) {
    let offset = self.offset();
    self.region.annotate(offset, 0, AnnotationKind::Marker { label: label.to_string() });
  }
}

//=============================================================================
// The result

/// Contiguous bytes of the final image.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ImageSection {
  pub address: u32,
  pub bytes: Vec<u8>,
}

impl ImageSection {
  pub fn end(&self) -> u32 {
    self.address + self.bytes.len() as u32
  }
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct PlacedRegion {
  pub index: RegionIx,
  pub context: RegionContext,
  pub address: u32,
  pub size: u32,
  pub cold: bool,
  pub payload: Vec<u8>,
}

/// The address ranges holding one method's code.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct CodeMap {
  pub method: String,
  pub ranges: Vec<(u32, u32)>,
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ImageLayout {
  /// Sorted by address, then end address, then region index.
  pub regions: Vec<PlacedRegion>,
  pub sections: Vec<ImageSection>,
  pub relocations: Vec<RelocationRecord>,
  /// One per method.
  pub exception_maps: Vec<ExceptionMap>,
  pub code_maps: Vec<CodeMap>,
  pub schedules: Vec<Schedule>,
  /// Per method, per block.  None for blocks that were never scheduled.
  pub block_addresses: Vec<Vec<Option<u32>>>,
  /// The memory map after placement, allocated ranges flagged.
  pub used_memory: Vec<MemoryRange>,
  pub restarts: u32,
}

impl ImageLayout {
  /// The region holding `address`.  Where regions overlap, the one starting
  /// last wins.
  pub fn resolve_address_to_region(&self, address: u32) -> Option<&PlacedRegion> {
    let pos = self.regions.partition_point(|r| r.address <= address);
    self.regions[..pos].iter().rev().find(|r| address < r.address + r.size)
  }

  pub fn block_address(&self, method: MethodIx, block: BlockIx) -> Option<u32> {
    self
      .block_addresses
      .get(method.get() as usize)
      .and_then(|m| m.get(block.get() as usize).cloned().flatten())
  }

  pub fn code_size(&self) -> u32 {
    self
      .regions
      .iter()
      .filter(|r| matches!(r.context, RegionContext::Block { .. }))
      .map(|r| r.size)
      .sum()
  }
}

//=============================================================================
// Image collection

/// Placed regions ordered by address, then end address, then index.
pub fn sort_regions(regions: &TypedIxVec<RegionIx, Region>) -> Vec<RegionIx> {
  let mut res: Vec<(u32, u32, RegionIx)> = regions
    .range()
    .into_iter()
    .filter_map(|rix| {
      let r = &regions[rix];
      r.base_address().map(|a| (a, a + r.size(), rix))
    })
    .collect();
  res.sort();
  res.into_iter().map(|(_, _, rix)| rix).collect()
}

/// Join the sorted regions into sections.  Where two regions overlap they
/// must agree on the overlapping bytes, unless checking is off.
#[inline(never)]
pub fn collect_image(
  regions: &TypedIxVec<RegionIx, Region>, order: &[RegionIx], check: bool,
) -> Result<Vec<ImageSection>, ImageError> {
  let mut sections = Vec::<ImageSection>::new();
  for &rix in order {
    let r = &regions[rix];
    let address = match r.base_address() {
      Some(a) => a,
      None => continue,
    };
    let payload = r.payload();
    if let Some(last) = sections.last_mut() {
      if address <= last.end() {
        let at = (address - last.address) as usize;
        let overlap = (last.bytes.len() - at).min(payload.len());
        if check {
          for i in 0..overlap {
            if last.bytes[at + i] != payload[i] {
              return Err(ImageError::Inconsistency { address: address + i as u32 });
            }
          }
        }
        last.bytes.extend_from_slice(&payload[overlap..]);
        continue;
      }
    }
    sections.push(ImageSection { address, bytes: payload.to_vec() });
  }
  debug!("collect_image: {} sections", sections.len());
  Ok(sections)
}

/// Regions in memory that the loader finds in place, or that hold the
/// relocation data itself, are left out of the relocation records.
pub fn should_relocate(memory: &[MemoryRange], address: u32) -> bool {
  match memory.iter().find(|m| m.contains(address)) {
    Some(m) => {
      !m.usage.contains(MemoryUsage::RELOCATION)
        && !m.attributes.contains(MemoryAttributes::LOADED_AT_ENTRYPOINT)
    }
    None => false,
  }
}

//=============================================================================
// The driver

struct MethodCompilation<'a, F: Function> {
  analyses: AnalysisCache<'a, F>,
  // Held for as long as the schedule derived from the analyses is in use.
  _lock: AnalysisLock,
  schedule: Schedule,
  block_regions: TypedIxVec<BlockIx, Option<RegionIx>>,
}

enum Round {
  Done(ImageLayout),
  Escalate(Vec<(MethodIx, InstIx)>),
}

pub struct ImageBuilder<'a, F: Function, E: Encoder<F>, P: Platform> {
  funcs: &'a [F],
  data: &'a [DataItem],
  encoder: &'a E,
  platform: &'a P,
  options: &'a LayoutOptions,
}

impl<'a, F: Function, E: Encoder<F>, P: Platform> ImageBuilder<'a, F, E, P> {
  pub fn new(
    funcs: &'a [F], data: &'a [DataItem], encoder: &'a E, platform: &'a P,
    options: &'a LayoutOptions,
  ) -> Self {
    ImageBuilder { funcs, data, encoder, platform, options }
  }

  #[inline(never)]
  pub fn build(&self) -> Result<ImageLayout, LayoutError> {
    info!(
      "ImageBuilder::build: begin, {} methods, {} data items",
      self.funcs.len(),
      self.data.len()
    );

    let mut targets = Targets { methods: Map::default(), data: Map::default() };
    for (n, item) in self.data.iter().enumerate() {
      targets.data.insert(item.name.clone(), RegionIx::new(n as u32));
    }

    let mut methods = Vec::<MethodCompilation<F>>::new();
    for (n, func) in self.funcs.iter().enumerate() {
      let analyses = AnalysisCache::new(func)?;
      let lock = analyses.lock_all();
      let sizes = estimate_block_sizes(func, self.encoder);
      let schedule = schedule(&analyses, &sizes)?;
      let nBlocks = analyses.cfg().num_blocks();
      targets
        .methods
        .insert(func.name().to_string(), (MethodIx::new(n as u32), func.entry_block()));
      methods.push(MethodCompilation {
        analyses,
        _lock: lock,
        schedule,
        block_regions: TypedIxVec::filled(nBlocks, None),
      });
    }

    let mut levels = Map::<(MethodIx, InstIx), u8>::default();
    let mut restarts = 0;
    loop {
      match self.round(&mut methods, &targets, &levels)? {
        Round::Done(mut layout) => {
          layout.restarts = restarts;
          info!(
            "ImageBuilder::build: end, {} regions, {} restarts",
            layout.regions.len(),
            restarts
          );
          return Ok(layout);
        }
        Round::Escalate(insns) => {
          if restarts >= self.options.max_restarts {
            return Err(ImageError::RestartLimit { restarts }.into());
          }
          for (method, insn) in insns {
            let level = levels.entry((method, insn)).or_insert(0);
            if *level >= self.encoder.max_encoding_level() {
              let name = self.funcs[method.get() as usize].name();
              return Err(
                ImageError::EncodingLevelExhausted {
                  what: format!("{:?} in method '{}'", insn, name),
                }
                .into(),
              );
            }
            *level += 1;
          }
          restarts += 1;
          info!("ImageBuilder::build: restart {}", restarts);
        }
      }
    }
  }

  // === BEGIN emission ===

  fn emit_data(&self, targets: &Targets) -> Result<TypedIxVec<RegionIx, Region>, ImageError> {
    let mut regions = TypedIxVec::<RegionIx, Region>::new();
    for item in self.data.iter() {
      let placement =
        item.placement.clone().unwrap_or_else(|| self.platform.data_placement());
      let mut r = Region::new(RegionContext::Data { name: item.name.clone() }, placement);
      r.pointer_offset = item.pointer_offset;
      r.emit_bytes(&item.payload);
      for dr in item.refs.iter() {
        if dr.offset as usize + 4 > item.payload.len() {
          return Err(ImageError::UnresolvedTarget {
            what: format!(
              "'{}' from beyond the end of data '{}' (offset {})",
              dr.target, item.name, dr.offset
            ),
          });
        }
        let target = targets.resolve(&dr.target).ok_or_else(|| {
          ImageError::UnresolvedTarget { what: format!("'{}'", dr.target) }
        })?;
        r.annotate(dr.offset, 4, AnnotationKind::Absolute { target, addend: dr.addend });
      }
      regions.push(r);
    }
    Ok(regions)
  }

  fn emit_method(
    &self, mix: MethodIx, mc: &mut MethodCompilation<F>,
    regions: &mut TypedIxVec<RegionIx, Region>, targets: &Targets,
    levels: &Map<(MethodIx, InstIx), u8>,
  ) -> Result<(), ImageError> {
    let func = &self.funcs[mix.get() as usize];
    let schedule = &mc.schedule;
    for bix in mc.block_regions.iter_mut() {
      *bix = None;
    }
    for &bix in schedule.order() {
      let cold = schedule.is_cold(bix);
      let mut r = Region::new(
        RegionContext::Block { method: mix, block: bix },
        self.platform.code_placement(cold),
      );
      r.cold = cold;
      // Blocks aliasing this one sit at its start.
      let mut blocks = schedule.zero_length_predecessors(bix).to_vec();
      blocks.push(bix);
      for b in blocks {
        for iix in func.block_insns(b) {
          let mut sink = EmitSink {
            region: &mut r,
            method: mix,
            block: b,
            insn: iix,
            level: levels.get(&(mix, iix)).cloned().unwrap_or(0),
            schedule,
            targets,
          };
          self.encoder.emit(func, iix, &mut sink)?;
        }
      }
      fixup_empty_region::<F, E>(&mut r, self.encoder);
      mc.block_regions[bix] = Some(RegionIx::new(regions.len()));
      regions.push(r);
    }
    trace!("emit_method: {} done", func.name());
    Ok(())
  }

  // === END emission ===

  fn resolve(
    &self, methods: &[MethodCompilation<F>], regions: &TypedIxVec<RegionIx, Region>,
    target: RelocTarget,
  ) -> Result<u32, ImageError> {
    match target {
      RelocTarget::Block { method, block } => {
        let unresolved = || ImageError::UnresolvedTarget {
          what: format!("{:?} of method {:?}", block, method),
        };
        let mc = methods.get(method.get() as usize).ok_or_else(unresolved)?;
        if block.get() >= mc.block_regions.len() || !mc.schedule.is_scheduled(block) {
          return Err(unresolved());
        }
        block_address(&mc.schedule, &mc.block_regions, regions, block)
          .map_err(|_| unresolved())
      }
      RelocTarget::Region(rix) => {
        if rix.get() >= regions.len() {
          return Err(ImageError::UnresolvedTarget { what: format!("{:?}", rix) });
        }
        regions[rix]
          .pointer_address()
          .map_err(|e| ImageError::UnresolvedTarget { what: e.to_string() })
      }
    }
  }

  // Patch every annotation.  Returns the instructions whose relative
  // references didn't reach.
  fn apply_relocations(
    &self, methods: &[MethodCompilation<F>], regions: &mut TypedIxVec<RegionIx, Region>,
  ) -> Result<Vec<(MethodIx, InstIx)>, LayoutError> {
    let mut patches = Vec::<(RegionIx, u32, u32)>::new();
    let mut escalate = Vec::<(MethodIx, InstIx)>::new();
    for rix in regions.range() {
      let r = &regions[rix];
      let base = r.address()?;
      for ann in r.annotations() {
        match &ann.kind {
          AnnotationKind::Absolute { target, addend } => {
            let to = self.resolve(methods, regions, *target)?;
            patches.push((rix, ann.offset, to.wrapping_add(*addend as u32)));
          }
          AnnotationKind::Relative { target, bits, origin } => {
            let to = self.resolve(methods, regions, *target)?;
            let site = base + ann.offset;
            let disp = to as i64 - site as i64;
            let bits = (*bits).min(32).max(1) as u32;
            let limit = 1i64 << (bits - 1);
            if disp >= -limit && disp < limit {
              let mask = if bits == 32 { u32::MAX } else { (1u32 << bits) - 1 };
              let word = r.read_u32(ann.offset).unwrap_or(0);
              patches.push((rix, ann.offset, (word & !mask) | (disp as u32 & mask)));
            } else {
              match origin {
                Some(o) => {
                  trace!("apply_relocations: {:?} is {} bytes out of reach", o, disp);
                  if !escalate.contains(o) {
                    escalate.push(*o);
                  }
                }
                None => {
                  return Err(
                    ImageError::EncodingLevelExhausted {
                      what: format!("reference at {:#x}", site),
                    }
                    .into(),
                  )
                }
              }
            }
          }
          AnnotationKind::Marker { .. } => {}
        }
      }
    }
    for (rix, offset, value) in patches {
      if !regions[rix].patch_u32(offset, value) {
        return Err(
          ImageError::UnresolvedTarget {
            what: format!("reference past the end of {}", regions[rix].context),
          }
          .into(),
        );
      }
    }
    Ok(escalate)
  }

  #[inline(never)]
  fn round(
    &self, methods: &mut Vec<MethodCompilation<F>>, targets: &Targets,
    levels: &Map<(MethodIx, InstIx), u8>,
  ) -> Result<Round, LayoutError> {
    // Emission: data first, so data region indices match `targets`.
    let mut regions = self.emit_data(targets)?;
    for (n, mc) in methods.iter_mut().enumerate() {
      self.emit_method(MethodIx::new(n as u32), mc, &mut regions, targets, levels)?;
    }

    // Placement.
    let memory = self.platform.memory_map();
    let mut heap = SortedLinkerHeap::new(&memory);
    for (n, item) in self.data.iter().enumerate() {
      if let Some(address) = item.fixed_address {
        place_fixed(&mut regions[RegionIx::new(n as u32)], address, &mut heap)?;
      }
    }
    let passes: &[Option<bool>] = if self.options.include_cold_code_in_first_pass {
      &[None]
    } else {
      &[Some(false), Some(true)]
    };
    for pass in passes {
      for (n, mc) in methods.iter().enumerate() {
        let what = format!("method '{}'", self.funcs[n].name());
        for &cold in [false, true].iter() {
          if pass.map_or(true, |p| p == cold) {
            assign_code_addresses(
              &mc.schedule,
              &mc.block_regions,
              &mut regions,
              &mut heap,
              cold,
              self.options.entry_block_alignment,
              &what,
            )?;
          }
        }
      }
    }
    for (n, item) in self.data.iter().enumerate() {
      if item.fixed_address.is_none() {
        regions[RegionIx::new(n as u32)].assign_absolute_address(&mut heap)?;
      }
    }

    let escalate = self.apply_relocations(methods, &mut regions)?;
    if !escalate.is_empty() {
      return Ok(Round::Escalate(escalate));
    }

    // Collection.
    let order = sort_regions(&regions);
    let sections = collect_image(&regions, &order, self.options.check_consistency)?;
    let relocatable = order.iter().filter_map(|rix| {
      let r = &regions[*rix];
      let address = r.base_address()?;
      if should_relocate(&memory, address) {
        Some((address, r.payload()))
      } else {
        None
      }
    });
    let relocations = relocation::encode(relocatable, self.options.min_zero_run_words);

    let mut exception_maps = Vec::new();
    let mut code_maps = Vec::new();
    let mut block_addresses = Vec::new();
    for (n, mc) in methods.iter().enumerate() {
      let func = &self.funcs[n];
      let mut spans = Vec::new();
      for &bix in mc.schedule.order() {
        let rix = match mc.block_regions[bix] {
          Some(rix) => rix,
          None => continue,
        };
        let start = regions[rix].address()?;
        let mut handlers = Vec::new();
        for clause in func.block_handlers(bix) {
          let handler = self.resolve(
            methods,
            &regions,
            RelocTarget::Block { method: MethodIx::new(n as u32), block: clause.handler },
          )?;
          handlers.push(HandlerEntry { filter: clause.filter, handler });
        }
        spans.push((start, start + regions[rix].size(), handlers));
      }

      let mut ranges: Vec<(u32, u32)> = spans.iter().map(|s| (s.0, s.1)).collect();
      ranges.sort();
      let mut merged = Vec::<(u32, u32)>::new();
      for (s, e) in ranges {
        match merged.last_mut() {
          Some(last) if last.1 == s => last.1 = e,
          _ => merged.push((s, e)),
        }
      }
      code_maps.push(CodeMap { method: func.name().to_string(), ranges: merged });
      exception_maps.push(ExceptionMap::build(func, spans));

      let mut addrs = Vec::new();
      for bix in mc.analyses.cfg().blocks.range() {
        addrs.push(if mc.schedule.is_scheduled(bix) {
          block_address(&mc.schedule, &mc.block_regions, &regions, bix).ok()
        } else {
          None
        });
      }
      block_addresses.push(addrs);
    }

    let placed = order
      .iter()
      .map(|rix| {
        let r = &regions[*rix];
        PlacedRegion {
          index: *rix,
          context: r.context.clone(),
          address: r.base_address().unwrap_or(0),
          size: r.size(),
          cold: r.cold,
          payload: r.payload().to_vec(),
        }
      })
      .collect();

    Ok(Round::Done(ImageLayout {
      regions: placed,
      sections,
      relocations,
      exception_maps,
      code_maps,
      schedules: methods.iter().map(|mc| mc.schedule.clone()).collect(),
      block_addresses,
      used_memory: heap.commit(),
      restarts: 0,
    }))
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::interface::{layout_image, ExceptionType};
  use crate::test_graphs::{TestEncoder, TestGraph, TestPlatform};

  fn b(n: u32) -> BlockIx {
    BlockIx::new(n)
  }

  // One word per block, plus a jump to each normal successor that isn't
  // next in line: a short relative jump at level zero, an absolute one
  // above.
  struct JumpEncoder {
    bits: u8,
  }

  impl Encoder<TestGraph> for JumpEncoder {
    fn min_size(&self, func: &TestGraph, insn: InstIx) -> u32 {
      TestEncoder.min_size(func, insn)
    }

    fn emit(
      &self, func: &TestGraph, insn: InstIx, sink: &mut EmitSink,
    ) -> Result<(), ImageError> {
      TestEncoder.emit(func, insn, sink)?;
      let block = sink.block();
      for &succ in func.succs[block.get() as usize].iter() {
        let succ = BlockIx::new(succ);
        if func.handlers[succ.get() as usize] || sink.falls_through_to(succ) {
          continue;
        }
        let target = sink.block_target(succ);
        if sink.encoding_level() == 0 {
          sink.add_relative(target, self.bits, 0xEA00_0000);
        } else {
          sink.emit_u32(0xE51F_F004);
          sink.add_absolute(target, 0);
        }
      }
      Ok(())
    }

    fn fill_empty_region(&self, region: &mut Region) {
      region.emit_u32(0xE320_F000);
    }

    fn max_encoding_level(&self) -> u8 {
      1
    }
  }

  #[test]
  fn hot_code_of_every_method_before_cold_code() {
    let mut f = TestGraph::new(&[&[1], &[], &[]]);
    f.protect(0, 2, None);
    let mut g = TestGraph::new(&[&[1], &[]]);
    g.no_return.insert(1);
    let funcs = vec![f, g];
    let layout = layout_image(
      &funcs,
      &[],
      &TestEncoder,
      &TestPlatform::default(),
      &LayoutOptions::default(),
    )
    .unwrap();
    let hot: Vec<u32> = layout.regions.iter().filter(|r| !r.cold).map(|r| r.address).collect();
    let cold: Vec<u32> = layout.regions.iter().filter(|r| r.cold).map(|r| r.address).collect();
    assert_eq!(cold.len(), 2);
    assert!(hot.iter().max().unwrap() < cold.iter().min().unwrap());
    assert_eq!(layout.restarts, 0);
  }

  #[test]
  fn cold_code_can_stay_with_its_method() {
    let mut f = TestGraph::new(&[&[1], &[]]);
    f.no_return.insert(1);
    let g = TestGraph::new(&[&[1], &[]]);
    let funcs = vec![f, g];
    let mut options = LayoutOptions::default();
    options.include_cold_code_in_first_pass = true;
    let layout =
      layout_image(&funcs, &[], &TestEncoder, &TestPlatform::default(), &options).unwrap();
    // f's cold block comes before g's code.
    let fCold = layout.block_address(MethodIx::new(0), b(1)).unwrap();
    let gEntry = layout.block_address(MethodIx::new(1), b(0)).unwrap();
    assert!(fCold < gEntry);
  }

  #[test]
  fn far_jumps_restart_with_a_longer_encoding() {
    // 0 -> 2 over a big block 1; 1 -> 2 as well.
    let mut f = TestGraph::new(&[&[1, 2], &[2], &[]]);
    f.sizes = vec![4, 0x400, 4];
    let funcs = vec![f];
    let layout = layout_image(
      &funcs,
      &[],
      &JumpEncoder { bits: 8 },
      &TestPlatform::default(),
      &LayoutOptions::default(),
    )
    .unwrap();
    assert_eq!(layout.restarts, 1);
    // The absolute form holds the target's address.
    let s = &layout.schedules[0];
    let target = layout.block_address(MethodIx::new(0), b(2)).unwrap();
    let far = s
      .order()
      .iter()
      .find(|x| !s.are_blocks_adjacent(**x, b(2)) && **x != b(2) && **x != b(1))
      .cloned();
    if let Some(far) = far {
      let start = layout.block_address(MethodIx::new(0), far).unwrap();
      let region = layout.resolve_address_to_region(start).unwrap();
      let w = &region.payload[8..12];
      assert_eq!(u32::from_le_bytes([w[0], w[1], w[2], w[3]]), target);
    }
  }

  #[test]
  fn restart_limit() {
    let mut f = TestGraph::new(&[&[1, 2], &[2], &[]]);
    f.sizes = vec![4, 0x400, 4];
    let funcs = vec![f];
    let mut options = LayoutOptions::default();
    options.max_restarts = 0;
    let err = layout_image(
      &funcs,
      &[],
      &JumpEncoder { bits: 8 },
      &TestPlatform::default(),
      &options,
    )
    .unwrap_err();
    match err {
      LayoutError::Image(ImageError::RestartLimit { restarts }) => assert_eq!(restarts, 0),
      other => panic!("unexpected {}", other),
    }
  }

  #[test]
  fn near_jumps_are_patched_in_place() {
    let f = TestGraph::new(&[&[1, 2], &[3], &[3], &[]]);
    let funcs = vec![f];
    let layout = layout_image(
      &funcs,
      &[],
      &JumpEncoder { bits: 12 },
      &TestPlatform::default(),
      &LayoutOptions::default(),
    )
    .unwrap();
    assert_eq!(layout.restarts, 0);
    for r in layout.regions.iter() {
      if r.payload.len() == 8 {
        let w = u32::from_le_bytes([r.payload[4], r.payload[5], r.payload[6], r.payload[7]]);
        assert_eq!(w & 0xFFFF_F000, 0xEA00_0000);
        let disp = ((w & 0xFFF) << 20) as i32 >> 20;
        let target = (r.address + 4) as i64 + disp as i64;
        let hit = layout.resolve_address_to_region(target as u32).unwrap();
        assert_eq!(hit.address as i64, target);
      }
    }
  }

  #[test]
  fn data_refs_and_relocations() {
    let f = TestGraph::new(&[&[]]);
    let funcs = vec![f];
    let mut table = DataItem::new("table", vec![0; 12]);
    table.refs.push(DataRef { offset: 0, target: "test".to_string(), addend: 1 });
    table.refs.push(DataRef { offset: 8, target: "blob".to_string(), addend: 0 });
    let mut blob = DataItem::new("blob", vec![1, 2, 3, 4, 0, 0, 0, 0]);
    blob.pointer_offset = 4;
    let layout = layout_image(
      &funcs,
      &[table, blob],
      &TestEncoder,
      &TestPlatform::default(),
      &LayoutOptions::default(),
    )
    .unwrap();
    let entry = layout.block_address(MethodIx::new(0), b(0)).unwrap();
    let find = |name: &str| {
      layout
        .regions
        .iter()
        .find(|r| r.context == RegionContext::Data { name: name.to_string() })
        .unwrap()
    };
    let t = find("table");
    let word = |o: usize| {
      u32::from_le_bytes([t.payload[o], t.payload[o + 1], t.payload[o + 2], t.payload[o + 3]])
    };
    assert_eq!(word(0), entry + 1);
    assert_eq!(word(4), 0);
    assert_eq!(word(8), find("blob").address + 4);

    let spans = relocation::reconstruct(&layout.relocations);
    for s in layout.sections.iter() {
      let covered = spans.iter().any(|(a, bytes)| {
        *a == s.address && bytes[..s.bytes.len()] == s.bytes[..]
      });
      assert!(covered, "section at {:#x}", s.address);
    }
  }

  #[test]
  fn unknown_names_are_reported() {
    let funcs = vec![TestGraph::new(&[&[]])];
    let mut table = DataItem::new("table", vec![0; 4]);
    table.refs.push(DataRef { offset: 0, target: "nowhere".to_string(), addend: 0 });
    let err = layout_image(
      &funcs,
      &[table],
      &TestEncoder,
      &TestPlatform::default(),
      &LayoutOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, LayoutError::Image(ImageError::UnresolvedTarget { .. })));
  }

  #[test]
  fn out_of_memory_is_fatal() {
    let mut f = TestGraph::new(&[&[]]);
    f.sizes = vec![0x200];
    let funcs = vec![f];
    let platform = TestPlatform { code_end: 0x100 };
    let err = layout_image(&funcs, &[], &TestEncoder, &platform, &LayoutOptions::default())
      .unwrap_err();
    assert!(err.to_string().starts_with("placement error: cannot allocate memory"));
  }

  #[test]
  fn exception_maps_cover_protected_blocks() {
    let mut f = TestGraph::new(&[&[1], &[3], &[3], &[]]);
    f.protect(1, 2, Some(7));
    let funcs = vec![f];
    let layout = layout_image(
      &funcs,
      &[],
      &TestEncoder,
      &TestPlatform::default(),
      &LayoutOptions::default(),
    )
    .unwrap();
    let em = &layout.exception_maps[0];
    assert_eq!(em.ranges().len(), 1);
    let pc = layout.block_address(MethodIx::new(0), b(1)).unwrap();
    let handler = layout.block_address(MethodIx::new(0), b(2)).unwrap();
    assert_eq!(em.find_handler(&funcs[0], pc, ExceptionType(7)), Some(handler));
    assert_eq!(em.find_handler(&funcs[0], pc, ExceptionType(8)), None);
    assert_eq!(layout.code_maps[0].method, "test");
  }

  #[test]
  fn overlapping_regions_must_agree() {
    let pr = PlacementRequirements::new(1, MemoryUsage::DATA);
    let mut regions = TypedIxVec::<RegionIx, Region>::new();
    for (n, (addr, bytes)) in
      [(0x10u32, vec![1u8, 2, 3, 4]), (0x12, vec![3, 4, 5]), (0x20, vec![9])].iter().enumerate()
    {
      let mut r = Region::new(RegionContext::Data { name: format!("d{}", n) }, pr.clone());
      r.emit_bytes(bytes);
      r.set_base_address(*addr);
      regions.push(r);
    }
    let order = sort_regions(&regions);
    let sections = collect_image(&regions, &order, true).unwrap();
    assert_eq!(
      sections,
      vec![
        ImageSection { address: 0x10, bytes: vec![1, 2, 3, 4, 5] },
        ImageSection { address: 0x20, bytes: vec![9] },
      ]
    );
    let mut bad = regions.clone();
    bad[RegionIx::new(1)] = {
      let mut r = Region::new(RegionContext::Data { name: "bad".to_string() }, pr);
      r.emit_bytes(&[3, 7]);
      r.set_base_address(0x12);
      r
    };
    assert_eq!(
      collect_image(&bad, &sort_regions(&bad), true),
      Err(ImageError::Inconsistency { address: 0x13 })
    );
    assert!(collect_image(&bad, &sort_regions(&bad), false).is_ok());
  }
}
