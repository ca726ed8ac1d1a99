/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! A bare block graph implementing `Function`, for the unit tests.  Block i
//! owns instructions `i * insns_per_block ..`; everything else is set up by
//! poking at the public fields.

use crate::data_structures::{BlockIx, InstIx, MyRange, Set};
use crate::interface::{
  EmitSink, Encoder, ExceptionType, Function, HandlerClause, ImageError,
  MemoryAttributes, MemoryRange, MemoryUsage, Platform, PlacementRequirements,
  Region,
};

pub struct TestGraph {
  pub succs: Vec<Vec<u32>>,
  pub entry: u32,
  pub handlers: Vec<bool>,
  pub dead: Vec<bool>,
  pub no_return: Set<u32>,
  pub protection: Vec<Vec<HandlerClause>>,
  pub insns_per_block: u32,
  /// Per-block size reported to the scheduler by `TestEncoder`.
  pub sizes: Vec<u32>,
  /// (type, parent) pairs.
  pub type_parents: Vec<(u32, u32)>,
}

impl TestGraph {
  pub fn new(succs: &[&[u32]]) -> Self {
    let n = succs.len();
    TestGraph {
      succs: succs.iter().map(|s| s.to_vec()).collect(),
      entry: 0,
      handlers: vec![false; n],
      dead: vec![false; n],
      no_return: Set::empty(),
      protection: vec![Vec::new(); n],
      insns_per_block: 1,
      sizes: vec![4; n],
      type_parents: Vec::new(),
    }
  }

  pub fn protect(&mut self, block: u32, handler: u32, filter: Option<u32>) {
    self.handlers[handler as usize] = true;
    self.protection[block as usize].push(HandlerClause {
      handler: BlockIx::new(handler),
      filter: filter.map(ExceptionType),
    });
    self.succs[block as usize].push(handler);
  }
}

impl Function for TestGraph {
  fn name(&self) -> &str {
    "test"
  }

  fn blocks(&self) -> MyRange<BlockIx> {
    MyRange::new(BlockIx::new(0), self.succs.len())
  }

  fn entry_block(&self) -> BlockIx {
    BlockIx::new(self.entry)
  }

  fn block_insns(&self, block: BlockIx) -> MyRange<InstIx> {
    MyRange::new(
      InstIx::new(block.get() * self.insns_per_block),
      self.insns_per_block as usize,
    )
  }

  fn block_succs(&self, block: BlockIx) -> Vec<BlockIx> {
    self.succs[block.get() as usize].iter().map(|s| BlockIx::new(*s)).collect()
  }

  fn is_exception_handler(&self, block: BlockIx) -> bool {
    self.handlers[block.get() as usize]
  }

  fn is_dead(&self, block: BlockIx) -> bool {
    self.dead[block.get() as usize]
  }

  fn is_no_return_call(&self, insn: InstIx) -> bool {
    self.no_return.contains(insn.get())
  }

  fn block_handlers(&self, block: BlockIx) -> Vec<HandlerClause> {
    self.protection[block.get() as usize].clone()
  }

  fn is_subtype_of(&self, ty: ExceptionType, of: ExceptionType) -> bool {
    let mut cur = ty.0;
    loop {
      if cur == of.0 {
        return true;
      }
      match self.type_parents.iter().find(|(t, _)| *t == cur) {
        Some((_, parent)) => cur = *parent,
        None => return false,
      }
    }
  }
}

/// Reports each block's size from `TestGraph::sizes` on its first
/// instruction, and emits that many filler bytes.
pub struct TestEncoder;

impl Encoder<TestGraph> for TestEncoder {
  fn min_size(&self, func: &TestGraph, insn: InstIx) -> u32 {
    if insn.get() % func.insns_per_block == 0 {
      func.sizes[(insn.get() / func.insns_per_block) as usize]
    } else {
      0
    }
  }

  fn emit(
    &self, func: &TestGraph, insn: InstIx, sink: &mut EmitSink,
  ) -> Result<(), ImageError> {
    for _ in 0..self.min_size(func, insn) {
      sink.emit_u8(0xAA);
    }
    Ok(())
  }

  fn fill_empty_region(&self, region: &mut Region) {
    region.emit_u32(0);
  }
}

/// Code in flash from zero, data in RAM.
pub struct TestPlatform {
  pub code_end: u32,
}

impl Default for TestPlatform {
  fn default() -> Self {
    TestPlatform { code_end: 0x1_0000 }
  }
}

impl Platform for TestPlatform {
  fn memory_map(&self) -> Vec<MemoryRange> {
    vec![
      MemoryRange::new(
        0x0,
        self.code_end,
        MemoryAttributes::FLASH | MemoryAttributes::READ | MemoryAttributes::EXECUTE,
        MemoryUsage::CODE,
      ),
      MemoryRange::new(
        0x2000_0000,
        0x2000_1000,
        MemoryAttributes::RAM | MemoryAttributes::READ | MemoryAttributes::WRITE,
        MemoryUsage::DATA,
      ),
    ]
  }

  fn code_placement(&self, _cold: bool) -> PlacementRequirements {
    PlacementRequirements::new(4, MemoryUsage::CODE)
  }

  fn data_placement(&self) -> PlacementRequirements {
    PlacementRequirements::new(4, MemoryUsage::DATA)
  }
}
