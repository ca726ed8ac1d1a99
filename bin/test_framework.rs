/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

#![allow(non_snake_case)]

/// As part of this set of test cases, we define a mini IR, a toy encoder for
/// it and a toy target, and implement the library's `Function`, `Encoder`
/// and `Platform` traits for them so that we can use the codelayout public
/// interface.
use codelayout::{
  BlockIx, DataItem, DataRef, EmitSink, Encoder, ExceptionType, Function,
  HandlerClause, ImageError, InstIx, MemoryAttributes, MemoryRange,
  MemoryUsage, MyRange, Platform, PlacementRequirements, Region, TypedIxVec,
};

use std::fmt;

//=============================================================================
// Definition of: Label and Inst.  Every block ends in exactly one control
// flow instruction.

#[derive(Clone, PartialEq, Eq)]
pub enum Label {
  Unresolved { name: String },
  Resolved { name: String, bix: BlockIx },
}
impl fmt::Debug for Label {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Label::Unresolved { name } => write!(fmt, "??:{}", &name),
      Label::Resolved { name, bix } => write!(fmt, "{:?}:{}", bix, name),
    }
  }
}
impl Label {
  pub fn name(&self) -> &str {
    match self {
      Label::Unresolved { name } | Label::Resolved { name, .. } => name,
    }
  }
  pub fn getBlockIx(&self) -> Option<BlockIx> {
    match self {
      Label::Resolved { bix, .. } => Some(*bix),
      Label::Unresolved { .. } => None,
    }
  }
}

#[derive(Clone, PartialEq, Eq)]
pub enum Inst {
  /// Straight-line work, `words` words long.
  Op { words: u32 },
  /// A literal word.
  Word { value: u32 },
  /// Call another method.  A call that never returns makes its block cold.
  Call { callee: String, no_return: bool },
  /// Load the address of a method or a data item.
  LoadAddr { target: String },
  Goto { target: Label },
  Branch { taken: Label, not_taken: Label },
  Return,
  Throw,
  /// Dead control flow.
  Trap,
}

pub fn i_op(words: u32) -> Inst {
  Inst::Op { words }
}
pub fn i_word(value: u32) -> Inst {
  Inst::Word { value }
}
pub fn i_call(callee: &str) -> Inst {
  Inst::Call { callee: callee.to_string(), no_return: false }
}
pub fn i_call_noreturn(callee: &str) -> Inst {
  Inst::Call { callee: callee.to_string(), no_return: true }
}
pub fn i_load_addr(target: &str) -> Inst {
  Inst::LoadAddr { target: target.to_string() }
}
pub fn i_goto(target: &str) -> Inst {
  Inst::Goto { target: Label::Unresolved { name: target.to_string() } }
}
pub fn i_branch(taken: &str, not_taken: &str) -> Inst {
  Inst::Branch {
    taken: Label::Unresolved { name: taken.to_string() },
    not_taken: Label::Unresolved { name: not_taken.to_string() },
  }
}
pub fn i_ret() -> Inst {
  Inst::Return
}
pub fn i_throw() -> Inst {
  Inst::Throw
}
pub fn i_trap() -> Inst {
  Inst::Trap
}

impl fmt::Debug for Inst {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Inst::Op { words } => write!(fmt, "op {}", words),
      Inst::Word { value } => write!(fmt, "word {:#x}", value),
      Inst::Call { callee, no_return: false } => write!(fmt, "call {}", callee),
      Inst::Call { callee, no_return: true } => {
        write!(fmt, "call_noreturn {}", callee)
      }
      Inst::LoadAddr { target } => write!(fmt, "load {}", target),
      Inst::Goto { target } => write!(fmt, "goto {}", target.name()),
      Inst::Branch { taken, not_taken } => {
        write!(fmt, "branch {}, {}", taken.name(), not_taken.name())
      }
      Inst::Return => write!(fmt, "ret"),
      Inst::Throw => write!(fmt, "throw"),
      Inst::Trap => write!(fmt, "trap"),
    }
  }
}

impl Inst {
  pub fn is_control_flow(&self) -> bool {
    match self {
      Inst::Goto { .. }
      | Inst::Branch { .. }
      | Inst::Return
      | Inst::Throw
      | Inst::Trap => true,
      _ => false,
    }
  }

  pub fn getTargets(&self) -> Vec<&Label> {
    match self {
      Inst::Goto { target } => vec![target],
      Inst::Branch { taken, not_taken } => vec![taken, not_taken],
      _ => vec![],
    }
  }
}

//=============================================================================
// Definition of Block, Func and Module, and printing thereof.

#[derive(Clone, Debug)]
pub struct Protection {
  pub handler: Label,
  pub filter: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct Block {
  pub name: String,
  pub start: InstIx,
  pub len: u32,
  /// Innermost first.
  pub protection: Vec<Protection>,
}
impl Block {
  pub fn new(name: String, start: InstIx, len: u32) -> Self {
    Self { name, start, len, protection: Vec::new() }
  }
}

#[derive(Clone, Debug)]
pub struct Func {
  pub name: String,
  pub entry: Label,
  pub insns: TypedIxVec<InstIx, Inst>, // indexed by InstIx

  // Note that |blocks| must be in order of increasing |Block::start|
  // fields.
  pub blocks: TypedIxVec<BlockIx, Block>, // indexed by BlockIx

  /// (type, parent) pairs of the exception type hierarchy.
  pub type_parents: Vec<(u32, u32)>,

  // Filled in by |finish|.
  is_handler: Vec<bool>,
}

// Find a block Ix for a block name
fn lookup(blocks: &TypedIxVec<BlockIx, Block>, name: &str) -> Option<BlockIx> {
  blocks.range().into_iter().find(|bix| blocks[*bix].name == name)
}

impl Func {
  pub fn new(name: &str, entry: &str) -> Self {
    Func {
      name: name.to_string(),
      entry: Label::Unresolved { name: entry.to_string() },
      insns: TypedIxVec::<InstIx, Inst>::new(),
      blocks: TypedIxVec::<BlockIx, Block>::new(),
      type_parents: Vec::new(),
      is_handler: Vec::new(),
    }
  }

  pub fn set_entry(&mut self, entry: &str) {
    self.entry = Label::Unresolved { name: entry.to_string() };
  }

  pub fn print(&self, who: &str) {
    let mut s = String::new();
    self.render(&mut s);
    println!("");
    println!("Func {}: name='{}' entry='{:?}' {{", who, self.name, self.entry);
    print!("{}", s);
    println!("}}");
  }

  /// Render in the syntax the parser reads.
  pub fn render(&self, out: &mut String) {
    out.push_str(&format!("method {} {{\n", self.name));
    for (t, p) in self.type_parents.iter() {
      out.push_str(&format!("  type {} : {}\n", t, p));
    }
    // The entry block goes first, so that the parser finds it.
    let entry = self.entry.getBlockIx();
    let mut order: Vec<BlockIx> = self.blocks.range().into_iter().collect();
    if let Some(e) = entry {
      order.retain(|b| *b != e);
      order.insert(0, e);
    }
    for bix in order {
      let b = &self.blocks[bix];
      out.push_str(&format!("{}:\n", b.name));
      for i in b.start.get()..b.start.get() + b.len {
        out.push_str(&format!("  {:?}\n", self.insns[InstIx::new(i)]));
      }
    }
    for b in self.blocks.iter() {
      for p in b.protection.iter() {
        match p.filter {
          Some(ty) => out.push_str(&format!(
            "  protect {} -> {} catch {}\n",
            b.name,
            p.handler.name(),
            ty
          )),
          None => out.push_str(&format!(
            "  protect {} -> {}\n",
            b.name,
            p.handler.name()
          )),
        }
      }
    }
    out.push_str("}\n");
  }

  // Add a block to the Func
  pub fn block(&mut self, name: &str, insns: Vec<Inst>) {
    let start = self.insns.len();
    let len = insns.len() as u32;
    for i in insns {
      self.insns.push(i);
    }
    self.blocks.push(Block::new(name.to_string(), InstIx::new(start), len));
  }

  /// Protect `block` with `handler`.  Clauses added first are innermost.
  pub fn protect(&mut self, block: &str, handler: &str, filter: Option<u32>) {
    let protection = Protection {
      handler: Label::Unresolved { name: handler.to_string() },
      filter,
    };
    for bix in self.blocks.range() {
      if self.blocks[bix].name == block {
        self.blocks[bix].protection.push(protection);
        return;
      }
    }
    // Unknown blocks are caught by |finish|.
    self.blocks.push(Block {
      name: block.to_string(),
      start: InstIx::new(self.insns.len()),
      len: 0,
      protection: vec![protection],
    });
  }

  // All blocks have been added.  Resolve labels and we're good to go.
  /* .finish(): check
        - all blocks nonempty
        - all blocks end in a control flow insn, and have no other
        - all referenced blocks actually exist
        - convert references to block numbers
  */
  pub fn finish(&mut self) -> Result<(), String> {
    for bix in self.blocks.range() {
      let b = &self.blocks[bix];
      if b.len == 0 {
        return Err(format!("block {} is empty", b.name));
      }
      for i in 0..b.len {
        let iix = b.start.plus(i);
        let cf = self.insns[iix].is_control_flow();
        if i == b.len - 1 && !cf {
          return Err(format!("block {} must end in control flow", b.name));
        }
        if i != b.len - 1 && cf {
          return Err(format!(
            "block {} contains control flow before its end",
            b.name
          ));
        }
      }
    }

    // Resolve all labels
    let blocks = &self.blocks;
    for i in self.insns.iter_mut() {
      match i {
        Inst::Goto { target } => resolveLabel(target, blocks)?,
        Inst::Branch { taken, not_taken } => {
          resolveLabel(taken, blocks)?;
          resolveLabel(not_taken, blocks)?;
        }
        _ => {}
      }
    }
    resolveLabel(&mut self.entry, blocks)?;
    let mut protections = Vec::new();
    for b in self.blocks.iter() {
      let mut ps = b.protection.clone();
      for p in ps.iter_mut() {
        resolveLabel(&mut p.handler, blocks)?;
      }
      protections.push(ps);
    }
    let mut is_handler = vec![false; self.blocks.len() as usize];
    for (b, ps) in self.blocks.iter_mut().zip(protections.into_iter()) {
      for p in ps.iter() {
        if let Some(h) = p.handler.getBlockIx() {
          is_handler[h.get() as usize] = true;
        }
      }
      b.protection = ps;
    }
    self.is_handler = is_handler;
    Ok(())
  }

  fn last_insn(&self, block: BlockIx) -> &Inst {
    let b = &self.blocks[block];
    &self.insns[b.start.plus(b.len - 1)]
  }
}

fn resolveLabel(
  label: &mut Label, blocks: &TypedIxVec<BlockIx, Block>,
) -> Result<(), String> {
  let name = label.name().to_string();
  match lookup(blocks, &name) {
    Some(bix) => {
      *label = Label::Resolved { name, bix };
      Ok(())
    }
    None => Err(format!("can't resolve label name '{}'", name)),
  }
}

impl Function for Func {
  fn name(&self) -> &str {
    &self.name
  }

  fn blocks(&self) -> MyRange<BlockIx> {
    self.blocks.range()
  }

  fn entry_block(&self) -> BlockIx {
    self.entry.getBlockIx().unwrap_or(BlockIx::new(0))
  }

  fn block_insns(&self, block: BlockIx) -> MyRange<InstIx> {
    let b = &self.blocks[block];
    MyRange::new(b.start, b.len as usize)
  }

  fn block_succs(&self, block: BlockIx) -> Vec<BlockIx> {
    let mut succs: Vec<BlockIx> = self
      .last_insn(block)
      .getTargets()
      .iter()
      .filter_map(|l| l.getBlockIx())
      .collect();
    for p in self.blocks[block].protection.iter() {
      if let Some(h) = p.handler.getBlockIx() {
        succs.push(h);
      }
    }
    succs
  }

  fn is_exception_handler(&self, block: BlockIx) -> bool {
    self.is_handler.get(block.get() as usize).cloned().unwrap_or(false)
  }

  fn is_dead(&self, block: BlockIx) -> bool {
    *self.last_insn(block) == Inst::Trap
  }

  fn is_no_return_call(&self, insn: InstIx) -> bool {
    match &self.insns[insn] {
      Inst::Call { no_return, .. } => *no_return,
      _ => false,
    }
  }

  fn block_handlers(&self, block: BlockIx) -> Vec<HandlerClause> {
    self.blocks[block]
      .protection
      .iter()
      .filter_map(|p| {
        p.handler.getBlockIx().map(|handler| HandlerClause {
          handler,
          filter: p.filter.map(ExceptionType),
        })
      })
      .collect()
  }

  fn is_subtype_of(&self, ty: ExceptionType, of: ExceptionType) -> bool {
    let mut cur = ty.0;
    // Bounded, in case the hierarchy has a cycle.
    for _ in 0..=self.type_parents.len() {
      if cur == of.0 {
        return true;
      }
      match self.type_parents.iter().find(|(t, _)| *t == cur) {
        Some((_, parent)) => cur = *parent,
        None => return false,
      }
    }
    false
  }
}

/// A whole program: methods plus data.
#[derive(Clone, Debug)]
pub struct Module {
  pub name: String,
  pub funcs: Vec<Func>,
  pub data: Vec<DataItem>,
}

impl Module {
  pub fn new(name: &str) -> Self {
    Module { name: name.to_string(), funcs: Vec::new(), data: Vec::new() }
  }

  pub fn single(func: Func) -> Self {
    let mut m = Module::new(&func.name);
    m.funcs.push(func);
    m
  }

  pub fn data_words(&mut self, name: &str, words: &[u32], refs: &[(u32, &str)]) {
    let mut item = DataItem::new(
      name,
      words.iter().flat_map(|w| w.to_le_bytes().to_vec()).collect(),
    );
    for (offset, target) in refs {
      item.refs.push(DataRef {
        offset: *offset,
        target: target.to_string(),
        addend: 0,
      });
    }
    self.data.push(item);
  }

  pub fn print(&self) {
    for f in self.funcs.iter() {
      f.print("in module");
    }
    for d in self.data.iter() {
      println!("data {} ({} bytes, {} refs)", d.name, d.payload.len(), d.refs.len());
    }
  }
}

//=============================================================================
// The toy encoder.  Words are little-endian; the numbers are borrowed from
// a well-known 32-bit encoding but nothing executes them.

pub const INSN_NOP: u32 = 0xE320_F000;
pub const INSN_B: u32 = 0xEA00_0000;
pub const INSN_BEQ: u32 = 0x0A00_0000;
pub const INSN_BNE_SKIP: u32 = 0x1A00_0001;
pub const INSN_BL: u32 = 0xEB00_0000;
pub const INSN_LDR_PC: u32 = 0xE51F_F004;
pub const INSN_LDR_LIT: u32 = 0xE59F_0000;
pub const INSN_ADD_LR: u32 = 0xE28F_E004;
pub const INSN_BX_LR: u32 = 0xE12F_FF1E;
pub const INSN_SVC_THROW: u32 = 0xEF00_0001;
pub const INSN_UDF: u32 = 0xE7F0_00F0;

/// Relative branches carry a signed byte displacement in their low bits.
/// Level 0 is a single relative word; level 1 loads an absolute address.
pub struct ToyEncoder {
  pub branch_bits: u8,
  pub call_bits: u8,
}

impl Default for ToyEncoder {
  fn default() -> Self {
    ToyEncoder { branch_bits: 16, call_bits: 24 }
  }
}

impl ToyEncoder {
  fn jump(&self, sink: &mut EmitSink, target: BlockIx) {
    let t = sink.block_target(target);
    if sink.encoding_level() == 0 {
      sink.add_relative(t, self.branch_bits, INSN_B);
    } else {
      sink.emit_u32(INSN_LDR_PC);
      sink.add_absolute(t, 0);
    }
  }
}

impl Encoder<Func> for ToyEncoder {
  fn min_size(&self, func: &Func, insn: InstIx) -> u32 {
    match &func.insns[insn] {
      Inst::Op { words } => 4 * words,
      Inst::Word { .. } => 4,
      Inst::Call { .. } => 4,
      Inst::LoadAddr { .. } => 8,
      // Vanishes when the target is next.
      Inst::Goto { .. } => 0,
      Inst::Branch { .. } => 4,
      Inst::Return | Inst::Throw | Inst::Trap => 4,
    }
  }

  fn emit(
    &self, func: &Func, insn: InstIx, sink: &mut EmitSink,
  ) -> Result<(), ImageError> {
    let unresolved = |l: &Label| ImageError::UnresolvedTarget {
      what: format!("label {:?} in {}", l, func.name),
    };
    match &func.insns[insn] {
      Inst::Op { words } => {
        for n in 0..*words {
          sink.emit_u32(0xE280_0000 | (n & 0xFF));
        }
      }
      Inst::Word { value } => sink.emit_u32(*value),
      Inst::Call { callee, .. } => {
        let t = sink.method_target(callee)?;
        if sink.encoding_level() == 0 {
          sink.add_relative(t, self.call_bits, INSN_BL);
        } else {
          sink.emit_u32(INSN_ADD_LR);
          sink.emit_u32(INSN_LDR_PC);
          sink.add_absolute(t, 0);
        }
      }
      Inst::LoadAddr { target } => {
        let t = match sink.method_target(target) {
          Ok(t) => t,
          Err(_) => sink.data_target(target)?,
        };
        sink.emit_u32(INSN_LDR_LIT);
        sink.add_absolute(t, 0);
      }
      Inst::Goto { target } => {
        let bix = target.getBlockIx().ok_or_else(|| unresolved(target))?;
        if !sink.falls_through_to(bix) {
          self.jump(sink, bix);
        }
      }
      Inst::Branch { taken, not_taken } => {
        let t = taken.getBlockIx().ok_or_else(|| unresolved(taken))?;
        let nt = not_taken.getBlockIx().ok_or_else(|| unresolved(not_taken))?;
        let target = sink.block_target(t);
        if sink.encoding_level() == 0 {
          sink.add_relative(target, self.branch_bits, INSN_BEQ);
        } else {
          sink.emit_u32(INSN_BNE_SKIP);
          sink.emit_u32(INSN_LDR_PC);
          sink.add_absolute(target, 0);
        }
        if !sink.falls_through_to(nt) {
          self.jump(sink, nt);
        }
      }
      Inst::Return => sink.emit_u32(INSN_BX_LR),
      Inst::Throw => sink.emit_u32(INSN_SVC_THROW),
      Inst::Trap => sink.emit_u32(INSN_UDF),
    }
    Ok(())
  }

  fn fill_empty_region(&self, region: &mut Region) {
    region.emit_u32(INSN_NOP);
  }

  fn max_encoding_level(&self) -> u8 {
    1
  }
}

//=============================================================================
// The toy target: code in flash, which is programmed ahead of time, and
// data in RAM, which the loader fills from the relocation records.

pub const FLASH_BASE: u32 = 0x0800_0000;
pub const RAM_BASE: u32 = 0x2000_0000;

#[derive(Clone, Debug)]
pub struct ToyPlatform {
  pub flash_size: u32,
  pub ram_size: u32,
  pub cold_alignment: u32,
}

impl Default for ToyPlatform {
  fn default() -> Self {
    ToyPlatform { flash_size: 0x10_0000, ram_size: 0x1_0000, cold_alignment: 4 }
  }
}

impl Platform for ToyPlatform {
  fn memory_map(&self) -> Vec<MemoryRange> {
    vec![
      MemoryRange::new(
        FLASH_BASE,
        FLASH_BASE + self.flash_size,
        MemoryAttributes::FLASH
          | MemoryAttributes::READ
          | MemoryAttributes::EXECUTE
          | MemoryAttributes::LOADED_AT_ENTRYPOINT,
        MemoryUsage::CODE,
      )
      .with_section("text"),
      MemoryRange::new(
        RAM_BASE,
        RAM_BASE + self.ram_size,
        MemoryAttributes::RAM | MemoryAttributes::READ | MemoryAttributes::WRITE,
        MemoryUsage::DATA,
      )
      .with_section("data"),
    ]
  }

  fn code_placement(&self, cold: bool) -> PlacementRequirements {
    let align = if cold { self.cold_alignment } else { 4 };
    PlacementRequirements::new(align, MemoryUsage::CODE)
  }

  fn data_placement(&self) -> PlacementRequirements {
    PlacementRequirements::new(4, MemoryUsage::DATA)
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn finish_resolves_labels() {
    let mut f = Func::new("f", "a");
    f.block("a", vec![i_op(1), i_branch("b", "c")]);
    f.block("b", vec![i_throw()]);
    f.block("c", vec![i_ret()]);
    f.block("h", vec![i_goto("c")]);
    f.protect("b", "h", Some(3));
    f.finish().unwrap();
    assert_eq!(f.entry_block(), BlockIx::new(0));
    assert_eq!(f.block_succs(BlockIx::new(0)), vec![BlockIx::new(1), BlockIx::new(2)]);
    assert_eq!(f.block_succs(BlockIx::new(1)), vec![BlockIx::new(3)]);
    assert!(f.is_exception_handler(BlockIx::new(3)));
    assert!(!f.is_exception_handler(BlockIx::new(1)));
  }

  #[test]
  fn finish_rejects_bad_blocks() {
    let mut f = Func::new("f", "a");
    f.block("a", vec![i_op(1)]);
    assert!(f.finish().is_err());

    let mut f = Func::new("f", "a");
    f.block("a", vec![i_goto("nowhere")]);
    assert!(f.finish().is_err());

    let mut f = Func::new("f", "a");
    f.block("a", vec![i_ret(), i_op(1), i_ret()]);
    assert!(f.finish().is_err());

    let mut f = Func::new("f", "a");
    f.block("a", vec![i_ret()]);
    f.protect("b", "a", None);
    assert!(f.finish().is_err());
  }

  #[test]
  fn subtypes_follow_parents() {
    let mut f = Func::new("f", "a");
    f.block("a", vec![i_ret()]);
    f.type_parents = vec![(3, 2), (2, 1), (5, 5)];
    f.finish().unwrap();
    assert!(f.is_subtype_of(ExceptionType(3), ExceptionType(1)));
    assert!(!f.is_subtype_of(ExceptionType(1), ExceptionType(3)));
    assert!(!f.is_subtype_of(ExceptionType(5), ExceptionType(1)));
  }
}
