//! Implements fuzzing primitives for everything.

use arbitrary::{Arbitrary, Result, Unstructured};

use crate::test_framework::*;

pub const FUZZ_FUNC_NAME: &str = "funk";
const MAX_BLOCKS: u8 = 24;

struct FuzzingEnv {
  num_blocks: u8,
}

impl FuzzingEnv {
  fn block_name(&self, u: &mut Unstructured) -> Result<String> {
    Ok(format!("b{}", u8::arbitrary(u)? % self.num_blocks))
  }

  fn inst(&self, u: &mut Unstructured) -> Result<Inst> {
    Ok(match u8::arbitrary(u)? % 8 {
      0 => i_word(u32::arbitrary(u)?),
      1 => i_call(FUZZ_FUNC_NAME),
      2 => {
        if u8::arbitrary(u)? % 4 == 0 {
          i_call_noreturn(FUZZ_FUNC_NAME)
        } else {
          i_call(FUZZ_FUNC_NAME)
        }
      }
      3 => i_load_addr(FUZZ_FUNC_NAME),
      // Mostly small, sometimes big enough to push branches out of reach.
      4 => i_op(u16::arbitrary(u)? as u32 % 0x800),
      _ => i_op(u8::arbitrary(u)? as u32 % 8),
    })
  }

  fn inst_control_flow(&self, u: &mut Unstructured) -> Result<Inst> {
    Ok(match u8::arbitrary(u)? % 10 {
      0..=3 => i_goto(&self.block_name(u)?),
      4..=6 => i_branch(&self.block_name(u)?, &self.block_name(u)?),
      7 => i_throw(),
      8 => i_trap(),
      _ => i_ret(),
    })
  }
}

impl<'a> Arbitrary<'a> for Func {
  fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Func> {
    let num_blocks = 1 + (u8::arbitrary(u)? % MAX_BLOCKS);
    let env = FuzzingEnv { num_blocks };

    let mut func = Func::new(FUZZ_FUNC_NAME, "b0");
    for t in 2..5 {
      if bool::arbitrary(u)? {
        func.type_parents.push((t, t / 2));
      }
    }

    for cur_block in 0..num_blocks {
      let num_block_insts = u8::arbitrary(u)? % 4;
      let mut insts = Vec::new();
      for _ in 0..num_block_insts {
        insts.push(env.inst(u)?);
      }
      insts.push(env.inst_control_flow(u)?);
      func.block(&format!("b{}", cur_block), insts);
    }

    let num_protections = u8::arbitrary(u)? % 4;
    for _ in 0..num_protections {
      let protected = env.block_name(u)?;
      let handler = env.block_name(u)?;
      let filter = match u8::arbitrary(u)? % 5 {
        0 => None,
        n => Some(n as u32),
      };
      func.protect(&protected, &handler, filter);
    }

    func.finish().map_err(|_| arbitrary::Error::IncorrectFormat)?;
    Ok(func)
  }
}

/// One request to the linker heap.
#[derive(Arbitrary, Debug)]
pub struct HeapRequest {
  pub size: u16,
  pub align_log2: u8,
  pub offset: u8,
  pub from_high_address: bool,
  pub data: bool,
}

/// A memory map, and a sequence of allocations against it.
#[derive(Arbitrary, Debug)]
pub struct HeapScript {
  /// (start, length) in units of 16 bytes; overlapping ranges are allowed.
  pub ranges: Vec<(u16, u16)>,
  pub requests: Vec<HeapRequest>,
}
