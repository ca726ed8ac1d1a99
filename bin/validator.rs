/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Structural checks: of a module before layout, and of the image it was
//! laid out into.

use crate::test_framework::*;
use codelayout::{
  reconstruct_relocations, BlockIx, Function, ImageLayout, MemoryAttributes,
  MemoryUsage, MethodIx, Platform, Set, SortedLinkerHeap,
};

use rustc_hash::FxHashMap;

/// Is the module well formed enough to lay out?
pub fn validate_module(module: &Module) -> Result<(), String> {
  let mut names = FxHashMap::default();
  for f in module.funcs.iter() {
    if names.insert(f.name.clone(), ()).is_some() {
      return Err(format!("duplicate name {}", f.name));
    }
    validate_func(f)?;
  }
  for d in module.data.iter() {
    if names.insert(d.name.clone(), ()).is_some() {
      return Err(format!("duplicate name {}", d.name));
    }
    if d.payload.is_empty() {
      return Err(format!("data {} is empty", d.name));
    }
  }
  for f in module.funcs.iter() {
    for i in f.insns.iter() {
      let used = match i {
        Inst::Call { callee, .. } => Some(callee),
        Inst::LoadAddr { target } => Some(target),
        _ => None,
      };
      if let Some(name) = used {
        if !names.contains_key(name) {
          return Err(format!("{} refers to unknown {}", f.name, name));
        }
      }
    }
  }
  for d in module.data.iter() {
    for r in d.refs.iter() {
      if !names.contains_key(&r.target) {
        return Err(format!("data {} refers to unknown {}", d.name, r.target));
      }
      if r.offset as usize + 4 > d.payload.len() {
        return Err(format!("data {} has a reference past its end", d.name));
      }
    }
  }
  Ok(())
}

pub fn validate_func(func: &Func) -> Result<(), String> {
  let num_blocks = func.blocks.len();
  // Function entry must exist and point to a valid block.
  match func.entry.getBlockIx() {
    Some(bix) if bix.get() < num_blocks => {}
    _ => return Err("invalid or unresolved entry label".into()),
  }
  for b in func.blocks.iter() {
    if b.len == 0 {
      return Err(format!("block {} is empty", b.name));
    }
    if b.start.get().checked_add(b.len).map_or(true, |end| end > func.insns.len()) {
      return Err(format!("block {} runs past the end", b.name));
    }
    for i in 0..b.len {
      let insn = &func.insns[b.start.plus(i)];
      if insn.is_control_flow() != (i == b.len - 1) {
        return Err(format!("block {} is badly terminated", b.name));
      }
      for l in insn.getTargets() {
        match l.getBlockIx() {
          Some(bix) if bix.get() < num_blocks => {}
          _ => return Err(format!("bad label {:?} in {}", l, b.name)),
        }
      }
    }
    for p in b.protection.iter() {
      match p.handler.getBlockIx() {
        Some(bix) if bix.get() < num_blocks => {}
        _ => return Err(format!("bad handler {:?} for {}", p.handler, b.name)),
      }
    }
  }
  Ok(())
}

fn check_schedule(func: &Func, layout: &ImageLayout, m: usize) -> Result<(), String> {
  let s = &layout.schedules[m];
  let mut seen = Set::<BlockIx>::empty();
  let mut saw_cold = false;
  for (n, bix) in s.order().iter().enumerate() {
    if !seen.insert(*bix) {
      return Err(format!("{}: {:?} scheduled twice", func.name, bix));
    }
    if s.scheduling_index(*bix) != Some(n as u32) {
      return Err(format!("{}: {:?} has the wrong index", func.name, bix));
    }
    if s.is_cold(*bix) {
      saw_cold = true;
    } else if saw_cold {
      return Err(format!("{}: hot {:?} after cold code", func.name, bix));
    }
  }
  if !s.is_scheduled(func.entry_block()) {
    return Err(format!("{}: entry block unscheduled", func.name));
  }

  // Every scheduled block, and every zero-length block, has an address,
  // and fall-through neighbours really touch.
  for bix in func.blocks.range() {
    if s.is_scheduled(bix) && layout.block_address(MethodIx::new(m as u32), bix).is_none() {
      return Err(format!("{}: {:?} has no address", func.name, bix));
    }
  }
  for pair in s.order().windows(2) {
    if !s.are_blocks_adjacent(pair[0], pair[1]) {
      continue;
    }
    let mix = MethodIx::new(m as u32);
    let start = layout.block_address(mix, pair[0]);
    let next = layout.block_address(mix, pair[1]);
    let region = start.and_then(|a| layout.resolve_address_to_region(a));
    match (region, next) {
      (Some(r), Some(n)) if r.address + r.size == n => {}
      _ => {
        return Err(format!(
          "{}: {:?} and {:?} are adjacent in the schedule but not in memory",
          func.name, pair[0], pair[1]
        ))
      }
    }
  }

  let mut grouped = 0;
  for g in s.groups().iter() {
    for bix in g.iter() {
      if !seen.contains(*bix) {
        return Err(format!("{}: group holds unscheduled {:?}", func.name, bix));
      }
      grouped += 1;
    }
  }
  if grouped != s.order().len() {
    return Err(format!("{}: groups don't partition the schedule", func.name));
  }
  Ok(())
}

/// Check a finished layout against the module and platform it came from.
pub fn validate_layout<P: Platform>(
  module: &Module, platform: &P, layout: &ImageLayout,
) -> Result<(), String> {
  for (m, func) in module.funcs.iter().enumerate() {
    check_schedule(func, layout, m)?;
  }

  // Regions sit inside the memory map, sorted, without overlapping.
  let memory = platform.memory_map();
  for pair in layout.regions.windows(2) {
    let (a, b) = (&pair[0], &pair[1]);
    if (a.address, a.address + a.size, a.index) >= (b.address, b.address + b.size, b.index) {
      return Err(format!("regions {:?} and {:?} are out of order", a.index, b.index));
    }
    if a.address + a.size > b.address {
      return Err(format!("regions {:?} and {:?} overlap", a.index, b.index));
    }
  }
  for r in layout.regions.iter() {
    let inside = memory
      .iter()
      .any(|mr| mr.start <= r.address && r.address + r.size <= mr.end);
    if !inside {
      return Err(format!("region {} lies outside memory", r.context));
    }
  }

  // The heap can be rebuilt from the placed regions.
  let spans: Vec<(u32, u32)> =
    layout.regions.iter().map(|r| (r.address, r.address + r.size)).collect();
  let mut heap = SortedLinkerHeap::new(&memory);
  heap.rebuild_from_regions(&memory, &spans);
  heap.check()?;
  let used: u64 = spans.iter().map(|(s, e)| (e - s) as u64).sum();
  let total: u64 = memory.iter().map(|m| (m.end - m.start) as u64).sum();
  if heap.free_bytes() + used > total {
    return Err("heap accounting is off".to_string());
  }

  // Every relocated section comes back out of the relocation records.
  let replayed = reconstruct_relocations(&layout.relocations);
  for s in layout.sections.iter() {
    let loaded = memory.iter().any(|m| {
      m.contains(s.address)
        && (m.attributes.contains(MemoryAttributes::LOADED_AT_ENTRYPOINT)
          || m.usage.contains(MemoryUsage::RELOCATION))
    });
    if loaded {
      continue;
    }
    let found = replayed.iter().any(|(a, bytes)| {
      *a <= s.address
        && s.address + s.bytes.len() as u32 <= *a + bytes.len() as u32
        && bytes[(s.address - a) as usize..][..s.bytes.len()] == s.bytes[..]
    });
    if !found {
      return Err(format!("section at {:#x} is missing from the relocations", s.address));
    }
  }

  // Exception tables are sorted and point at handler code.
  for (m, em) in layout.exception_maps.iter().enumerate() {
    let mut last_end = 0;
    for rng in em.ranges() {
      if rng.start >= rng.end || rng.start < last_end {
        return Err(format!("method {}: bad exception range", m));
      }
      last_end = rng.end;
      for h in rng.handlers.iter() {
        if layout.resolve_address_to_region(h.handler).is_none() {
          return Err(format!("method {}: handler at {:#x} isn't code", m, h.handler));
        }
      }
    }
  }
  Ok(())
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::test_cases::find_case;

  #[test]
  fn bad_modules_are_caught() {
    let mut module = find_case("calls_and_data").unwrap();
    assert!(validate_module(&module).is_ok());
    module.data[0].refs[0].target = "nobody".to_string();
    assert!(validate_module(&module).is_err());

    let mut module = find_case("diamond").unwrap();
    module.funcs[0].blocks[BlockIx::new(1)].len = 0;
    assert!(validate_module(&module).is_err());

    let mut module = find_case("diamond").unwrap();
    let dup = module.funcs[0].clone();
    module.funcs.push(dup);
    assert!(validate_module(&module).is_err());
  }
}
