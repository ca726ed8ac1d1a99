/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

use codelayout::{layout_image, ImageLayout, LayoutError, LayoutOptions};
use minilayout::test_cases;
use minilayout::test_framework::{Module, ToyEncoder, ToyPlatform};
use minilayout::validator::{validate_layout, validate_module};

use clap::{Arg, Command};
use log::{error, info};

use std::fs::File;
use std::io::BufWriter;

//=============================================================================
// Top level

fn main() {
  pretty_env_logger::init();

  let app = Command::new("minilayout")
    .about("a simple program to allow separate testing of codelayout")
    .arg(
      Arg::new("test")
        .short('t')
        .long("test")
        .takes_value(true)
        .required(true)
        .help("test case name (built in, or tests/<name>.lay)"),
    )
    .arg(
      Arg::new("cold-first-pass")
        .short('c')
        .long("cold-first-pass")
        .help("place each method's cold code right after its hot code"),
    )
    .arg(
      Arg::new("max-restarts")
        .short('r')
        .long("max-restarts")
        .takes_value(true)
        .help("how often the image may be re-emitted (8 if not set)"),
    )
    .arg(
      Arg::new("output")
        .short('o')
        .long("output")
        .takes_value(true)
        .help("write the serialized image to this file"),
    )
    .arg(Arg::new("dump").short('d').long("dump").help("print the image map"));
  let matches = app.get_matches();

  let case_name = matches.value_of("test").unwrap_or_default();
  let module = match test_cases::find_case(case_name) {
    Ok(module) => module,
    Err(available_names) => {
      error!("can't find test case with name '{}'", case_name);
      println!("available test cases are:");
      for name in available_names {
        println!("     {}", name);
      }
      return;
    }
  };

  let mut options = LayoutOptions::default();
  options.include_cold_code_in_first_pass = matches.is_present("cold-first-pass");
  if let Some(r) = matches.value_of("max-restarts") {
    match r.parse::<u32>() {
      Ok(r) => options.max_restarts = r,
      Err(_) => {
        println!("invalid max-restarts value: {}", r);
        return;
      }
    }
  }

  if let Err(msg) = validate_module(&module) {
    println!("invalid test case: {}", msg);
    return;
  }
  module.print();

  let platform = ToyPlatform::default();
  let layout = match run_layout(&module, &platform, &options) {
    Ok(layout) => layout,
    Err(err) => {
      println!("layout failed: {}", err);
      return;
    }
  };
  info!("laid out {} in {} restarts", module.name, layout.restarts);

  if let Err(msg) = validate_layout(&module, &platform, &layout) {
    println!("validation failed: {}", msg);
    return;
  }

  if matches.is_present("dump") {
    dump_layout(&module, &layout);
  }

  if let Some(path) = matches.value_of("output") {
    let written = File::create(path)
      .map_err(|e| e.to_string())
      .and_then(|f| {
        bincode::serialize_into(BufWriter::new(f), &layout).map_err(|e| e.to_string())
      });
    match written {
      Ok(()) => println!("wrote {}", path),
      Err(msg) => println!("can't write {}: {}", path, msg),
    }
  }
}

fn run_layout(
  module: &Module, platform: &ToyPlatform, options: &LayoutOptions,
) -> Result<ImageLayout, LayoutError> {
  layout_image(&module.funcs, &module.data, &ToyEncoder::default(), platform, options)
}

fn dump_layout(module: &Module, layout: &ImageLayout) {
  println!("");
  println!("Image map of '{}' ({} restarts) {{", module.name, layout.restarts);
  for r in layout.regions.iter() {
    println!(
      "  {:#010x} {:6}  {}  {}",
      r.address,
      r.size,
      if r.cold { "cold" } else { "hot " },
      r.context
    );
  }
  println!("}}");
  for ((f, cm), s) in
    module.funcs.iter().zip(layout.code_maps.iter()).zip(layout.schedules.iter())
  {
    let order: Vec<&str> =
      s.order().iter().map(|b| f.blocks[*b].name.as_str()).collect();
    println!("method {}: {:?}", cm.method, order);
    for (s, e) in cm.ranges.iter() {
      println!("  code {:#010x}..{:#010x}", s, e);
    }
  }
  for (f, em) in module.funcs.iter().zip(layout.exception_maps.iter()) {
    for rng in em.ranges() {
      println!(
        "  {}: protect {:#010x}..{:#010x} -> {:?}",
        f.name, rng.start, rng.end, rng.handlers
      );
    }
  }
  for s in layout.sections.iter() {
    println!("section {:#010x}, {} bytes", s.address, s.bytes.len());
  }
  println!("{} relocation records", layout.relocations.len());
}

#[cfg(test)]
mod test_utils {
  use super::*;
  use codelayout::{BlockIx, MethodIx};
  use minilayout::test_framework::Func;

  pub fn run(name: &str, options: &LayoutOptions) -> (Module, ImageLayout) {
    let _ = pretty_env_logger::try_init();
    let module = test_cases::find_case(name).unwrap();
    validate_module(&module).unwrap();
    let platform = ToyPlatform::default();
    let layout = run_layout(&module, &platform, options).unwrap_or_else(|err| {
      panic!("layout of {} failed: {}", name, err);
    });
    validate_layout(&module, &platform, &layout).unwrap_or_else(|msg| {
      panic!("layout of {} is broken: {}", name, msg);
    });
    (module, layout)
  }

  pub fn check(name: &str) -> (Module, ImageLayout) {
    run(name, &LayoutOptions::default())
  }

  pub fn block(func: &Func, name: &str) -> BlockIx {
    func
      .blocks
      .range()
      .into_iter()
      .find(|b| func.blocks[*b].name == name)
      .unwrap()
  }

  pub fn address(
    module: &Module, layout: &ImageLayout, method: &str, name: &str,
  ) -> u32 {
    let m = module.funcs.iter().position(|f| f.name == method).unwrap();
    let bix = block(&module.funcs[m], name);
    layout.block_address(MethodIx::new(m as u32), bix).unwrap()
  }

  pub fn word_at(layout: &ImageLayout, address: u32) -> u32 {
    let r = layout.resolve_address_to_region(address).unwrap();
    let at = (address - r.address) as usize;
    let b = &r.payload[at..at + 4];
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
  }
}

#[test]
fn all_builtin_cases_validate() {
  for name in test_cases::builtin_names() {
    test_utils::check(name);
  }
}

#[test]
fn straight_line_falls_through() {
  let (module, layout) = test_utils::check("straight_line");
  assert_eq!(layout.restarts, 0);
  // Nothing but the work and the return: every goto is elided.
  assert_eq!(layout.code_size(), 4 * (2 + 1 + 1));
  let start = test_utils::address(&module, &layout, "straight_line", "start");
  let end = test_utils::address(&module, &layout, "straight_line", "end");
  assert_eq!(end - start, 12);
}

#[test]
fn nested_loops_stay_together() {
  let (module, layout) = test_utils::check("nested_loops");
  let f = &module.funcs[0];
  let s = &layout.schedules[0];
  let pos = |name: &str| {
    let b = test_utils::block(f, name);
    s.scheduling_index(b).unwrap() as i64
  };
  assert_eq!(pos("entry"), 0);
  assert_eq!((pos("inner") - pos("inner_latch")).abs(), 1);
}

#[test]
fn far_branches_are_reencoded() {
  let (module, layout) = test_utils::check("far_branch");
  assert!(layout.restarts >= 1);
  let far = test_utils::address(&module, &layout, "far_branch", "far");
  let entry = test_utils::address(&module, &layout, "far_branch", "entry");
  // Some absolute word in the entry block now holds the far target.
  let words: Vec<u32> = (0..4).map(|n| test_utils::word_at(&layout, entry + 4 * n)).collect();
  assert!(words.contains(&far) || layout.schedules[0].are_blocks_adjacent(
    test_utils::block(&module.funcs[0], "entry"),
    test_utils::block(&module.funcs[0], "far")
  ));

  let module = test_cases::find_case("far_branch").unwrap();
  let mut options = LayoutOptions::default();
  options.max_restarts = 0;
  let err = run_layout(&module, &ToyPlatform::default(), &options).unwrap_err();
  assert!(err.to_string().contains("gave up after 0 restarts"), "{}", err);
}

#[test]
fn data_points_at_code() {
  let (module, layout) = test_utils::check("calls_and_data");
  let main = test_utils::address(&module, &layout, "main", "entry");
  let helper = test_utils::address(&module, &layout, "helper", "entry");
  let vtable = layout
    .regions
    .iter()
    .find(|r| r.context.to_string() == "data 'vtable'")
    .unwrap();
  assert_eq!(test_utils::word_at(&layout, vtable.address), main);
  assert_eq!(test_utils::word_at(&layout, vtable.address + 4), helper);
  assert_eq!(test_utils::word_at(&layout, vtable.address + 8), 0xcafe);
  // Code is in flash and needs no relocation; data does.
  assert!(!layout.relocations.is_empty());
  assert!(layout.relocations.iter().all(|r| r.address() >= 0x2000_0000));
}

#[test]
fn handlers_are_found_by_type() {
  let (module, layout) = test_utils::check("exceptions");
  let f = &module.funcs[0];
  let em = &layout.exception_maps[0];
  let pc = test_utils::address(&module, &layout, "exceptions", "try");
  let on_2 = test_utils::address(&module, &layout, "exceptions", "on_2");
  let on_any = test_utils::address(&module, &layout, "exceptions", "on_any");
  use codelayout::ExceptionType;
  assert_eq!(em.find_handler(f, pc, ExceptionType(2)), Some(on_2));
  assert_eq!(em.find_handler(f, pc, ExceptionType(3)), Some(on_any));
  let entry = test_utils::address(&module, &layout, "exceptions", "entry");
  assert_eq!(em.find_handler(f, entry, ExceptionType(2)), None);
  // Handlers are cold, and come after all the hot code.
  assert!(on_2 > pc && on_any > pc);
}

#[test]
fn cold_code_waits_for_all_hot_code() {
  let (module, layout) = test_utils::check("no_return");
  let bad = test_utils::address(&module, &layout, "main", "bad");
  let abort = test_utils::address(&module, &layout, "abort", "entry");
  assert!(layout.schedules[0].is_cold(test_utils::block(&module.funcs[0], "bad")));
  assert!(bad > abort);

  let mut options = LayoutOptions::default();
  options.include_cold_code_in_first_pass = true;
  let (module, layout) = test_utils::run("no_return", &options);
  let bad = test_utils::address(&module, &layout, "main", "bad");
  let abort = test_utils::address(&module, &layout, "abort", "entry");
  assert!(bad < abort);
}

#[test]
fn empty_blocks_share_addresses() {
  let (module, layout) = test_utils::check("zero_length");
  let hop1 = test_utils::address(&module, &layout, "zero_length", "hop1");
  let hop2 = test_utils::address(&module, &layout, "zero_length", "hop2");
  let target = test_utils::address(&module, &layout, "zero_length", "target");
  assert_eq!(hop1, target);
  assert_eq!(hop2, target);
}

#[test]
fn unreachable_blocks_get_no_code() {
  let (module, layout) = test_utils::check("unreachable");
  let orphan = test_utils::block(&module.funcs[0], "orphan");
  assert_eq!(layout.block_address(codelayout::MethodIx::new(0), orphan), None);
}

#[test]
fn lay_files_are_found() {
  let (module, layout) = test_utils::check("sample");
  assert_eq!(module.funcs.len(), 2);
  assert_eq!(layout.code_maps.len(), 2);
  let table = module.data.iter().find(|d| d.name == "table").unwrap();
  let placed = layout
    .regions
    .iter()
    .find(|r| r.context.to_string() == "data 'table'")
    .unwrap();
  assert_eq!(Some(placed.address), table.fixed_address);
}

#[test]
fn layouts_serialize() {
  let (_, layout) = test_utils::check("calls_and_data");
  let bytes = bincode::serialize(&layout).unwrap();
  let back: ImageLayout = bincode::deserialize(&bytes).unwrap();
  assert_eq!(back.sections, layout.sections);
  assert_eq!(back.relocations, layout.relocations);
  assert_eq!(back.schedules[0].order(), layout.schedules[0].order());
}
