/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

/// Test cases.  The list of them is right at the bottom, function
/// |find_case|.  Add new ones there.
use crate::parser;
use crate::test_framework::*;

use std::path::{Path, PathBuf};

fn finished(mut func: Func) -> Func {
  if let Err(msg) = func.finish() {
    panic!("test case {} is malformed: {}", func.name, msg);
  }
  func
}

fn test_straight_line() -> Module {
  let mut func = Func::new("straight_line", "start");
  func.block("start", vec![i_op(2), i_goto("middle")]);
  func.block("middle", vec![i_op(1), i_goto("end")]);
  func.block("end", vec![i_ret()]);
  Module::single(finished(func))
}

fn test_diamond() -> Module {
  let mut func = Func::new("diamond", "top");
  func.block("top", vec![i_op(1), i_branch("left", "right")]);
  func.block("left", vec![i_op(4), i_goto("join")]);
  func.block("right", vec![i_op(1), i_goto("join")]);
  func.block("join", vec![i_ret()]);
  Module::single(finished(func))
}

/// Blocks are listed in the opposite order to the one the scheduler should
/// pick.
fn test_nested_loops() -> Module {
  let mut func = Func::new("nested_loops", "entry");
  func.block("exit", vec![i_ret()]);
  func.block("inner_latch", vec![i_op(1), i_branch("inner", "outer_latch")]);
  func.block("outer_latch", vec![i_op(1), i_branch("outer", "exit")]);
  func.block("inner", vec![i_op(2), i_goto("inner_latch")]);
  func.block("outer", vec![i_op(1), i_goto("inner")]);
  func.block("entry", vec![i_op(1), i_goto("outer")]);
  Module::single(finished(func))
}

fn test_exceptions() -> Module {
  let mut func = Func::new("exceptions", "entry");
  func.type_parents = vec![(2, 1), (3, 1)];
  func.block("entry", vec![i_op(1), i_goto("try")]);
  func.block("try", vec![i_op(2), i_branch("done", "fail")]);
  func.block("fail", vec![i_throw()]);
  func.block("on_2", vec![i_op(1), i_goto("done")]);
  func.block("on_any", vec![i_op(1), i_goto("done")]);
  func.block("done", vec![i_ret()]);
  func.protect("try", "on_2", Some(2));
  func.protect("try", "on_any", None);
  func.protect("fail", "on_2", Some(2));
  func.protect("fail", "on_any", None);
  Module::single(finished(func))
}

fn test_no_return() -> Module {
  let mut module = Module::new("no_return");
  let mut main = Func::new("main", "entry");
  main.block("entry", vec![i_op(1), i_branch("bad", "good")]);
  main.block("bad", vec![i_call_noreturn("abort"), i_goto("unreachable")]);
  main.block("unreachable", vec![i_trap()]);
  main.block("good", vec![i_op(2), i_ret()]);
  module.funcs.push(finished(main));
  let mut abort = Func::new("abort", "entry");
  abort.block("entry", vec![i_op(1), i_throw()]);
  module.funcs.push(finished(abort));
  module
}

/// A branch over more code than a short branch can reach.
fn test_far_branch() -> Module {
  let mut func = Func::new("far_branch", "entry");
  func.block("entry", vec![i_op(1), i_branch("far", "near")]);
  func.block("near", vec![i_op(0x4000), i_goto("far")]);
  func.block("far", vec![i_op(1), i_branch("entry", "exit")]);
  func.block("exit", vec![i_ret()]);
  Module::single(finished(func))
}

fn test_calls_and_data() -> Module {
  let mut module = Module::new("calls_and_data");
  let mut main = Func::new("main", "entry");
  main.block("entry", vec![i_load_addr("vtable"), i_call("helper"), i_goto("loop")]);
  main.block("loop", vec![i_call("helper"), i_branch("loop", "exit")]);
  main.block("exit", vec![i_load_addr("counter"), i_ret()]);
  module.funcs.push(finished(main));
  let mut helper = Func::new("helper", "entry");
  helper.block("entry", vec![i_op(3), i_ret()]);
  module.funcs.push(finished(helper));
  module.data_words("vtable", &[0, 0, 0xcafe], &[(0, "main"), (4, "helper")]);
  module.data_words("counter", &[0, 0, 0, 0, 0, 0, 1], &[]);
  module
}

/// Blocks holding nothing but a jump cost no bytes.
fn test_zero_length() -> Module {
  let mut func = Func::new("zero_length", "entry");
  func.block("entry", vec![i_op(1), i_branch("hop1", "other")]);
  func.block("hop1", vec![i_goto("hop2")]);
  func.block("hop2", vec![i_goto("target")]);
  func.block("other", vec![i_op(1), i_goto("target")]);
  func.block("target", vec![i_ret()]);
  Module::single(finished(func))
}

/// Two blocks that jump to each other, both entered from outside.
fn test_irreducible() -> Module {
  let mut func = Func::new("irreducible", "entry");
  func.block("entry", vec![i_op(1), i_branch("a", "b")]);
  func.block("a", vec![i_op(1), i_branch("b", "exit")]);
  func.block("b", vec![i_op(1), i_branch("a", "exit")]);
  func.block("exit", vec![i_ret()]);
  Module::single(finished(func))
}

/// An unreachable block, and a loop of empty blocks.
fn test_unreachable() -> Module {
  let mut func = Func::new("unreachable", "entry");
  func.block("entry", vec![i_op(1), i_branch("spin", "exit")]);
  func.block("orphan", vec![i_op(5), i_ret()]);
  func.block("spin", vec![i_goto("spin2")]);
  func.block("spin2", vec![i_goto("spin")]);
  func.block("exit", vec![i_ret()]);
  Module::single(finished(func))
}

// This is the list of available tests.  This function returns either the
// requested Module, or if not found, a list of the available ones.
pub fn find_case(name: &str) -> Result<Module, Vec<String>> {
  let all_cases = vec![
    test_straight_line(),
    test_diamond(),
    test_nested_loops(),
    test_exceptions(),
    test_no_return(),
    test_far_branch(),
    test_calls_and_data(),
    test_zero_length(),
    test_irreducible(),
    test_unreachable(),
  ];

  let mut all_names = Vec::new();
  for cand in &all_cases {
    all_names.push(cand.name.clone());
  }

  for cand in all_cases {
    if cand.name == *name {
      return Ok(cand);
    }
  }

  fn ends_in_tilde(path: &PathBuf) -> bool {
    path.to_str().map_or(false, |s| s.ends_with('~'))
  }

  let test_dir = Path::new("tests");
  match test_dir.read_dir() {
    Err(err) => {
      println!("can't read test directory: {}", err);
    }
    Ok(entries) => {
      for entry in entries.flatten() {
        let path = entry.path();
        // Skip editor backup files.
        if ends_in_tilde(&path) {
          continue;
        }
        let basename = match path.file_stem().and_then(|s| s.to_str()) {
          Some(s) => s.to_string(),
          None => continue,
        };
        if basename == name {
          match parser::parse_file(path) {
            Ok(module) => return Ok(module),
            Err(err) => {
              println!("can't parse {}: {:?}", basename, err);
              return Err(all_names);
            }
          }
        } else {
          all_names.push(basename)
        }
      }
    }
  }

  all_names.sort();
  Err(all_names)
}

/// Names of the built-in cases.
pub fn builtin_names() -> Vec<&'static str> {
  vec![
    "straight_line",
    "diamond",
    "nested_loops",
    "exceptions",
    "no_return",
    "far_branch",
    "calls_and_data",
    "zero_length",
    "irreducible",
    "unreachable",
  ]
}
