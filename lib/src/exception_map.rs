/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Exception tables: for each protected address range, the handlers that
//! may catch an exception raised inside it, innermost first.

use log::debug;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

use crate::interface::{ExceptionType, Function};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct HandlerEntry {
  /// None catches everything.
  pub filter: Option<ExceptionType>,
  /// Address of the handler's code.
  pub handler: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ExceptionRange {
  pub start: u32,
  pub end: u32,
  pub handlers: Vec<HandlerEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ExceptionMap {
  // Sorted, disjoint.
  ranges: Vec<ExceptionRange>,
}

/// Drop the handlers that can never run: anything after a catch-all, and
/// anything catching a subtype of what an earlier handler already catches.
pub fn suppress_redundant<F: Function>(
  func: &F, handlers: &[HandlerEntry],
) -> Vec<HandlerEntry> {
  let mut kept = Vec::<HandlerEntry>::new();
  for h in handlers {
    let shadowed = kept.iter().any(|k| match (k.filter, h.filter) {
      (None, _) => true,
      (Some(_), None) => false,
      (Some(outer), Some(inner)) => func.is_subtype_of(inner, outer),
    });
    if !shadowed {
      kept.push(*h);
    }
  }
  kept
}

impl ExceptionMap {
  /// Build from `(start, end, handlers)` spans of code.  Spans without
  /// handlers leave gaps; touching spans with the same handlers merge.
  pub fn build<F: Function>(
    func: &F, mut spans: Vec<(u32, u32, Vec<HandlerEntry>)>,
  ) -> Self {
    spans.sort_by_key(|s| (s.0, s.1));
    let mut ranges = Vec::<ExceptionRange>::new();
    for (start, end, raw) in spans {
      let handlers = suppress_redundant(func, &raw);
      if handlers.is_empty() || start >= end {
        continue;
      }
      if let Some(last) = ranges.last_mut() {
        if last.end == start && last.handlers == handlers {
          last.end = end;
          continue;
        }
      }
      ranges.push(ExceptionRange { start, end, handlers });
    }
    debug!("ExceptionMap::build: {} ranges for {}", ranges.len(), func.name());
    ExceptionMap { ranges }
  }

  pub fn ranges(&self) -> &[ExceptionRange] {
    &self.ranges
  }

  pub fn is_empty(&self) -> bool {
    self.ranges.is_empty()
  }

  /// The handler an exception of type `ty` raised at `pc` goes to, if any.
  pub fn find_handler<F: Function>(
    &self, func: &F, pc: u32, ty: ExceptionType,
  ) -> Option<u32> {
    let pos = self.ranges.partition_point(|r| r.end <= pc);
    let rng = self.ranges.get(pos)?;
    if pc < rng.start {
      return None;
    }
    rng
      .handlers
      .iter()
      .find(|h| match h.filter {
        None => true,
        Some(f) => func.is_subtype_of(ty, f),
      })
      .map(|h| h.handler)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::test_graphs::TestGraph;

  fn catch(ty: Option<u32>, handler: u32) -> HandlerEntry {
    HandlerEntry { filter: ty.map(ExceptionType), handler }
  }

  // Types: 2 derives from 1.
  fn graph() -> TestGraph {
    let mut g = TestGraph::new(&[&[]]);
    g.type_parents.push((2, 1));
    g
  }

  #[test]
  fn redundant_handlers_are_dropped() {
    let g = graph();
    let kept = suppress_redundant(
      &g,
      &[catch(Some(1), 0x100), catch(Some(2), 0x200), catch(None, 0x300), catch(Some(3), 0x400)],
    );
    assert_eq!(kept, vec![catch(Some(1), 0x100), catch(None, 0x300)]);
    // A subtype first doesn't hide its supertype.
    let kept = suppress_redundant(&g, &[catch(Some(2), 0x200), catch(Some(1), 0x100)]);
    assert_eq!(kept.len(), 2);
  }

  #[test]
  fn contiguous_identical_ranges_merge() {
    let g = graph();
    let h = vec![catch(Some(1), 0x800)];
    let map = ExceptionMap::build(
      &g,
      vec![
        (0x110, 0x120, h.clone()),
        (0x100, 0x110, h.clone()),
        (0x120, 0x130, vec![]),
        (0x130, 0x140, h.clone()),
        (0x140, 0x150, vec![catch(None, 0x900)]),
      ],
    );
    let spans: Vec<(u32, u32)> = map.ranges().iter().map(|r| (r.start, r.end)).collect();
    assert_eq!(spans, vec![(0x100, 0x120), (0x130, 0x140), (0x140, 0x150)]);
  }

  #[test]
  fn handlers_are_found_by_type() {
    let g = graph();
    let map = ExceptionMap::build(
      &g,
      vec![
        (0x100, 0x120, vec![catch(Some(1), 0x800), catch(None, 0x900)]),
        (0x200, 0x210, vec![catch(Some(3), 0xa00)]),
      ],
    );
    assert_eq!(map.find_handler(&g, 0x104, ExceptionType(2)), Some(0x800));
    assert_eq!(map.find_handler(&g, 0x11c, ExceptionType(3)), Some(0x900));
    assert_eq!(map.find_handler(&g, 0x120, ExceptionType(1)), None);
    assert_eq!(map.find_handler(&g, 0x0fc, ExceptionType(1)), None);
    assert_eq!(map.find_handler(&g, 0x200, ExceptionType(1)), None);
    assert_eq!(map.find_handler(&g, 0x20c, ExceptionType(3)), Some(0xa00));
  }
}
