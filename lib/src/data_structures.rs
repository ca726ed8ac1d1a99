/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

#![allow(non_snake_case)]

//! Data structures for the whole crate.

use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::Index;
use std::ops::IndexMut;
use std::slice::{Iter, IterMut};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

//=============================================================================
// Maps

pub type Map<K, V> = FxHashMap<K, V>;

//=============================================================================
// Sets of things

#[derive(Clone)]
pub struct Set<T> {
  set: FxHashSet<T>,
}

impl<T: Eq + Ord + Hash + Copy + fmt::Debug> Set<T> {
  #[inline(never)]
  pub fn empty() -> Self {
    Self { set: FxHashSet::<T>::default() }
  }

  #[inline(never)]
  pub fn unit(item: T) -> Self {
    let mut s = Self::empty();
    s.insert(item);
    s
  }

  #[inline(never)]
  pub fn card(&self) -> usize {
    self.set.len()
  }

  /// Returns true if the item was not already present.
  #[inline(never)]
  pub fn insert(&mut self, item: T) -> bool {
    self.set.insert(item)
  }

  #[inline(never)]
  pub fn delete(&mut self, item: T) {
    self.set.remove(&item);
  }

  #[inline(never)]
  pub fn is_empty(&self) -> bool {
    self.set.is_empty()
  }

  #[inline(never)]
  pub fn contains(&self, item: T) -> bool {
    self.set.contains(&item)
  }

  /// Sorted, so that anything iterating over the result is deterministic.
  #[inline(never)]
  pub fn to_vec(&self) -> Vec<T> {
    let mut res: Vec<T> = self.set.iter().cloned().collect();
    res.sort_unstable();
    res
  }

  #[inline(never)]
  pub fn from_vec(vec: Vec<T>) -> Self {
    let mut res = Set::<T>::empty();
    for x in vec {
      res.insert(x);
    }
    res
  }
}

impl<T: Eq + Ord + Hash + Copy + fmt::Debug> fmt::Debug for Set<T> {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?}", self.to_vec())
  }
}

pub struct SetIter<'a, T> {
  set_iter: std::collections::hash_set::Iter<'a, T>,
}
impl<T> Set<T> {
  pub fn iter(&self) -> SetIter<T> {
    SetIter { set_iter: self.set.iter() }
  }
}
impl<'a, T> Iterator for SetIter<'a, T> {
  type Item = &'a T;
  fn next(&mut self) -> Option<Self::Item> {
    self.set_iter.next()
  }
}

//=============================================================================
// Iteration boilerplate for entities.  The only purpose of this is to support
// constructions of the form
//
//   for ent in startEnt .dotdot( endPlus1Ent ) {
//   }
//
// until such time as |trait Step| is available in stable Rust.

pub trait PlusOne {
  fn plus_one(&self) -> Self;
}

#[derive(Clone, Copy)]
pub struct MyRange<T> {
  first: T,
  lastPlus1: T,
  len: usize,
}
impl<T: Copy + PartialOrd + PlusOne> MyRange<T> {
  pub fn new(first: T, len: usize) -> MyRange<T> {
    let mut lastPlus1 = first;
    for _ in 0..len {
      lastPlus1 = lastPlus1.plus_one();
    }
    MyRange { first, lastPlus1, len }
  }
  pub fn first(&self) -> T {
    assert!(self.len > 0);
    self.first
  }
  pub fn len(&self) -> usize {
    self.len
  }
  pub fn contains(&self, t: T) -> bool {
    t >= self.first && t < self.lastPlus1
  }
}
impl<T: Copy + PartialOrd + PlusOne> IntoIterator for MyRange<T> {
  type Item = T;
  type IntoIter = MyIterator<T>;
  fn into_iter(self) -> Self::IntoIter {
    MyIterator { range: self, next: self.first }
  }
}

pub struct MyIterator<T> {
  range: MyRange<T>,
  next: T,
}
impl<T: Copy + PartialOrd + PlusOne> Iterator for MyIterator<T> {
  type Item = T;
  fn next(&mut self) -> Option<Self::Item> {
    if self.next >= self.range.lastPlus1 {
      None
    } else {
      let res = Some(self.next);
      self.next = self.next.plus_one();
      res
    }
  }
}

//=============================================================================
// Vectors where both the index and element types can be specified (and at
// most 2^32-1 elems can be stored.  What if this overflows?)

pub struct TypedIxVec<TyIx, Ty> {
  vek: Vec<Ty>,
  ty_ix: PhantomData<TyIx>,
}
impl<TyIx, Ty> TypedIxVec<TyIx, Ty>
where
  Ty: Clone,
  TyIx: Copy + PartialOrd + PlusOne + TypedIx,
{
  pub fn new() -> Self {
    Self { vek: Vec::new(), ty_ix: PhantomData::<TyIx> }
  }
  pub fn from_vec(vek: Vec<Ty>) -> Self {
    Self { vek, ty_ix: PhantomData::<TyIx> }
  }
  pub fn filled(len: u32, value: Ty) -> Self {
    Self::from_vec(vec![value; len as usize])
  }
  pub fn iter(&self) -> Iter<Ty> {
    self.vek.iter()
  }
  pub fn iter_mut(&mut self) -> IterMut<Ty> {
    self.vek.iter_mut()
  }
  pub fn range(&self) -> MyRange<TyIx> {
    MyRange::new(TyIx::new(0), self.vek.len())
  }
  pub fn len(&self) -> u32 {
    // FIXME what if this overflows?
    self.vek.len() as u32
  }
  pub fn push(&mut self, item: Ty) {
    // FIXME what if this overflows?
    self.vek.push(item);
  }
  pub fn resize(&mut self, new_len: u32, value: Ty) {
    self.vek.resize(new_len as usize, value);
  }
}

impl<TyIx, Ty> Index<TyIx> for TypedIxVec<TyIx, Ty>
where
  TyIx: Into<u32>,
{
  type Output = Ty;
  fn index(&self, ix: TyIx) -> &Ty {
    &self.vek[ix.into() as usize]
  }
}

impl<TyIx, Ty> IndexMut<TyIx> for TypedIxVec<TyIx, Ty>
where
  TyIx: Into<u32>,
{
  fn index_mut(&mut self, ix: TyIx) -> &mut Ty {
    &mut self.vek[ix.into() as usize]
  }
}

impl<TyIx, Ty> Clone for TypedIxVec<TyIx, Ty>
where
  Ty: Clone,
{
  fn clone(&self) -> Self {
    Self { vek: self.vek.clone(), ty_ix: PhantomData::<TyIx> }
  }
}

impl<TyIx, Ty: fmt::Debug> fmt::Debug for TypedIxVec<TyIx, Ty> {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?}", self.vek)
  }
}

//=============================================================================
// Typed indices.  Everything the library hands out by handle (blocks, edges,
// slots, regions, ..) is named by one of these.

pub trait TypedIx: Copy {
  fn new(n: u32) -> Self;
  fn get(self) -> u32;
}

macro_rules! generate_boilerplate {
  ($TypeIx:ident, $PrintingPrefix:expr) => {
    #[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
    #[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
    pub struct $TypeIx(u32);
    impl $TypeIx {
      #[inline(always)]
      pub fn new(n: u32) -> Self {
        $TypeIx(n)
      }
      #[inline(always)]
      pub fn get(self) -> u32 {
        self.0
      }
      #[inline(always)]
      pub fn plus(self, delta: u32) -> $TypeIx {
        $TypeIx(self.0 + delta)
      }
      #[inline(always)]
      pub fn minus(self, delta: u32) -> $TypeIx {
        $TypeIx(self.0 - delta)
      }
      pub fn dotdot(&self, lastPlus1: $TypeIx) -> MyRange<$TypeIx> {
        let len = (lastPlus1.0 - self.0) as usize;
        MyRange::new(*self, len)
      }
    }
    impl fmt::Debug for $TypeIx {
      fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}{}", $PrintingPrefix, &self.0)
      }
    }
    impl PlusOne for $TypeIx {
      #[inline(always)]
      fn plus_one(&self) -> Self {
        self.plus(1)
      }
    }
    impl Into<u32> for $TypeIx {
      #[inline(always)]
      fn into(self) -> u32 {
        self.get()
      }
    }
    impl TypedIx for $TypeIx {
      #[inline(always)]
      fn new(n: u32) -> Self {
        $TypeIx(n)
      }
      #[inline(always)]
      fn get(self) -> u32 {
        self.0
      }
    }
  };
}

generate_boilerplate!(InstIx, "i");

generate_boilerplate!(BlockIx, "b");

generate_boilerplate!(EdgeIx, "e");

generate_boilerplate!(LoopIx, "loop");

generate_boilerplate!(SlotIx, "s");

generate_boilerplate!(RegionIx, "r");

generate_boilerplate!(MethodIx, "m");

//=============================================================================
// Dense bit sets over typed indices.  The universe is fixed when the set is
// created; all the per-block analyses size their sets by the number of
// blocks in the function.

const BITS_PER_WORD: u32 = 64;

pub struct BitSet<TyIx> {
  words: Vec<u64>,
  universe: u32,
  ty_ix: PhantomData<TyIx>,
}

impl<TyIx: TypedIx> BitSet<TyIx> {
  pub fn empty(universe: u32) -> Self {
    let nWords = ((universe + BITS_PER_WORD - 1) / BITS_PER_WORD) as usize;
    Self { words: vec![0; nWords], universe, ty_ix: PhantomData }
  }

  pub fn full(universe: u32) -> Self {
    let mut s = Self::empty(universe);
    for w in s.words.iter_mut() {
      *w = !0;
    }
    s.clear_excess_bits();
    s
  }

  pub fn unit(universe: u32, item: TyIx) -> Self {
    let mut s = Self::empty(universe);
    s.insert(item);
    s
  }

  fn clear_excess_bits(&mut self) {
    let tail = self.universe % BITS_PER_WORD;
    if tail != 0 {
      if let Some(last) = self.words.last_mut() {
        *last &= (1u64 << tail) - 1;
      }
    }
  }

  #[inline(always)]
  fn locate(item: TyIx) -> (usize, u32) {
    let n = item.get();
    ((n / BITS_PER_WORD) as usize, n % BITS_PER_WORD)
  }

  pub fn universe(&self) -> u32 {
    self.universe
  }

  pub fn card(&self) -> usize {
    self.words.iter().map(|w| w.count_ones() as usize).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.words.iter().all(|w| *w == 0)
  }

  /// Returns true if the item was not already present.
  pub fn insert(&mut self, item: TyIx) -> bool {
    debug_assert!(item.get() < self.universe);
    let (word, bit) = Self::locate(item);
    let old = self.words[word];
    self.words[word] = old | (1u64 << bit);
    old != self.words[word]
  }

  pub fn delete(&mut self, item: TyIx) {
    let (word, bit) = Self::locate(item);
    if word < self.words.len() {
      self.words[word] &= !(1u64 << bit);
    }
  }

  pub fn contains(&self, item: TyIx) -> bool {
    let (word, bit) = Self::locate(item);
    word < self.words.len() && (self.words[word] >> bit) & 1 != 0
  }

  /// Returns true if anything changed.
  pub fn intersect(&mut self, other: &Self) -> bool {
    debug_assert!(self.universe == other.universe);
    let mut changed = false;
    for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
      let n = *a & *b;
      changed |= n != *a;
      *a = n;
    }
    changed
  }

  /// Returns true if anything changed.
  pub fn union(&mut self, other: &Self) -> bool {
    debug_assert!(self.universe == other.universe);
    let mut changed = false;
    for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
      let n = *a | *b;
      changed |= n != *a;
      *a = n;
    }
    changed
  }

  pub fn is_subset_of(&self, other: &Self) -> bool {
    self.words.iter().zip(other.words.iter()).all(|(a, b)| *a & !*b == 0)
  }

  pub fn iter(&self) -> BitSetIter<TyIx> {
    BitSetIter { set: self, word: 0, bits: self.words.first().cloned() }
  }

  pub fn to_vec(&self) -> Vec<TyIx> {
    self.iter().collect()
  }
}

impl<TyIx> Clone for BitSet<TyIx> {
  fn clone(&self) -> Self {
    Self {
      words: self.words.clone(),
      universe: self.universe,
      ty_ix: PhantomData,
    }
  }
}

impl<TyIx> PartialEq for BitSet<TyIx> {
  fn eq(&self, other: &Self) -> bool {
    self.universe == other.universe && self.words == other.words
  }
}
impl<TyIx> Eq for BitSet<TyIx> {}

impl<TyIx: TypedIx + fmt::Debug> fmt::Debug for BitSet<TyIx> {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?}", self.to_vec())
  }
}

pub struct BitSetIter<'a, TyIx> {
  set: &'a BitSet<TyIx>,
  word: usize,
  bits: Option<u64>,
}

impl<'a, TyIx: TypedIx> Iterator for BitSetIter<'a, TyIx> {
  type Item = TyIx;
  fn next(&mut self) -> Option<TyIx> {
    loop {
      let bits = self.bits?;
      if bits != 0 {
        let bit = bits.trailing_zeros();
        self.bits = Some(bits & (bits - 1));
        return Some(TyIx::new(self.word as u32 * BITS_PER_WORD + bit));
      }
      self.word += 1;
      self.bits = self.set.words.get(self.word).cloned();
    }
  }
}

pub type BlockSet = BitSet<BlockIx>;

#[test]
fn bitset_insert_and_iterate() {
  let mut s = BlockSet::empty(130);
  assert!(s.is_empty());
  assert!(s.insert(BlockIx::new(0)));
  assert!(s.insert(BlockIx::new(64)));
  assert!(s.insert(BlockIx::new(129)));
  assert!(!s.insert(BlockIx::new(64)));
  assert_eq!(s.card(), 3);
  assert_eq!(
    s.to_vec(),
    vec![BlockIx::new(0), BlockIx::new(64), BlockIx::new(129)]
  );
  s.delete(BlockIx::new(64));
  assert!(!s.contains(BlockIx::new(64)));
  assert_eq!(s.card(), 2);
}

#[test]
fn bitset_full_respects_universe() {
  let s = BlockSet::full(70);
  assert_eq!(s.card(), 70);
  assert!(s.contains(BlockIx::new(69)));
  assert!(!s.contains(BlockIx::new(70)));
}

#[test]
fn bitset_set_operations() {
  let mut a = BlockSet::empty(10);
  let mut b = BlockSet::empty(10);
  a.insert(BlockIx::new(1));
  a.insert(BlockIx::new(2));
  b.insert(BlockIx::new(2));
  b.insert(BlockIx::new(3));

  let mut i = a.clone();
  assert!(i.intersect(&b));
  assert_eq!(i.to_vec(), vec![BlockIx::new(2)]);
  assert!(!i.intersect(&b));
  assert!(i.is_subset_of(&a));
  assert!(i.is_subset_of(&b));

  let mut u = a.clone();
  assert!(u.union(&b));
  assert_eq!(u.card(), 3);
  assert!(!a.is_subset_of(&b));
}

#[test]
fn typed_ranges() {
  let r = BlockIx::new(2).dotdot(BlockIx::new(5));
  assert_eq!(r.len(), 3);
  assert!(r.contains(BlockIx::new(4)));
  assert!(!r.contains(BlockIx::new(5)));
  let v: Vec<BlockIx> = r.into_iter().collect();
  assert_eq!(v, vec![BlockIx::new(2), BlockIx::new(3), BlockIx::new(4)]);
  assert_eq!(format!("{:?}", BlockIx::new(7)), "b7");
}
