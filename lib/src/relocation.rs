/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

#![allow(non_snake_case)]

//! Relocation records: how the loader recreates the relocatable parts of
//! the image.  Each contiguous span is cut into words; long runs of zero
//! words become skip records, everything else is copied literally.

use log::debug;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum RelocationRecord {
  /// Copy `words` to `address`.
  Data { address: u32, words: Vec<u32> },
  /// Clear `count` words at `address`.
  Skip { address: u32, count: u32 },
}

impl RelocationRecord {
  pub fn address(&self) -> u32 {
    match self {
      RelocationRecord::Data { address, .. } => *address,
      RelocationRecord::Skip { address, .. } => *address,
    }
  }

  pub fn num_words(&self) -> u32 {
    match self {
      RelocationRecord::Data { words, .. } => words.len() as u32,
      RelocationRecord::Skip { count, .. } => *count,
    }
  }
}

fn to_words(bytes: &[u8]) -> Vec<u32> {
  bytes
    .chunks(4)
    .map(|c| {
      let mut w = [0u8; 4];
      w[..c.len()].copy_from_slice(c);
      u32::from_le_bytes(w)
    })
    .collect()
}

/// Encode one contiguous span starting at `base`.  Zero runs shorter than
/// `min_zero_run` words stay in the data, except at the very end of the
/// span.  A trailing partial word is padded with zeroes.
pub fn encode_span(
  base: u32, bytes: &[u8], min_zero_run: u32,
) -> Vec<RelocationRecord> {
  let words = to_words(bytes);
  let size = words.len();
  let mut res = Vec::new();
  let address = |pos: usize| base + (pos * 4) as u32;

  let mut pos = 0;
  let mut posStart = 0;
  while posStart < size {
    while pos < size && words[pos] != 0 {
      pos += 1;
    }
    let mut posZero = pos;
    while posZero < size && words[posZero] == 0 {
      posZero += 1;
    }
    if posZero < size && ((posZero - pos) as u32) < min_zero_run {
      // Too short to be worth a record of its own.
      pos = posZero;
      continue;
    }
    if posStart != pos {
      res.push(RelocationRecord::Data {
        address: address(posStart),
        words: words[posStart..pos].to_vec(),
      });
      posStart = pos;
    }
    if posStart != posZero {
      res.push(RelocationRecord::Skip {
        address: address(posStart),
        count: (posZero - posStart) as u32,
      });
      pos = posZero;
      posStart = posZero;
    }
  }
  res
}

/// Encode a sequence of `(address, bytes)` pieces, sorted by address.
/// Touching pieces are joined into one span; where a piece overlaps the
/// previous one, its bytes replace the overlapped tail.
pub fn encode<'a, I>(pieces: I, min_zero_run: u32) -> Vec<RelocationRecord>
where
  I: IntoIterator<Item = (u32, &'a [u8])>,
{
  let mut res = Vec::new();
  let mut span: Option<(u32, Vec<u8>)> = None;
  for (address, bytes) in pieces {
    if let Some((base, buf)) = span.as_mut() {
      let end = *base + buf.len() as u32;
      if address > end {
        res.extend(encode_span(*base, buf, min_zero_run));
      } else {
        let keep = (address - *base) as usize;
        let overlap = buf.len() - keep;
        if overlap > bytes.len() {
          buf[keep..keep + bytes.len()].copy_from_slice(bytes);
        } else {
          buf.truncate(keep);
          buf.extend_from_slice(bytes);
        }
        continue;
      }
    }
    span = Some((address, bytes.to_vec()));
  }
  if let Some((base, buf)) = span {
    res.extend(encode_span(base, &buf, min_zero_run));
  }
  debug!("relocation::encode: {} records", res.len());
  res
}

/// Replay the records into `(address, bytes)` spans, joining records that
/// touch.
pub fn reconstruct(records: &[RelocationRecord]) -> Vec<(u32, Vec<u8>)> {
  let mut res = Vec::<(u32, Vec<u8>)>::new();
  for rec in records {
    let mut bytes = Vec::new();
    match rec {
      RelocationRecord::Data { words, .. } => {
        for w in words {
          bytes.extend_from_slice(&w.to_le_bytes());
        }
      }
      RelocationRecord::Skip { count, .. } => {
        bytes.resize(*count as usize * 4, 0);
      }
    }
    match res.last_mut() {
      Some((base, buf)) if *base + buf.len() as u32 == rec.address() => {
        buf.extend_from_slice(&bytes);
      }
      _ => res.push((rec.address(), bytes)),
    }
  }
  res
}

#[cfg(test)]
mod test {
  use super::*;

  fn bytes_of(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes().to_vec()).collect()
  }

  #[test]
  fn short_zero_runs_stay_in_the_data() {
    let b = bytes_of(&[1, 0, 0, 2, 0, 0, 0, 0, 3]);
    let recs = encode_span(0x100, &b, 4);
    assert_eq!(
      recs,
      vec![
        RelocationRecord::Data { address: 0x100, words: vec![1, 0, 0, 2] },
        RelocationRecord::Skip { address: 0x110, count: 4 },
        RelocationRecord::Data { address: 0x120, words: vec![3] },
      ]
    );
  }

  #[test]
  fn trailing_zeroes_are_always_skipped() {
    let recs = encode_span(0x0, &bytes_of(&[5, 0]), 4);
    assert_eq!(
      recs,
      vec![
        RelocationRecord::Data { address: 0x0, words: vec![5] },
        RelocationRecord::Skip { address: 0x4, count: 1 },
      ]
    );
    let recs = encode_span(0x0, &bytes_of(&[0, 0, 0, 0, 0, 7]), 4);
    assert_eq!(recs[0], RelocationRecord::Skip { address: 0x0, count: 5 });
  }

  #[test]
  fn partial_words_are_padded() {
    let recs = encode_span(0x40, &[1, 2, 3, 4, 5], 4);
    assert_eq!(
      recs,
      vec![RelocationRecord::Data { address: 0x40, words: vec![0x0403_0201, 5] }]
    );
  }

  #[test]
  fn pieces_join_and_split() {
    let a = bytes_of(&[1, 2]);
    let b = bytes_of(&[3]);
    let c = bytes_of(&[9]);
    let recs = encode(
      vec![(0x0, &a[..]), (0x8, &b[..]), (0x100, &c[..])],
      4,
    );
    assert_eq!(
      recs,
      vec![
        RelocationRecord::Data { address: 0x0, words: vec![1, 2, 3] },
        RelocationRecord::Data { address: 0x100, words: vec![9] },
      ]
    );
  }

  #[test]
  fn overlaps_replace_the_tail() {
    let a = bytes_of(&[1, 2, 3]);
    let b = bytes_of(&[7]);
    let recs = encode(vec![(0x0, &a[..]), (0x4, &b[..])], 4);
    assert_eq!(
      recs,
      vec![RelocationRecord::Data { address: 0x0, words: vec![1, 7, 3] }]
    );
  }

  #[test]
  fn reconstruct_round_trips() {
    let words: Vec<u32> = (0..64).map(|i| if i % 7 < 4 { 0 } else { i }).collect();
    let b = bytes_of(&words);
    for &minRun in [1u32, 2, 4, 8].iter() {
      let recs = encode_span(0x2000, &b, minRun);
      assert_eq!(reconstruct(&recs), vec![(0x2000, b.clone())]);
    }
  }
}
