/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! A parser for `.lay` files.
//!
//! ```text
//! ; comment
//! method main {
//!   type 2 : 1
//! entry:
//!   op 3
//!   branch loop, exit
//! loop:
//!   call helper
//!   goto entry
//! exit:
//!   ret
//! handler:
//!   goto exit
//!   protect loop -> handler catch 2
//! }
//! data table at 0x20000100 {
//!   word 7
//!   ref main
//! }
//! ```
//!
//! The first block of a method is its entry.

use std::fs::File;
use std::io;
use std::io::prelude::*;
use std::iter::Peekable;
use std::path::PathBuf;
use std::str::CharIndices;

use codelayout::{DataItem, DataRef};

use crate::test_framework::*;

#[derive(Debug)]
pub enum ParseError {
  IoError(io::Error),
  Parse(String),
}

impl From<io::Error> for ParseError {
  fn from(err: io::Error) -> ParseError {
    ParseError::IoError(err)
  }
}

pub type ParseResult<T> = Result<T, ParseError>;

pub fn parse_file(path: PathBuf) -> ParseResult<Module> {
  let basename = match path.file_stem().and_then(|s| s.to_str()) {
    Some(name) => name.to_string(),
    None => return Err(ParseError::Parse("bad file name".to_string())),
  };
  let mut file = File::open(path)?;
  let mut content = String::new();
  file.read_to_string(&mut content)?;
  parse_content(&basename, &content)
}

struct Parser<'str> {
  source: &'str str,
  iter: Peekable<CharIndices<'str>>,
  line: usize,
}

impl<'str> Parser<'str> {
  fn new(source: &'str str) -> Self {
    Self { source, iter: source.char_indices().peekable(), line: 1 }
  }

  fn peek(&mut self) -> Option<char> {
    self.iter.peek().map(|(_, c)| *c)
  }

  fn advance(&mut self) -> Option<char> {
    let (_, ch) = self.iter.next()?;
    if ch == '\n' {
      self.line += 1;
    }
    Some(ch)
  }

  fn skip_whitespace_and_comments(&mut self) {
    while let Some(c) = self.peek() {
      if c.is_whitespace() {
        self.advance();
      } else if c == ';' {
        // It's a comment! skip until the end of line.
        while let Some(c) = self.advance() {
          if c == '\n' {
            break;
          }
        }
      } else {
        break;
      }
    }
  }

  fn try_read_char(&mut self, expected: char) -> bool {
    self.skip_whitespace_and_comments();
    if self.peek() == Some(expected) {
      self.advance();
      true
    } else {
      false
    }
  }

  fn expect_char(&mut self, expected: char) -> ParseResult<()> {
    if self.try_read_char(expected) {
      Ok(())
    } else {
      self.error(&format!("expected char '{}'", expected))
    }
  }

  fn expect_str(&mut self, expected: &str) -> ParseResult<()> {
    self.skip_whitespace_and_comments();
    for c in expected.chars() {
      if self.advance() != Some(c) {
        return self.error(&format!("expected '{}'", expected));
      }
    }
    Ok(())
  }

  fn try_read_ident(&mut self) -> Option<String> {
    self.skip_whitespace_and_comments();
    let start = match self.iter.peek() {
      Some((i, c)) if is_alpha(*c) => *i,
      _ => return None,
    };
    let mut end = start;
    while let Some((i, c)) = self.iter.peek().cloned() {
      if !is_alpha_numeric(c) {
        break;
      }
      end = i + c.len_utf8();
      self.advance();
    }
    Some(self.source[start..end].to_string())
  }

  fn read_ident(&mut self) -> ParseResult<String> {
    match self.try_read_ident() {
      Some(ident) => Ok(ident),
      None => self.error("expected identifier or keyword"),
    }
  }

  fn try_read_int(&mut self) -> ParseResult<Option<u32>> {
    self.skip_whitespace_and_comments();
    let start = match self.iter.peek() {
      Some((i, c)) if is_digit(*c) => *i,
      _ => return Ok(None),
    };
    let mut end = start;
    while let Some((i, c)) = self.iter.peek().cloned() {
      if !(c.is_ascii_hexdigit() || c == 'x' || c == 'X' || c == '_') {
        break;
      }
      end = i + 1;
      self.advance();
    }
    let text: String =
      self.source[start..end].chars().filter(|c| *c != '_').collect();
    let parsed = if text.starts_with("0x") || text.starts_with("0X") {
      u32::from_str_radix(&text[2..], 16)
    } else {
      text.parse::<u32>()
    };
    match parsed {
      Ok(value) => Ok(Some(value)),
      Err(_) => self.error(&format!("bad number '{}'", text)),
    }
  }

  fn read_int(&mut self) -> ParseResult<u32> {
    match self.try_read_int()? {
      Some(value) => Ok(value),
      None => self.error("expected integer"),
    }
  }

  fn is_done(&mut self) -> bool {
    self.skip_whitespace_and_comments();
    self.peek().is_none()
  }

  fn error<T>(&self, msg: &str) -> ParseResult<T> {
    Err(ParseError::Parse(format!("error at line {}: {}", self.line, msg)))
  }

  // === BEGIN methods ===

  fn read_method(&mut self) -> ParseResult<Func> {
    let name = self.read_ident()?;
    self.expect_char('{')?;
    let mut func = Func::new(&name, "");
    let mut block: Option<(String, Vec<Inst>)> = None;
    let mut protections = Vec::new();

    loop {
      if self.try_read_char('}') {
        break;
      }
      let word = self.read_ident()?;
      let insn = match word.as_str() {
        "type" => {
          let ty = self.read_int()?;
          self.expect_char(':')?;
          let parent = self.read_int()?;
          func.type_parents.push((ty, parent));
          continue;
        }
        "protect" => {
          let protected = self.read_ident()?;
          self.expect_str("->")?;
          let handler = self.read_ident()?;
          let filter = if self.try_read_keyword("catch") {
            Some(self.read_int()?)
          } else {
            None
          };
          protections.push((protected, handler, filter));
          continue;
        }
        "op" => i_op(self.read_int()?),
        "word" => i_word(self.read_int()?),
        "call" => i_call(&self.read_ident()?),
        "call_noreturn" => i_call_noreturn(&self.read_ident()?),
        "load" => i_load_addr(&self.read_ident()?),
        "goto" => i_goto(&self.read_ident()?),
        "branch" => {
          let taken = self.read_ident()?;
          self.expect_char(',')?;
          let not_taken = self.read_ident()?;
          i_branch(&taken, &not_taken)
        }
        "ret" => i_ret(),
        "throw" => i_throw(),
        "trap" => i_trap(),
        _ => {
          // A new block.
          self.expect_char(':')?;
          if let Some((name, insns)) = block.take() {
            func.block(&name, insns);
          } else {
            func.set_entry(&word);
          }
          block = Some((word.clone(), Vec::new()));
          continue;
        }
      };
      match block.as_mut() {
        Some((_, insns)) => insns.push(insn),
        None => return self.error("instruction outside of a block"),
      }
    }

    match block {
      Some((name, insns)) => func.block(&name, insns),
      None => return self.error(&format!("method {} has no blocks", name)),
    }
    for (protected, handler, filter) in protections {
      func.protect(&protected, &handler, filter);
    }
    if let Err(msg) = func.finish() {
      return self.error(&format!("in method {}: {}", name, msg));
    }
    Ok(func)
  }

  // Keywords that may follow an identifier on the same construct.
  fn try_read_keyword(&mut self, keyword: &str) -> bool {
    self.skip_whitespace_and_comments();
    let source = self.source;
    let rest = match self.iter.peek() {
      Some((i, _)) => &source[*i..],
      None => return false,
    };
    let matches = rest.starts_with(keyword)
      && !rest[keyword.len()..].chars().next().map_or(false, is_alpha_numeric);
    if matches {
      for _ in 0..keyword.len() {
        self.advance();
      }
    }
    matches
  }

  // === END methods ===

  fn read_data(&mut self) -> ParseResult<DataItem> {
    let name = self.read_ident()?;
    let mut item = DataItem::new(&name, Vec::new());
    if self.try_read_keyword("at") {
      item.fixed_address = Some(self.read_int()?);
    }
    self.expect_char('{')?;
    loop {
      if self.try_read_char('}') {
        break;
      }
      match self.read_ident()?.as_str() {
        "word" => {
          let value = self.read_int()?;
          item.payload.extend_from_slice(&value.to_le_bytes());
        }
        "ref" => {
          let target = self.read_ident()?;
          let addend = if self.try_read_char('+') { self.read_int()? as i32 } else { 0 };
          item.refs.push(DataRef {
            offset: item.payload.len() as u32,
            target,
            addend,
          });
          item.payload.extend_from_slice(&[0; 4]);
        }
        "pointer_offset" => item.pointer_offset = self.read_int()?,
        other => return self.error(&format!("unknown data directive '{}'", other)),
      }
    }
    if item.payload.is_empty() {
      return self.error(&format!("data {} is empty", name));
    }
    Ok(item)
  }
}

pub fn parse_content(module_name: &str, content: &str) -> ParseResult<Module> {
  let mut module = Module::new(module_name);
  let mut parser = Parser::new(content);

  while !parser.is_done() {
    match parser.read_ident()?.as_str() {
      "method" => {
        let func = parser.read_method()?;
        module.funcs.push(func);
      }
      "data" => {
        let item = parser.read_data()?;
        module.data.push(item);
      }
      other => return parser.error(&format!("expected method or data, got '{}'", other)),
    }
  }

  if module.funcs.is_empty() {
    return parser.error("no methods");
  }
  Ok(module)
}

fn is_digit(c: char) -> bool {
  c >= '0' && c <= '9'
}

fn is_alpha(c: char) -> bool {
  c >= 'a' && c <= 'z' || c >= 'A' && c <= 'Z' || c == '_' || c == '.'
}

fn is_alpha_numeric(c: char) -> bool {
  is_digit(c) || is_alpha(c)
}

#[cfg(test)]
mod test {
  use super::*;
  use codelayout::{BlockIx, Function};

  const SAMPLE: &str = "
; two methods and a table
method main {
  type 2 : 1
entry:
  op 3
  branch loop, exit
loop:
  call helper
  goto entry
exit:
  ret
handler:
  goto exit
  protect loop -> handler catch 2
}
method helper {
only:
  load table
  ret
}
data table at 0x20000100 {
  word 0x10
  ref main + 1
}
";

  #[test]
  fn parses_a_module() {
    let module = parse_content("sample", SAMPLE).unwrap();
    assert_eq!(module.funcs.len(), 2);
    let main = &module.funcs[0];
    assert_eq!(main.name, "main");
    assert_eq!(main.entry_block(), BlockIx::new(0));
    assert_eq!(main.blocks.len(), 4);
    assert_eq!(main.type_parents, vec![(2, 1)]);
    let handlers = main.block_handlers(BlockIx::new(1));
    assert_eq!(handlers.len(), 1);
    assert_eq!(handlers[0].handler, BlockIx::new(3));
    assert!(main.is_exception_handler(BlockIx::new(3)));

    let table = &module.data[0];
    assert_eq!(table.fixed_address, Some(0x2000_0100));
    assert_eq!(table.payload.len(), 8);
    assert_eq!(table.refs[0], DataRef { offset: 4, target: "main".to_string(), addend: 1 });
  }

  #[test]
  fn render_then_parse_is_stable() {
    let module = parse_content("sample", SAMPLE).unwrap();
    for f in module.funcs.iter() {
      let mut printed = String::new();
      f.render(&mut printed);
      let reparsed = parse_content("again", &printed).unwrap();
      let mut reprinted = String::new();
      reparsed.funcs[0].render(&mut reprinted);
      assert_eq!(printed, reprinted);
    }
  }

  #[test]
  fn errors_carry_a_line_number() {
    match parse_content("bad", "method m {\nentry:\n  op\n}\n") {
      Err(ParseError::Parse(msg)) => assert!(msg.starts_with("error at line 4"), "{}", msg),
      other => panic!("unexpected {:?}", other.map(|m| m.name)),
    }
    assert!(parse_content("bad", "method m {\nentry:\n  goto nowhere\n}\n").is_err());
    assert!(parse_content("bad", "data d { }").is_err());
  }
}
