//! Integrity checks for binary module artifacts.

use url::Url;

/// WebAssembly magic number followed by the binary format version (1).
const WASM_HEADER: [u8; 8] = [0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

/// Verifies compiled modules and their companion scripts before they are
/// trusted from cache or accepted from the network.
#[derive(Debug, Clone)]
pub struct IntegrityValidator {
  module_name: String,
}

impl IntegrityValidator {
  pub fn new(module_name: &str) -> Self {
    Self {
      module_name: module_name.to_string(),
    }
  }

  /// Validate a binary-module payload, choosing the check from the URL.
  ///
  /// Anything that is neither a `.wasm` nor a `.js` artifact is checked as a
  /// module, which fails unless it carries the module header.
  pub fn validate(&self, url: &Url, payload: &[u8]) -> bool {
    if url.path().ends_with(".js") || url.path().ends_with(".mjs") {
      self.validate_script(payload)
    } else {
      validate_module(payload)
    }
  }

  /// Companion scripts must be non-empty UTF-8 text that references the
  /// module name and has balanced brackets.
  pub fn validate_script(&self, payload: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(payload) else {
      return false;
    };
    if text.trim().is_empty() || !text.contains(&self.module_name) {
      return false;
    }
    balanced(text)
  }
}

pub fn validate_module(payload: &[u8]) -> bool {
  payload.len() >= WASM_HEADER.len() && payload[..WASM_HEADER.len()] == WASM_HEADER
}

/// Keywords after which a `/` opens a regular expression.
const REGEX_KEYWORDS: &[&str] = &[
  "return", "typeof", "case", "do", "else", "in", "of", "void", "yield", "await", "delete",
  "throw", "new",
];

/// Bracket balance outside string literals, regular expression literals and
/// comments.
fn balanced(text: &str) -> bool {
  let mut stack = Vec::new();
  let mut chars = text.chars().peekable();
  // Last significant character and the identifier it ends
  let mut prev: Option<char> = None;
  let mut word = String::new();

  while let Some(c) = chars.next() {
    match c {
      '"' | '\'' | '`' => {
        // Skip to the closing quote, honoring escapes
        let mut closed = false;
        while let Some(s) = chars.next() {
          if s == '\\' {
            chars.next();
          } else if s == c {
            closed = true;
            break;
          }
        }
        if !closed {
          return false;
        }
      }
      '/' if chars.peek() == Some(&'/') => {
        for s in chars.by_ref() {
          if s == '\n' {
            break;
          }
        }
        continue;
      }
      '/' if chars.peek() == Some(&'*') => {
        chars.next();
        let mut last = '\0';
        let mut closed = false;
        for s in chars.by_ref() {
          if last == '*' && s == '/' {
            closed = true;
            break;
          }
          last = s;
        }
        if !closed {
          return false;
        }
        continue;
      }
      '/' if regex_allowed(prev, &word) => {
        if !skip_regex(&mut chars) {
          return false;
        }
      }
      '(' | '[' | '{' => stack.push(c),
      ')' | ']' | '}' => {
        let open = match c {
          ')' => '(',
          ']' => '[',
          _ => '{',
        };
        if stack.pop() != Some(open) {
          return false;
        }
      }
      _ => {}
    }

    if c.is_whitespace() {
      continue;
    }
    if is_word_char(c) {
      if !prev.is_some_and(is_word_char) {
        word.clear();
      }
      word.push(c);
    }
    prev = Some(c);
  }

  stack.is_empty()
}

fn is_word_char(c: char) -> bool {
  c.is_alphanumeric() || c == '_' || c == '$'
}

/// A `/` is division after an operand and a regex anywhere else.
fn regex_allowed(prev: Option<char>, word: &str) -> bool {
  match prev {
    None => true,
    Some(c) if is_word_char(c) => REGEX_KEYWORDS.contains(&word),
    Some(c) => "(,=:[!&|?{};+-*%<>~^".contains(c),
  }
}

/// Consume a regex literal body up to its closing `/`. Regex literals cannot
/// span lines.
fn skip_regex(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> bool {
  let mut in_class = false;
  while let Some(s) = chars.next() {
    match s {
      '\\' => {
        chars.next();
      }
      '[' => in_class = true,
      ']' => in_class = false,
      '/' if !in_class => return true,
      '\n' => return false,
      _ => {}
    }
  }
  false
}
