use std::fmt;

use regex::Regex;

use crate::error::{EngineError, Result};

/// How an event path matched a target pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatternMatch {
    /// `*` stayed within one path segment.
    Direct,
    /// Only matched with `*` spanning directory separators.
    RecursiveOnly,
}

/// An absolute target pattern with its two compiled regular expressions.
///
/// Both are compiled once at rule load; matching an event costs two regex
/// tests per pattern.
#[derive(Clone)]
pub struct TargetPattern {
    pattern: String,
    recursive: Regex,
    direct: Regex,
}

impl TargetPattern {
    pub fn compile(pattern: &str) -> Result<Self> {
        let build = |star: &str, single: &str| {
            Regex::new(&translate_glob(pattern, star, single)).map_err(|source| {
                EngineError::InvalidPattern {
                    pattern: pattern.to_string(),
                    source,
                }
            })
        };
        Ok(Self {
            pattern: pattern.to_string(),
            recursive: build(".*", ".")?,
            direct: build("[^/]*", "[^/]")?,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, path: &str) -> Option<PatternMatch> {
        if self.direct.is_match(path) {
            Some(PatternMatch::Direct)
        } else if self.recursive.is_match(path) {
            Some(PatternMatch::RecursiveOnly)
        } else {
            None
        }
    }
}

impl fmt::Debug for TargetPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetPattern")
            .field("pattern", &self.pattern)
            .finish()
    }
}

/// Translate a shell glob into an anchored regex, rendering `*` as `star`
/// and `?` as `single`. Bracket expressions pass through, with a leading `!`
/// negating; an unterminated `[` is literal.
fn translate_glob(pattern: &str, star: &str, single: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2 + 8);
    out.push_str("^(?s:");

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        i += 1;
        match c {
            '*' => {
                while i < chars.len() && chars[i] == '*' {
                    i += 1;
                }
                out.push_str(star);
            }
            '?' => out.push_str(single),
            '[' => {
                let mut j = i;
                if j < chars.len() && chars[j] == '!' {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ']' {
                    j += 1;
                }
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }
                if j >= chars.len() {
                    out.push_str("\\[");
                } else {
                    let mut class: String = chars[i..j].iter().collect();
                    i = j + 1;
                    if let Some(rest) = class.strip_prefix('!') {
                        class = format!("^{rest}");
                    } else if class.starts_with('^') {
                        class = format!("\\{class}");
                    }
                    out.push('[');
                    out.push_str(&class.replace('\\', "\\\\").replace('[', "\\["));
                    out.push(']');
                }
            }
            other => {
                let mut buf = [0_u8; 4];
                out.push_str(&regex::escape(other.encode_utf8(&mut buf)));
            }
        }
    }

    out.push_str(")$");
    out
}
