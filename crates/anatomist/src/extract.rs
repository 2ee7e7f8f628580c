//! Expression extraction from raw Structured Text.
//!
//! Generator output is arbitrary text: prose, markdown fences, whole
//! `PROGRAM` blocks. The extractor locates the single safety-relevant output
//! assignment inside it.
//!
//! Resolution order (first match wins):
//! 1. `IF <condition> THEN`: the condition is the expression; the output is
//!    the first `<Name> :=` whose name carries a safety-output suffix.
//! 2. `<Name> := <expression>;` statements in textual order, skipping bare
//!    constants and unterminated statements.
//! 3. Nothing: `None`, which the checker treats as a critical violation.

use serde::Serialize;

use crate::lexer::{is_ident_char, is_ident_start};

/// Output name used when a conditional block has no recognisable output.
pub const UNRESOLVED_OUTPUT: &str = "UnresolvedOutput";

/// Naming convention for safety-relevant outputs (matched case-insensitively).
pub const OUTPUT_SUFFIXES: &[&str] = &["run", "output", "active", "enable"];

/// A safety-relevant output assignment extracted from source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub output_variable: String,
    /// Unparsed expression text, whitespace runs collapsed to single spaces.
    pub expression_text: String,
}

/// A word (identifier-shaped run) located in the scanned text.
#[derive(Debug, Clone, Copy)]
struct Word<'a> {
    text: &'a str,
    start: usize,
    end: usize,
}

/// Extracts the safety-relevant assignment from `raw_code`.
pub fn extract(raw_code: &str) -> Option<Assignment> {
    let code = blank_comments(raw_code);
    let words = scan_words(&code);

    if let Some(condition) = conditional_expression(&code, &words) {
        let output_variable = output_candidates(&code, &words)
            .next()
            .map(|(word, _)| word.text.to_string())
            .unwrap_or_else(|| UNRESOLVED_OUTPUT.to_string());
        return Some(Assignment {
            output_variable,
            expression_text: condition,
        });
    }

    for (word, rhs_start) in output_candidates(&code, &words) {
        let Some(semi) = code[rhs_start..].find(';') else {
            continue;
        };
        let expression_text = collapse_whitespace(&code[rhs_start..rhs_start + semi]);
        if is_bare_constant(&expression_text) {
            continue;
        }
        return Some(Assignment {
            output_variable: word.text.to_string(),
            expression_text,
        });
    }

    None
}

/// `TRUE`, `FALSE`, `1`, `0` (case-insensitive, surrounding whitespace ignored).
pub fn is_bare_constant(text: &str) -> bool {
    let t = text.trim();
    t.eq_ignore_ascii_case("TRUE") || t.eq_ignore_ascii_case("FALSE") || t == "1" || t == "0"
}

/// `true` if `name` follows the safety-output naming convention.
pub fn has_output_suffix(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    OUTPUT_SUFFIXES
        .iter()
        .any(|suffix| lower.len() > suffix.len() && lower.ends_with(suffix))
}

/// Collapses every whitespace run to one space and trims the ends.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Replaces `(* ... *)` and `// ...` comments with spaces, preserving byte offsets.
fn blank_comments(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < bytes.len() {
        let rest = &text[i..];
        let skip = if rest.starts_with("(*") {
            Some(rest.find("*)").map(|end| end + 2).unwrap_or(rest.len()))
        } else if rest.starts_with("//") {
            Some(rest.find('\n').unwrap_or(rest.len()))
        } else {
            None
        };

        match skip {
            Some(len) => {
                for c in rest[..len].chars() {
                    // Keep line structure so newlines still separate words.
                    if c == '\n' {
                        out.push('\n');
                    } else {
                        out.extend(std::iter::repeat(' ').take(c.len_utf8()));
                    }
                }
                i += len;
            }
            None => {
                let c = rest.chars().next().unwrap_or(' ');
                out.push(c);
                i += c.len_utf8();
            }
        }
    }
    out
}

fn scan_words(text: &str) -> Vec<Word<'_>> {
    let mut words = Vec::new();
    let mut current: Option<usize> = None;

    for (i, c) in text.char_indices() {
        match current {
            Some(start) if !is_ident_char(c) => {
                words.push(Word {
                    text: &text[start..i],
                    start,
                    end: i,
                });
                current = None;
            }
            // A digit-led run like `2Motor` is not an identifier; the
            // alphanumeric tail is absorbed so it never becomes one.
            None if is_ident_start(c) || c.is_ascii_digit() => current = Some(i),
            _ => {}
        }
    }
    if let Some(start) = current {
        words.push(Word {
            text: &text[start..],
            start,
            end: text.len(),
        });
    }

    words
        .into_iter()
        .filter(|w| w.text.chars().next().is_some_and(is_ident_start))
        .collect()
}

/// Condition text of the first `IF ... THEN`, if any and non-empty.
fn conditional_expression(code: &str, words: &[Word<'_>]) -> Option<String> {
    let if_idx = words.iter().position(|w| w.text.eq_ignore_ascii_case("IF"))?;
    let if_word = words[if_idx];
    let then_word = words[if_idx + 1..]
        .iter()
        .find(|w| w.text.eq_ignore_ascii_case("THEN"))?;

    let condition = collapse_whitespace(&code[if_word.end..then_word.start]);
    if condition.is_empty() {
        None
    } else {
        Some(condition)
    }
}

/// Safety-output words immediately followed by `:=`, with the byte offset of
/// the right-hand side.
fn output_candidates<'a>(
    code: &'a str,
    words: &'a [Word<'a>],
) -> impl Iterator<Item = (Word<'a>, usize)> + 'a {
    words.iter().filter_map(move |word| {
        if !has_output_suffix(word.text) {
            return None;
        }
        let after = &code[word.end..];
        let trimmed = after.trim_start();
        if !trimmed.starts_with(":=") {
            return None;
        }
        let rhs_start = word.end + (after.len() - trimmed.len()) + 2;
        Some((*word, rhs_start))
    })
}
