//! Codec for the probe address table header.
//!
//! Grammar: `entry ("," entry)*` where `entry = identifier "=" owner ";" method`.
//! Inside any field a backslash escapes the next character, so `\\`, `\,`,
//! `\=` and `\;` stand for the literal characters.

use crate::address::TestInstantiationInstruction;
use crate::error::{ExamError, ExamResult};

const ENTRY_SEPARATOR: char = ',';
const KEY_SEPARATOR: char = '=';
const INSTRUCTION_SEPARATOR: char = ';';
const ESCAPE: char = '\\';

/// One row of the address table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableEntry {
    pub identifier: String,
    pub instruction: TestInstantiationInstruction,
}

fn escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        if matches!(c, ESCAPE | ENTRY_SEPARATOR | KEY_SEPARATOR | INSTRUCTION_SEPARATOR) {
            out.push(ESCAPE);
        }
        out.push(c);
    }
    out
}

pub fn encode_table(entries: &[ExecutableEntry]) -> String {
    entries
        .iter()
        .map(|entry| {
            format!(
                "{}{KEY_SEPARATOR}{}{INSTRUCTION_SEPARATOR}{}",
                escape(&entry.identifier),
                escape(entry.instruction.owner()),
                escape(entry.instruction.method())
            )
        })
        .collect::<Vec<_>>()
        .join(&ENTRY_SEPARATOR.to_string())
}

fn unescape(field: &str) -> ExamResult<String> {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c == ESCAPE {
            let next = chars.next().ok_or_else(|| {
                ExamError::configuration(format!("dangling escape at end of '{field}'"))
            })?;
            out.push(next);
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

/// Split on unescaped `separator` without unescaping, so nested fields keep
/// their escapes for the next pass.
fn split_raw(input: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
        } else if c == ESCAPE {
            escaped = true;
        } else if c == separator {
            parts.push(&input[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&input[start..]);
    parts
}

pub fn decode_table(header: &str) -> ExamResult<Vec<ExecutableEntry>> {
    if header.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for raw in split_raw(header, ENTRY_SEPARATOR) {
        let key_value = split_raw(raw, KEY_SEPARATOR);
        let [identifier, instruction] = key_value.as_slice() else {
            return Err(ExamError::configuration(format!(
                "malformed address table entry '{raw}': expected identifier=owner;method"
            )));
        };
        let identifier = unescape(identifier)?;
        let parts = split_raw(instruction, INSTRUCTION_SEPARATOR);
        let [owner, method] = parts.as_slice() else {
            return Err(ExamError::configuration(format!(
                "malformed instruction '{instruction}' for {identifier}: expected owner;method"
            )));
        };
        if identifier.is_empty() {
            return Err(ExamError::configuration(format!(
                "address table entry '{raw}' has an empty identifier"
            )));
        }
        entries.push(ExecutableEntry {
            identifier,
            instruction: TestInstantiationInstruction::new(unescape(owner)?, unescape(method)?)?,
        });
    }
    Ok(entries)
}
