//! Engine-action catalogue loader.
//!
//! The nwscript source interleaves documentation comments like
//! `// 768. GetScriptParameter` with signature lines such as
//! `int GetScriptParameter( int nIndex );`. Indices may skip and unrelated
//! declarations may intervene, so each signature is bound to the explicit
//! numeric index from its comment header rather than to its position.
//! Collection only starts once the header with index 0 has been seen.

use crate::error::DecompileError;
use crate::types::Type;

#[derive(Debug, Clone)]
pub struct Action {
    pub name: String,
    pub return_type: Type,
    pub param_types: Vec<Type>,
    /// Default literal per parameter, verbatim from the declaration.
    pub defaults: Vec<Option<String>>,
}

impl Action {
    /// Number of required parameters: the count before the first trailing
    /// run of defaults.
    pub fn required_param_count(&self) -> usize {
        let mut count = 0;
        for (i, d) in self.defaults.iter().enumerate() {
            if d.is_none() {
                count = i + 1;
            }
        }
        count
    }

    /// Total stack slots consumed by the full parameter list.
    pub fn param_slots(&self) -> usize {
        self.param_types.iter().map(Type::slots).sum()
    }

    /// Serialized `"<name>" <ret-code> <slots>` form used by the debug dump.
    pub fn dump(&self) -> String {
        format!(
            "\"{}\" {} {}",
            self.name,
            self.return_type.code(),
            self.param_slots()
        )
    }
}

#[derive(Debug, Default)]
pub struct ActionTable {
    actions: Vec<Option<Action>>,
}

impl ActionTable {
    /// Parses the catalogue out of a nwscript source text. Lines that do not
    /// look like headers or signatures are skipped; a claimed index with no
    /// parseable signature simply stays absent.
    pub fn parse(text: &str) -> ActionTable {
        let mut actions: Vec<Option<Action>> = Vec::new();
        let mut started = false;
        let mut pending: Option<usize> = None;

        for line in text.lines() {
            let trimmed = line.trim();
            if let Some(idx) = parse_header(trimmed) {
                if idx == 0 {
                    started = true;
                }
                if started {
                    pending = Some(idx);
                }
                continue;
            }
            if !started {
                continue;
            }
            if trimmed.is_empty() || trimmed.starts_with("//") {
                continue;
            }
            if let Some(idx) = pending.take() {
                if let Some(action) = parse_signature(trimmed) {
                    if actions.len() <= idx {
                        actions.resize(idx + 1, None);
                    }
                    actions[idx] = Some(action);
                }
            }
        }

        ActionTable { actions }
    }

    pub fn get(&self, index: u16) -> Result<&Action, DecompileError> {
        self.actions
            .get(index as usize)
            .and_then(Option::as_ref)
            .ok_or(DecompileError::ActionTableMissing { index })
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// One `<index>: "<name>" <ret-code> <slots>` line per present entry.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (i, a) in self.actions.iter().enumerate() {
            if let Some(a) = a {
                out.push_str(&format!("{}: {}\n", i, a.dump()));
            }
        }
        out
    }
}

/// Matches `// <digits>` (optionally followed by anything), returning the
/// numeric index.
fn parse_header(line: &str) -> Option<usize> {
    let rest = line.strip_prefix("//")?.trim_start();
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    // Require a word boundary after the number ("// 10cc" is not a header).
    match rest[digits.len()..].chars().next() {
        Some(c) if c.is_alphanumeric() || c == '_' => None,
        _ => digits.parse().ok(),
    }
}

/// Parses `<ret-type> <name>(<params>);`.
fn parse_signature(line: &str) -> Option<Action> {
    let open = line.find('(')?;
    let close = line.rfind(')')?;
    if close < open {
        return None;
    }
    let mut head = line[..open].split_whitespace();
    let ret = head.next()?;
    let name = head.next()?;
    if head.next().is_some() || !is_identifier(name) || !is_identifier(ret) {
        return None;
    }

    let mut param_types = Vec::new();
    let mut defaults = Vec::new();
    for tok in split_params(&line[open + 1..close]) {
        let tok = tok.trim();
        if tok.is_empty() {
            continue;
        }
        let (decl, default) = match tok.split_once('=') {
            Some((d, v)) => (d.trim(), Some(v.trim().to_string())),
            None => (tok, None),
        };
        let mut words = decl.split_whitespace();
        let ty = words.next()?;
        let _param_name = words.next()?;
        param_types.push(Type::parse(ty));
        defaults.push(default);
    }

    Some(Action {
        name: name.to_string(),
        return_type: Type::parse(ret),
        param_types,
        defaults,
    })
}

/// Splits a parameter list on top-level commas. Vector defaults such as
/// `[0.0,0.0,0.0]` contain commas of their own.
fn split_params(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '[' | '(' => depth += 1,
            ']' | ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().map_or(false, |c| c.is_alphabetic() || c == '_')
        && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}
