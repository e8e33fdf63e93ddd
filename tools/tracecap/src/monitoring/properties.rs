//! Line-oriented `key=value` text, as read by the monitoring agent.
//!
//! Grammar: blank lines and lines starting with `#` or `!` are ignored. The
//! first unescaped `=` splits key from value. Unescaped whitespace around key
//! and value is dropped. Escapes: `\\`, `\n`, `\r`, `\t`, `\=`, `\ `, `\#`,
//! `\!`.

use crate::errors::TracecapError;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyLine {
    /// 1-based line number in the source text.
    pub line: usize,
    pub key: String,
    pub value: String,
}

pub fn parse_lines(text: &str) -> Result<Vec<PropertyLine>, TracecapError> {
    let mut parsed = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = raw.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
            continue;
        }
        let (key, value) = split_line(raw).map_err(|reason| {
            TracecapError::ConfigParse(format!("line {line_no}: {reason}: '{raw}'"))
        })?;
        parsed.push(PropertyLine {
            line: line_no,
            key,
            value,
        });
    }
    Ok(parsed)
}

pub fn parse_map(text: &str) -> Result<BTreeMap<String, String>, TracecapError> {
    Ok(parse_lines(text)?
        .into_iter()
        .map(|line| (line.key, line.value))
        .collect())
}

/// Render sorted `key=value` lines. The output parses back to the same map.
pub fn render(properties: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in properties {
        out.push_str(&escape(key, true));
        out.push('=');
        out.push_str(&escape(value, false));
        out.push('\n');
    }
    out
}

type Unit = (char, bool);

fn split_line(raw: &str) -> Result<(String, String), &'static str> {
    let units = unescape(raw)?;
    let Some(split) = units.iter().position(|(c, escaped)| *c == '=' && !escaped) else {
        return Err("missing '='");
    };
    let key = collect_trimmed(&units[..split]);
    if key.is_empty() {
        return Err("empty key");
    }
    let value = collect_trimmed(&units[split + 1..]);
    Ok((key, value))
}

fn unescape(raw: &str) -> Result<Vec<Unit>, &'static str> {
    let mut units = Vec::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            units.push((c, false));
            continue;
        }
        let decoded = match chars.next() {
            Some('n') => '\n',
            Some('r') => '\r',
            Some('t') => '\t',
            Some(other) => other,
            None => return Err("dangling escape"),
        };
        units.push((decoded, true));
    }
    Ok(units)
}

fn collect_trimmed(units: &[Unit]) -> String {
    let is_pad = |(c, escaped): &Unit| !escaped && c.is_whitespace();
    let start = units.iter().position(|u| !is_pad(u)).unwrap_or(units.len());
    let end = units
        .iter()
        .rposition(|u| !is_pad(u))
        .map(|i| i + 1)
        .unwrap_or(start);
    units[start..end.max(start)].iter().map(|(c, _)| *c).collect()
}

fn escape(text: &str, is_key: bool) -> String {
    let last = text.chars().count().saturating_sub(1);
    let mut out = String::with_capacity(text.len());
    for (idx, c) in text.chars().enumerate() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '=' if is_key => out.push_str("\\="),
            '#' | '!' if is_key && idx == 0 => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_whitespace() && (is_key || idx == 0 || idx == last) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}
