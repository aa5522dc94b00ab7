//! Service lookup filters: `(key=value)`, `(key=*)` and `(&...)`.
//!
//! A backslash escapes the next character in keys and values.

use std::collections::BTreeMap;
use std::fmt;
use std::iter::Peekable;
use std::str::{Chars, FromStr};

use crate::constants::{OBJECT_CLASS, PROBE_INVOKER_CLASS, PROBE_SIGNATURE_KEY};
use crate::error::{ExamError, ExamResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceFilter {
    Equals { key: String, value: String },
    Present { key: String },
    And(Vec<ServiceFilter>),
}

impl ServiceFilter {
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        ServiceFilter::Equals {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Filter selecting the probe invoker registered for `identifier`.
    pub fn probe_invoker(identifier: &str) -> Self {
        ServiceFilter::And(vec![
            ServiceFilter::equals(OBJECT_CLASS, PROBE_INVOKER_CLASS),
            ServiceFilter::equals(PROBE_SIGNATURE_KEY, identifier),
        ])
    }

    pub fn matches(&self, properties: &BTreeMap<String, String>) -> bool {
        match self {
            ServiceFilter::Equals { key, value } => properties.get(key) == Some(value),
            ServiceFilter::Present { key } => properties.contains_key(key),
            ServiceFilter::And(parts) => parts.iter().all(|p| p.matches(properties)),
        }
    }
}

fn parse_error(input: &str, reason: &str) -> ExamError {
    ExamError::configuration(format!("invalid service filter '{input}': {reason}"))
}

struct Parser<'a> {
    input: &'a str,
    chars: Peekable<Chars<'a>>,
}

impl<'a> Parser<'a> {
    fn expect(&mut self, expected: char) -> ExamResult<()> {
        match self.chars.next() {
            Some(c) if c == expected => Ok(()),
            _ => Err(parse_error(self.input, &format!("expected '{expected}'"))),
        }
    }

    fn filter(&mut self) -> ExamResult<ServiceFilter> {
        self.expect('(')?;
        if self.chars.peek() == Some(&'&') {
            self.chars.next();
            let mut parts = Vec::new();
            while self.chars.peek() == Some(&'(') {
                parts.push(self.filter()?);
            }
            self.expect(')')?;
            if parts.is_empty() {
                return Err(parse_error(self.input, "empty conjunction"));
            }
            return Ok(ServiceFilter::And(parts));
        }

        let (key, _) = self.text('=')?;
        self.expect('=')?;
        let (value, raw_star) = self.text(')')?;
        self.expect(')')?;
        if key.trim().is_empty() {
            return Err(parse_error(self.input, "empty key"));
        }
        let key = key.trim().to_string();
        if raw_star {
            Ok(ServiceFilter::Present { key })
        } else {
            Ok(ServiceFilter::Equals { key, value })
        }
    }

    /// Read until an unescaped `stop`; also reports whether the text was a
    /// bare, unescaped `*`.
    fn text(&mut self, stop: char) -> ExamResult<(String, bool)> {
        let mut out = String::new();
        let mut escaped_any = false;
        loop {
            match self.chars.peek().copied() {
                None => return Err(parse_error(self.input, "unterminated filter")),
                Some(c) if c == stop => break,
                Some('(') | Some(')') => {
                    return Err(parse_error(self.input, "unescaped parenthesis"));
                }
                Some('\\') => {
                    self.chars.next();
                    let next = self
                        .chars
                        .next()
                        .ok_or_else(|| parse_error(self.input, "dangling escape"))?;
                    escaped_any = true;
                    out.push(next);
                }
                Some(c) => {
                    self.chars.next();
                    out.push(c);
                }
            }
        }
        let star = !escaped_any && out == "*";
        Ok((out, star))
    }
}

impl FromStr for ServiceFilter {
    type Err = ExamError;

    fn from_str(input: &str) -> ExamResult<Self> {
        let trimmed = input.trim();
        let mut parser = Parser {
            input: trimmed,
            chars: trimmed.chars().peekable(),
        };
        let filter = parser.filter()?;
        if parser.chars.next().is_some() {
            return Err(parse_error(trimmed, "trailing characters"));
        }
        Ok(filter)
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '(' | ')' | '=' | '*') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl fmt::Display for ServiceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceFilter::Equals { key, value } => write!(f, "({}={})", escape(key), escape(value)),
            ServiceFilter::Present { key } => write!(f, "({}=*)", escape(key)),
            ServiceFilter::And(parts) => {
                f.write_str("(&")?;
                for part in parts {
                    write!(f, "{part}")?;
                }
                f.write_str(")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_conjunction_and_match() {
        let filter: ServiceFilter = "(&(objectClass=probekit.ProbeInvoker)(Probe-Signature=*))"
            .parse()
            .unwrap();
        assert!(filter.matches(&props(&[
            ("objectClass", "probekit.ProbeInvoker"),
            ("Probe-Signature", "Probekit-1"),
        ])));
        assert!(!filter.matches(&props(&[("objectClass", "probekit.ProbeInvoker")])));
    }

    #[test]
    fn test_escaped_star_is_literal() {
        let filter: ServiceFilter = "(name=\\*)".parse().unwrap();
        assert_eq!(filter, ServiceFilter::equals("name", "*"));
        assert!(!filter.matches(&props(&[("name", "x")])));
        assert!(filter.matches(&props(&[("name", "*")])));
    }

    #[test]
    fn test_display_parses_back() {
        let filter = ServiceFilter::And(vec![
            ServiceFilter::equals("k(1)", "a=b"),
            ServiceFilter::Present { key: "p".into() },
        ]);
        let reparsed: ServiceFilter = filter.to_string().parse().unwrap();
        assert_eq!(reparsed, filter);
    }

    #[test]
    fn test_probe_invoker_filter() {
        let filter = ServiceFilter::probe_invoker("Probekit-abc");
        assert_eq!(
            filter.to_string(),
            "(&(objectClass=probekit.ProbeInvoker)(Probe-Signature=Probekit-abc))"
        );
    }

    #[test]
    fn test_malformed_filters_rejected() {
        for bad in ["", "(a=b", "a=b)", "(&)", "(=b)", "(a=b)x", "(a=(b))"] {
            assert!(bad.parse::<ServiceFilter>().is_err(), "accepted {bad}");
        }
    }
}
