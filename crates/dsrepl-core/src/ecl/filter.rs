//! LDAP string filters over changelog entries
//!
//! Supports `&`, `|`, `!`, equality, `>=`, `<=`, presence and substrings.
//! Attribute names are case-insensitive. Values may use `\XX` hex escapes.

use super::entry::EclEntry;
use crate::{Error, Result};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Attribute carrying the draft change number
pub const CHANGE_NUMBER_ATTR: &str = "changenumber";

/// Parsed search filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Every sub-filter matches
    And(Vec<Filter>),
    /// At least one sub-filter matches
    Or(Vec<Filter>),
    /// Sub-filter does not match
    Not(Box<Filter>),
    /// `attr=value`
    Equality {
        /// Lowercased attribute name
        attr: String,
        /// Assertion value
        value: String,
    },
    /// `attr>=value`
    GreaterOrEqual {
        /// Lowercased attribute name
        attr: String,
        /// Assertion value
        value: String,
    },
    /// `attr<=value`
    LessOrEqual {
        /// Lowercased attribute name
        attr: String,
        /// Assertion value
        value: String,
    },
    /// `attr=*`
    Present {
        /// Lowercased attribute name
        attr: String,
    },
    /// `attr=initial*any*final`
    Substring {
        /// Lowercased attribute name
        attr: String,
        /// Leading fragment
        initial: Option<String>,
        /// Inner fragments, in order
        any: Vec<String>,
        /// Trailing fragment
        last: Option<String>,
    },
}

/// Inclusive change number interval implied by a filter
///
/// `None` on a side means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeNumberBounds {
    /// Lowest number that can match
    pub low: Option<u64>,
    /// Highest number that can match
    pub high: Option<u64>,
}

impl ChangeNumberBounds {
    /// No restriction
    pub const UNBOUNDED: Self = Self {
        low: None,
        high: None,
    };

    /// Single number
    pub fn exact(number: u64) -> Self {
        Self {
            low: Some(number),
            high: Some(number),
        }
    }

    /// The number when the interval holds exactly one
    pub fn as_exact(&self) -> Option<u64> {
        match (self.low, self.high) {
            (Some(low), Some(high)) if low == high => Some(low),
            _ => None,
        }
    }

    /// Whether no number can match
    pub fn is_empty(&self) -> bool {
        matches!((self.low, self.high), (Some(low), Some(high)) if low > high)
    }

    fn intersect(self, other: Self) -> Self {
        Self {
            low: max_bound(self.low, other.low),
            high: min_bound(self.high, other.high),
        }
    }

    fn union(self, other: Self) -> Self {
        // Empty sides of a union contribute nothing.
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        Self {
            low: self.low.zip(other.low).map(|(a, b)| a.min(b)),
            high: self.high.zip(other.high).map(|(a, b)| a.max(b)),
        }
    }
}

fn max_bound(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn min_bound(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

impl Filter {
    /// Filter matching every entry, `(objectclass=*)`
    pub fn any() -> Self {
        Self::Present {
            attr: "objectclass".to_string(),
        }
    }

    /// Parse an LDAP string filter
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(Self::any());
        }
        let mut parser = Parser {
            input: input.as_bytes(),
            pos: 0,
        };
        let filter = if input.starts_with('(') {
            parser.filter()?
        } else {
            // Bare item without the enclosing parentheses.
            parser.item(input.len())?
        };
        if parser.pos != input.len() {
            return Err(Error::InvalidFilter(format!(
                "trailing characters at offset {} in '{}'",
                parser.pos, input
            )));
        }
        filter.validate()?;
        Ok(filter)
    }

    /// Whether `entry` satisfies the filter
    pub fn matches(&self, entry: &EclEntry) -> bool {
        match self {
            Self::And(filters) => filters.iter().all(|f| f.matches(entry)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(entry)),
            Self::Not(filter) => !filter.matches(entry),
            Self::Present { attr } => !entry.attribute_values(attr).is_empty(),
            Self::Equality { attr, value } => entry
                .attribute_values(attr)
                .iter()
                .any(|v| compare(attr, v, value) == Some(Ordering::Equal)),
            Self::GreaterOrEqual { attr, value } => entry
                .attribute_values(attr)
                .iter()
                .any(|v| matches!(compare(attr, v, value), Some(Ordering::Greater | Ordering::Equal))),
            Self::LessOrEqual { attr, value } => entry
                .attribute_values(attr)
                .iter()
                .any(|v| matches!(compare(attr, v, value), Some(Ordering::Less | Ordering::Equal))),
            Self::Substring {
                attr,
                initial,
                any,
                last,
            } => entry
                .attribute_values(attr)
                .iter()
                .any(|v| substring_match(v, initial.as_deref(), any, last.as_deref())),
        }
    }

    /// Tightest change number interval every matching entry lies in
    ///
    /// Never narrower than the set of matching entries: terms on other
    /// attributes and negations leave the interval unbounded.
    pub fn change_number_bounds(&self) -> ChangeNumberBounds {
        match self {
            Self::And(filters) => filters
                .iter()
                .map(Self::change_number_bounds)
                .fold(ChangeNumberBounds::UNBOUNDED, ChangeNumberBounds::intersect),
            Self::Or(filters) => {
                let mut bounds = filters.iter().map(Self::change_number_bounds);
                match bounds.next() {
                    Some(first) => bounds.fold(first, ChangeNumberBounds::union),
                    None => ChangeNumberBounds::UNBOUNDED,
                }
            }
            Self::Equality { attr, value } if attr == CHANGE_NUMBER_ATTR => {
                value.parse().map_or(ChangeNumberBounds::UNBOUNDED, ChangeNumberBounds::exact)
            }
            Self::GreaterOrEqual { attr, value } if attr == CHANGE_NUMBER_ATTR => ChangeNumberBounds {
                low: value.parse().ok(),
                high: None,
            },
            Self::LessOrEqual { attr, value } if attr == CHANGE_NUMBER_ATTR => ChangeNumberBounds {
                low: None,
                high: value.parse().ok(),
            },
            _ => ChangeNumberBounds::UNBOUNDED,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::And(filters) | Self::Or(filters) => filters.iter().try_for_each(Self::validate),
            Self::Not(filter) => filter.validate(),
            Self::Equality { attr, value }
            | Self::GreaterOrEqual { attr, value }
            | Self::LessOrEqual { attr, value }
                if attr == CHANGE_NUMBER_ATTR =>
            {
                value.parse::<u64>().map(|_| ()).map_err(|_| {
                    Error::InvalidFilter(format!("changeNumber value '{value}' is not a number"))
                })
            }
            _ => Ok(()),
        }
    }
}

impl FromStr for Filter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And(filters) => {
                write!(f, "(&")?;
                for filter in filters {
                    write!(f, "{filter}")?;
                }
                write!(f, ")")
            }
            Self::Or(filters) => {
                write!(f, "(|")?;
                for filter in filters {
                    write!(f, "{filter}")?;
                }
                write!(f, ")")
            }
            Self::Not(filter) => write!(f, "(!{filter})"),
            Self::Equality { attr, value } => write!(f, "({attr}={})", escape(value)),
            Self::GreaterOrEqual { attr, value } => write!(f, "({attr}>={})", escape(value)),
            Self::LessOrEqual { attr, value } => write!(f, "({attr}<={})", escape(value)),
            Self::Present { attr } => write!(f, "({attr}=*)"),
            Self::Substring {
                attr,
                initial,
                any,
                last,
            } => {
                write!(f, "({attr}=")?;
                if let Some(initial) = initial {
                    write!(f, "{}", escape(initial))?;
                }
                write!(f, "*")?;
                for fragment in any {
                    write!(f, "{}*", escape(fragment))?;
                }
                if let Some(last) = last {
                    write!(f, "{}", escape(last))?;
                }
                write!(f, ")")
            }
        }
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\\' => out.push_str("\\5c"),
            '\0' => out.push_str("\\00"),
            c => out.push(c),
        }
    }
    out
}

/// Ordering of an entry value against an assertion value
fn compare(attr: &str, entry_value: &str, assertion: &str) -> Option<Ordering> {
    match attr {
        CHANGE_NUMBER_ATTR | "replicaidentifier" => {
            let a: u64 = entry_value.parse().ok()?;
            let b: u64 = assertion.parse().ok()?;
            Some(a.cmp(&b))
        }
        "targetdn" | "replicadn" | "newsuperior" => Some(
            crate::storage::normalize_dn(entry_value).cmp(&crate::storage::normalize_dn(assertion)),
        ),
        _ => Some(entry_value.to_lowercase().cmp(&assertion.to_lowercase())),
    }
}

fn substring_match(value: &str, initial: Option<&str>, any: &[String], last: Option<&str>) -> bool {
    let value = value.to_lowercase();
    let mut rest = value.as_str();
    if let Some(initial) = initial {
        match rest.strip_prefix(initial.to_lowercase().as_str()) {
            Some(tail) => rest = tail,
            None => return false,
        }
    }
    for fragment in any {
        let fragment = fragment.to_lowercase();
        match rest.find(fragment.as_str()) {
            Some(at) => rest = &rest[at + fragment.len()..],
            None => return false,
        }
    }
    match last {
        Some(last) => rest.ends_with(last.to_lowercase().as_str()),
        None => true,
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, msg: &str) -> Error {
        Error::InvalidFilter(format!(
            "{} at offset {} in '{}'",
            msg,
            self.pos,
            String::from_utf8_lossy(self.input)
        ))
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", byte as char)))
        }
    }

    fn filter(&mut self) -> Result<Filter> {
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.filter_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.filter_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter()?))
            }
            Some(_) => {
                let end = self.find_close()?;
                self.item(end)?
            }
            None => return Err(self.error("unexpected end of filter")),
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn filter_list(&mut self) -> Result<Vec<Filter>> {
        let mut filters = Vec::new();
        while self.peek() == Some(b'(') {
            filters.push(self.filter()?);
        }
        if filters.is_empty() {
            return Err(self.error("empty filter list"));
        }
        Ok(filters)
    }

    fn find_close(&self) -> Result<usize> {
        self.input[self.pos..]
            .iter()
            .position(|&b| b == b')' || b == b'(')
            .map(|offset| self.pos + offset)
            .filter(|&end| self.input[end] == b')')
            .ok_or_else(|| self.error("unterminated filter item"))
    }

    /// Simple item spanning `pos..end`
    fn item(&mut self, end: usize) -> Result<Filter> {
        let text = std::str::from_utf8(&self.input[self.pos..end])
            .map_err(|_| self.error("filter is not valid UTF-8"))?;
        let eq = text.find('=').ok_or_else(|| self.error("missing '='"))?;
        let (attr, op_len) = match text[..eq].chars().last() {
            Some('>') | Some('<') | Some('~') => (&text[..eq - 1], 2),
            _ => (&text[..eq], 1),
        };
        let attr = attr.trim();
        if attr.is_empty()
            || !attr
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == ';')
        {
            return Err(self.error(&format!("invalid attribute description '{attr}'")));
        }
        let attr = attr.to_ascii_lowercase();
        let raw = &text[eq + 1..];
        let operator = &text[eq + 1 - op_len..=eq];
        self.pos = end;

        match operator {
            ">=" => Ok(Filter::GreaterOrEqual {
                attr,
                value: unescape(raw).map_err(|e| self.error(&e))?,
            }),
            "<=" => Ok(Filter::LessOrEqual {
                attr,
                value: unescape(raw).map_err(|e| self.error(&e))?,
            }),
            "~=" => Err(self.error("approximate match is not supported")),
            _ if raw == "*" => Ok(Filter::Present { attr }),
            _ if raw.contains('*') => {
                let mut parts = raw
                    .split('*')
                    .map(unescape)
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| self.error(&e))?;
                let last = parts.pop().filter(|s| !s.is_empty());
                let initial = if parts.is_empty() {
                    None
                } else {
                    Some(parts.remove(0)).filter(|s| !s.is_empty())
                };
                let any = parts.into_iter().filter(|s| !s.is_empty()).collect();
                Ok(Filter::Substring {
                    attr,
                    initial,
                    any,
                    last,
                })
            }
            _ => Ok(Filter::Equality {
                attr,
                value: unescape(raw).map_err(|e| self.error(&e))?,
            }),
        }
    }
}

fn unescape(raw: &str) -> std::result::Result<String, String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let hex = raw
                .get(i + 1..i + 3)
                .ok_or_else(|| "truncated escape".to_string())?;
            let byte = u8::from_str_radix(hex, 16).map_err(|_| format!("bad escape '\\{hex}'"))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| "escaped value is not valid UTF-8".to_string())
}
