use serde::{Serialize, Deserialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::SearchScope;

/// Single attribute value assertion inside an RDN
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ava {
    pub attribute: String,
    pub value: String,
}

impl Ava {
    pub fn normalized(&self) -> String {
        format!("{}={}", self.attribute.to_ascii_lowercase(), normalize_value(&self.value))
    }
}

/// Relative distinguished name, possibly multi-valued
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rdn {
    pub avas: Vec<Ava>,
}

impl Rdn {
    pub fn new(attribute: &str, value: &str) -> Self {
        Rdn {
            avas: vec![Ava { attribute: attribute.to_string(), value: value.to_string() }],
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        let dn = Dn::parse(input)?;
        match dn.rdns.len() {
            1 => Ok(dn.rdns.into_iter().next().ok_or_else(|| invalid_dn(input))?),
            _ => Err(invalid_dn(input)),
        }
    }

    /// Normalized form with AVAs sorted, used for comparisons and DN keys
    pub fn normalized(&self) -> String {
        let mut avas: Vec<String> = self.avas.iter().map(Ava::normalized).collect();
        avas.sort();
        avas.join("+")
    }

    /// Value of the given attribute in this RDN
    pub fn value_of(&self, attribute: &str) -> Option<&str> {
        self.avas
            .iter()
            .find(|ava| ava.attribute.eq_ignore_ascii_case(attribute))
            .map(|ava| ava.value.as_str())
    }
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, ava) in self.avas.iter().enumerate() {
            if i > 0 {
                write!(f, "+")?;
            }
            write!(f, "{}={}", ava.attribute, escape_value(&ava.value))?;
        }
        Ok(())
    }
}

impl PartialEq for Rdn {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for Rdn {}

/// Distinguished name, RDNs stored leaf first as in the string form
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dn {
    pub rdns: Vec<Rdn>,
}

impl Dn {
    pub fn root() -> Self {
        Dn { rdns: Vec::new() }
    }

    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(Dn::root());
        }

        let mut rdns = Vec::new();
        for rdn_str in split_unescaped(trimmed, &[',', ';']) {
            let mut avas = Vec::new();
            for ava_str in split_unescaped(&rdn_str, &['+']) {
                let pos = find_unescaped(&ava_str, '=').ok_or_else(|| invalid_dn(input))?;
                let attribute = ava_str[..pos].trim();
                if attribute.is_empty() {
                    return Err(invalid_dn(input));
                }
                let value = unescape_value(ava_str[pos + 1..].trim())
                    .ok_or_else(|| invalid_dn(input))?;
                avas.push(Ava { attribute: attribute.to_string(), value });
            }
            rdns.push(Rdn { avas });
        }

        Ok(Dn { rdns })
    }

    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    /// Number of RDNs
    pub fn size(&self) -> usize {
        self.rdns.len()
    }

    pub fn rdn(&self) -> Option<&Rdn> {
        self.rdns.first()
    }

    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.is_empty() {
            return None;
        }
        Some(Dn { rdns: self.rdns[1..].to_vec() })
    }

    pub fn child(&self, rdn: Rdn) -> Dn {
        let mut rdns = Vec::with_capacity(self.rdns.len() + 1);
        rdns.push(rdn);
        rdns.extend(self.rdns.iter().cloned());
        Dn { rdns }
    }

    pub fn normalized(&self) -> String {
        self.rdns.iter().map(Rdn::normalized).collect::<Vec<_>>().join(",")
    }

    /// True if self equals `base` or lies below it
    pub fn is_subordinate_or_equal_to(&self, base: &Dn) -> bool {
        if self.rdns.len() < base.rdns.len() {
            return false;
        }
        let offset = self.rdns.len() - base.rdns.len();
        self.rdns[offset..]
            .iter()
            .zip(base.rdns.iter())
            .all(|(a, b)| a == b)
    }

    pub fn is_descendant_of(&self, base: &Dn) -> bool {
        self.rdns.len() > base.rdns.len() && self.is_subordinate_or_equal_to(base)
    }

    pub fn is_child_of(&self, parent: &Dn) -> bool {
        self.rdns.len() == parent.rdns.len() + 1 && self.is_subordinate_or_equal_to(parent)
    }

    pub fn matches_base_and_scope(&self, base: &Dn, scope: SearchScope) -> bool {
        match scope {
            SearchScope::BaseObject => self == base,
            SearchScope::SingleLevel => self.is_child_of(base),
            SearchScope::WholeSubtree => self.is_subordinate_or_equal_to(base),
            SearchScope::Subordinates => self.is_descendant_of(base),
        }
    }

    /// Replace the `old_suffix` part of this DN with `new_suffix`
    pub fn rename(&self, old_suffix: &Dn, new_suffix: &Dn) -> Result<Dn> {
        if !self.is_subordinate_or_equal_to(old_suffix) {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("{} is not below {}", self, old_suffix),
            ));
        }
        let keep = self.rdns.len() - old_suffix.rdns.len();
        let mut rdns: Vec<Rdn> = self.rdns[..keep].to_vec();
        rdns.extend(new_suffix.rdns.iter().cloned());
        Ok(Dn { rdns })
    }

    /// The RDNs between `base` (exclusive) and self, outermost first
    pub fn rdns_below(&self, base: &Dn) -> &[Rdn] {
        let keep = self.rdns.len().saturating_sub(base.rdns.len());
        &self.rdns[..keep]
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, rdn) in self.rdns.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", rdn)?;
        }
        Ok(())
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.rdns.len() == other.rdns.len() && self.normalized() == other.normalized()
    }
}

impl Eq for Dn {}

impl Hash for Dn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl PartialOrd for Dn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Dn {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized().cmp(&other.normalized())
    }
}

/// Case-ignore normalization: lowercase, trimmed, inner whitespace collapsed
pub fn normalize_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn invalid_dn(input: &str) -> Error {
    Error::new(ErrorKind::NamingViolation, format!("invalid DN '{}'", input))
}

fn split_unescaped(input: &str, separators: &[char]) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    let mut quoted = false;

    for c in input.chars() {
        if escaped {
            current.push('\\');
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            quoted = !quoted;
            current.push(c);
        } else if !quoted && separators.contains(&c) {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

fn find_unescaped(input: &str, target: char) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == target {
            return Some(i);
        }
    }
    None
}

fn unescape_value(raw: &str) -> Option<String> {
    let raw = raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')).unwrap_or(raw);
    let mut bytes = Vec::with_capacity(raw.len());
    let chars: Vec<char> = raw.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c != '\\' {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            i += 1;
            continue;
        }

        let next = *chars.get(i + 1)?;
        let hex_pair = chars.get(i + 2).filter(|_| next.is_ascii_hexdigit());
        match hex_pair {
            Some(low) if low.is_ascii_hexdigit() => {
                let byte = u8::from_str_radix(&format!("{}{}", next, low), 16).ok()?;
                bytes.push(byte);
                i += 3;
            }
            _ => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(next.encode_utf8(&mut buf).as_bytes());
                i += 2;
            }
        }
    }

    String::from_utf8(bytes).ok()
}

fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let last = value.chars().count().saturating_sub(1);
    for (i, c) in value.chars().enumerate() {
        let special = matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=')
            || (c == ' ' && (i == 0 || i == last))
            || (c == '#' && i == 0);
        if special {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
