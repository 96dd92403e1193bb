use std::fmt;
use nom::{IResult, Parser};
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while};
use nom::character::complete::char;
use nom::combinator::map;
use nom::multi::many0;
use nom::sequence::{delimited, preceded};
use regex::Regex;
use serde::{Serialize, Deserialize};
use crate::core::dn::normalize_value;
use crate::core::entry::{Entry, OBJECT_CLASS};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::matching::{approximate_key, ordering_key, MatchingRuleRegistry};

/// Search filter AST; attribute names are kept lowercase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality { attribute: String, value: String },
    Substring {
        attribute: String,
        initial: Option<String>,
        any: Vec<String>,
        final_part: Option<String>,
    },
    GreaterOrEqual { attribute: String, value: String },
    LessOrEqual { attribute: String, value: String },
    Present(String),
    Approximate { attribute: String, value: String },
    Extensible {
        attribute: Option<String>,
        rule: Option<String>,
        value: String,
        dn_attributes: bool,
    },
}

impl Filter {
    /// Parse an RFC 4515 string filter; outer parentheses are optional
    pub fn parse(input: &str) -> Result<Filter> {
        let trimmed = input.trim();
        let wrapped;
        let source = if trimmed.starts_with('(') {
            trimmed
        } else {
            wrapped = format!("({})", trimmed);
            wrapped.as_str()
        };

        match parse_filter(source) {
            Ok(("", filter)) => Ok(filter),
            Ok((rest, _)) => Err(Error::new(
                ErrorKind::Parse,
                format!("unexpected trailing input '{}' in filter '{}'", rest, input),
            )),
            Err(e) => Err(Error::new(
                ErrorKind::Parse,
                format!("invalid filter '{}': {}", input, e),
            )),
        }
    }

    /// `(objectClass=*)`, matches every entry
    pub fn match_all() -> Filter {
        Filter::Present(OBJECT_CLASS.to_string())
    }

    pub fn equality(attribute: &str, value: &str) -> Filter {
        Filter::Equality {
            attribute: attribute.to_ascii_lowercase(),
            value: value.to_string(),
        }
    }

    /// Evaluate the filter against an entry
    pub fn matches(&self, entry: &Entry, rules: &MatchingRuleRegistry) -> bool {
        match self {
            Filter::And(filters) => filters.iter().all(|f| f.matches(entry, rules)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(entry, rules)),
            Filter::Not(filter) => !filter.matches(entry, rules),
            Filter::Equality { attribute, value } => {
                let target = normalize_value(value);
                entry.values(attribute).iter().any(|v| normalize_value(v) == target)
            }
            Filter::Substring { attribute, initial, any, final_part } => {
                match substring_regex(initial.as_deref(), any, final_part.as_deref()) {
                    Some(regex) => entry
                        .values(attribute)
                        .iter()
                        .any(|v| regex.is_match(&normalize_value(v))),
                    None => false,
                }
            }
            Filter::GreaterOrEqual { attribute, value } => {
                let target = ordering_key(value);
                entry.values(attribute).iter().any(|v| ordering_key(v) >= target)
            }
            Filter::LessOrEqual { attribute, value } => {
                let target = ordering_key(value);
                entry.values(attribute).iter().any(|v| ordering_key(v) <= target)
            }
            Filter::Present(attribute) => {
                attribute == OBJECT_CLASS || entry.has_attribute(attribute)
            }
            Filter::Approximate { attribute, value } => {
                let target = approximate_key(value);
                entry.values(attribute).iter().any(|v| approximate_key(v) == target)
            }
            Filter::Extensible { attribute, rule, value, dn_attributes } => {
                let rule = rule
                    .as_deref()
                    .and_then(|name| rules.get(name))
                    .or_else(|| rules.get("caseIgnoreMatch"));
                let Some(rule) = rule else {
                    return false;
                };

                let attribute_match = entry.attributes.iter().any(|(name, attr)| {
                    attribute.as_ref().map(|a| a == name).unwrap_or(true)
                        && attr.values.iter().any(|v| rule.matches(v, value))
                });
                if attribute_match {
                    return true;
                }

                *dn_attributes
                    && entry.dn.rdns.iter().flat_map(|rdn| rdn.avas.iter()).any(|ava| {
                        attribute
                            .as_ref()
                            .map(|a| a.eq_ignore_ascii_case(&ava.attribute))
                            .unwrap_or(true)
                            && rule.matches(&ava.value, value)
                    })
            }
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Filter::And(filters) => {
                write!(f, "(&")?;
                for filter in filters {
                    write!(f, "{}", filter)?;
                }
                write!(f, ")")
            }
            Filter::Or(filters) => {
                write!(f, "(|")?;
                for filter in filters {
                    write!(f, "{}", filter)?;
                }
                write!(f, ")")
            }
            Filter::Not(filter) => write!(f, "(!{})", filter),
            Filter::Equality { attribute, value } => {
                write!(f, "({}={})", attribute, escape_assertion(value))
            }
            Filter::Substring { attribute, initial, any, final_part } => {
                write!(f, "({}=", attribute)?;
                if let Some(initial) = initial {
                    write!(f, "{}", escape_assertion(initial))?;
                }
                write!(f, "*")?;
                for part in any {
                    write!(f, "{}*", escape_assertion(part))?;
                }
                if let Some(final_part) = final_part {
                    write!(f, "{}", escape_assertion(final_part))?;
                }
                write!(f, ")")
            }
            Filter::GreaterOrEqual { attribute, value } => {
                write!(f, "({}>={})", attribute, escape_assertion(value))
            }
            Filter::LessOrEqual { attribute, value } => {
                write!(f, "({}<={})", attribute, escape_assertion(value))
            }
            Filter::Present(attribute) => write!(f, "({}=*)", attribute),
            Filter::Approximate { attribute, value } => {
                write!(f, "({}~={})", attribute, escape_assertion(value))
            }
            Filter::Extensible { attribute, rule, value, dn_attributes } => {
                write!(f, "(")?;
                if let Some(attribute) = attribute {
                    write!(f, "{}", attribute)?;
                }
                if *dn_attributes {
                    write!(f, ":dn")?;
                }
                if let Some(rule) = rule {
                    write!(f, ":{}", rule)?;
                }
                write!(f, ":={})", escape_assertion(value))
            }
        }
    }
}

fn parse_filter(input: &str) -> IResult<&str, Filter> {
    delimited(char('('), filter_component, char(')')).parse(input)
}

fn filter_component(input: &str) -> IResult<&str, Filter> {
    alt((and_filter, or_filter, not_filter, item_filter)).parse(input)
}

fn and_filter(input: &str) -> IResult<&str, Filter> {
    map(preceded(char('&'), many0(parse_filter)), Filter::And).parse(input)
}

fn or_filter(input: &str) -> IResult<&str, Filter> {
    map(preceded(char('|'), many0(parse_filter)), Filter::Or).parse(input)
}

fn not_filter(input: &str) -> IResult<&str, Filter> {
    map(preceded(char('!'), parse_filter), |f| Filter::Not(Box::new(f))).parse(input)
}

fn is_description_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | ';' | '.' | '_' | ':')
}

fn item_filter(input: &str) -> IResult<&str, Filter> {
    let (input, description) = take_while(is_description_char).parse(input)?;
    let (input, operator) = alt((tag("~="), tag(">="), tag("<="), tag("="))).parse(input)?;
    let (input, raw_value) = take_while(|c: char| c != ')').parse(input)?;

    let fail = || nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify));

    if let Some(extensible) = description.strip_suffix(':') {
        if operator != "=" {
            return Err(fail());
        }
        let mut parts = extensible.split(':');
        let attribute = parts.next().filter(|a| !a.is_empty()).map(|a| a.to_ascii_lowercase());
        let mut dn_attributes = false;
        let mut rule = None;
        for part in parts {
            if part.eq_ignore_ascii_case("dn") {
                dn_attributes = true;
            } else if !part.is_empty() {
                rule = Some(part.to_string());
            }
        }
        if attribute.is_none() && rule.is_none() {
            return Err(fail());
        }
        let value = unescape_assertion(raw_value).ok_or_else(fail)?;
        return Ok((input, Filter::Extensible { attribute, rule, value, dn_attributes }));
    }

    if description.is_empty() || description.contains(':') {
        return Err(fail());
    }
    let attribute = description.to_ascii_lowercase();

    let filter = match operator {
        "~=" => Filter::Approximate { attribute, value: unescape_assertion(raw_value).ok_or_else(fail)? },
        ">=" => Filter::GreaterOrEqual { attribute, value: unescape_assertion(raw_value).ok_or_else(fail)? },
        "<=" => Filter::LessOrEqual { attribute, value: unescape_assertion(raw_value).ok_or_else(fail)? },
        _ if raw_value == "*" => Filter::Present(attribute),
        _ if raw_value.contains('*') => {
            let parts: Vec<&str> = raw_value.split('*').collect();
            let mut decoded = Vec::with_capacity(parts.len());
            for part in &parts {
                decoded.push(unescape_assertion(part).ok_or_else(fail)?);
            }
            let last = decoded.len() - 1;
            let initial = Some(decoded[0].clone()).filter(|s| !s.is_empty());
            let final_part = Some(decoded[last].clone()).filter(|s| !s.is_empty());
            let any = decoded[1..last].iter().filter(|s| !s.is_empty()).cloned().collect();
            Filter::Substring { attribute, initial, any, final_part }
        }
        _ => Filter::Equality { attribute, value: unescape_assertion(raw_value).ok_or_else(fail)? },
    };
    Ok((input, filter))
}

fn unescape_assertion(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let hex = raw.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn escape_assertion(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\\' => out.push_str("\\5c"),
            '\0' => out.push_str("\\00"),
            _ => out.push(c),
        }
    }
    out
}

fn substring_regex(initial: Option<&str>, any: &[String], final_part: Option<&str>) -> Option<Regex> {
    let mut pattern = String::from("^");
    if let Some(initial) = initial {
        pattern.push_str(&regex::escape(&normalize_value(initial)));
    }
    pattern.push_str(".*");
    for part in any {
        pattern.push_str(&regex::escape(&normalize_value(part)));
        pattern.push_str(".*");
    }
    if let Some(final_part) = final_part {
        pattern.push_str(&regex::escape(&normalize_value(final_part)));
    }
    pattern.push('$');
    Regex::new(&pattern).ok()
}
