use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::fmt;
use crate::core::dn::{normalize_value, Dn};
use crate::core::error::{Error, ErrorKind, Result};

pub const OBJECT_CLASS: &str = "objectclass";
pub const REFERRAL_CLASS: &str = "referral";
pub const REF_ATTRIBUTE: &str = "ref";

/// Attribute with its user-provided name and values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<String>,
}

impl Attribute {
    pub fn new(name: &str, values: Vec<String>) -> Self {
        Attribute { name: name.to_string(), values }
    }

    pub fn contains(&self, value: &str) -> bool {
        let normalized = normalize_value(value);
        self.values.iter().any(|v| normalize_value(v) == normalized)
    }
}

/// Directory entry: DN plus attributes keyed by lowercase attribute name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub dn: Dn,
    pub attributes: BTreeMap<String, Attribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModificationType {
    Add,
    Delete,
    Replace,
    Increment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modification {
    pub kind: ModificationType,
    pub attribute: Attribute,
}

impl Modification {
    pub fn new(kind: ModificationType, name: &str, values: Vec<String>) -> Self {
        Modification { kind, attribute: Attribute::new(name, values) }
    }

    /// Lowercase name of the modified attribute
    pub fn attribute_key(&self) -> String {
        self.attribute.name.to_ascii_lowercase()
    }
}

impl Entry {
    pub fn new(dn: Dn) -> Self {
        Entry { dn, attributes: BTreeMap::new() }
    }

    /// Builder-style helper used by callers assembling entries by hand
    pub fn with(mut self, name: &str, values: &[&str]) -> Self {
        for value in values {
            self.add_value(name, value);
        }
        self
    }

    pub fn add_value(&mut self, name: &str, value: &str) {
        let attribute = self
            .attributes
            .entry(name.to_ascii_lowercase())
            .or_insert_with(|| Attribute::new(name, Vec::new()));
        if !attribute.contains(value) {
            attribute.values.push(value.to_string());
        }
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(&name.to_ascii_lowercase())
    }

    pub fn values(&self, name: &str) -> &[String] {
        self.get(name).map(|a| a.values.as_slice()).unwrap_or(&[])
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.get(name).map(|a| !a.values.is_empty()).unwrap_or(false)
    }

    pub fn has_object_class(&self, class: &str) -> bool {
        self.get(OBJECT_CLASS).map(|a| a.contains(class)).unwrap_or(false)
    }

    pub fn is_referral(&self) -> bool {
        self.has_object_class(REFERRAL_CLASS) && self.has_attribute(REF_ATTRIBUTE)
    }

    /// Labeled URIs of a referral entry, `None` for ordinary entries
    pub fn referral_urls(&self) -> Option<Vec<String>> {
        if !self.is_referral() {
            return None;
        }
        Some(self.values(REF_ATTRIBUTE).to_vec())
    }

    /// Apply LDAP modifications in order
    pub fn apply_modifications(&mut self, mods: &[Modification]) -> Result<()> {
        for modification in mods {
            let key = modification.attribute_key();
            let name = modification.attribute.name.as_str();
            match modification.kind {
                ModificationType::Add => {
                    for value in &modification.attribute.values {
                        self.add_value(name, value);
                    }
                }
                ModificationType::Delete => {
                    if modification.attribute.values.is_empty() {
                        self.attributes.remove(&key);
                        continue;
                    }
                    if let Some(attribute) = self.attributes.get_mut(&key) {
                        let targets: Vec<String> = modification
                            .attribute
                            .values
                            .iter()
                            .map(|v| normalize_value(v))
                            .collect();
                        attribute.values.retain(|v| !targets.contains(&normalize_value(v)));
                        if attribute.values.is_empty() {
                            self.attributes.remove(&key);
                        }
                    }
                }
                ModificationType::Replace => {
                    self.attributes.remove(&key);
                    for value in &modification.attribute.values {
                        self.add_value(name, value);
                    }
                }
                ModificationType::Increment => {
                    let delta: i64 = modification
                        .attribute
                        .values
                        .first()
                        .and_then(|v| v.trim().parse().ok())
                        .ok_or_else(|| Error::new(
                            ErrorKind::InvalidArgument,
                            format!("invalid increment for {}", name),
                        ))?;
                    let attribute = self.attributes.get_mut(&key).ok_or_else(|| Error::new(
                        ErrorKind::InvalidArgument,
                        format!("cannot increment missing attribute {}", name),
                    ))?;
                    for value in attribute.values.iter_mut() {
                        let current: i64 = value.trim().parse().map_err(|_| Error::new(
                            ErrorKind::InvalidArgument,
                            format!("{} is not an integer", name),
                        ))?;
                        *value = (current + delta).to_string();
                    }
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Entry {
    /// LDIF-like rendering used by dumps and debug output
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "dn: {}", self.dn)?;
        for attribute in self.attributes.values() {
            for value in &attribute.values {
                writeln!(f, "{}: {}", attribute.name, value)?;
            }
        }
        Ok(())
    }
}
