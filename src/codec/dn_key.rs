use bytes::Bytes;
use crate::core::dn::{Dn, Rdn};
use crate::core::error::{Error, ErrorKind, Result};

/// Separator placed before every RDN of a DN key
pub const SEPARATOR: u8 = 0x00;
/// Marks the end of a key's descendant range
pub const AFTER_CHILDREN: u8 = 0x01;
const ESCAPE: u8 = 0x02;
const ESCAPE_SHIFT: u8 = 0x03;

/// Encode `dn` relative to a base DN of `base_size` RDNs.
/// Keys of descendants share the parent key as prefix, so a subtree is one contiguous range.
pub fn dn_to_key(dn: &Dn, base_size: usize) -> Bytes {
    let below = dn.size().saturating_sub(base_size);
    let mut key = Vec::with_capacity(below * 16);
    for rdn in dn.rdns[..below].iter().rev() {
        append_rdn(&mut key, rdn);
    }
    Bytes::from(key)
}

fn append_rdn(key: &mut Vec<u8>, rdn: &Rdn) {
    key.push(SEPARATOR);
    for &byte in rdn.normalized().as_bytes() {
        if byte <= ESCAPE {
            key.push(ESCAPE);
            key.push(byte + ESCAPE_SHIFT);
        } else {
            key.push(byte);
        }
    }
}

/// Smallest key strictly greater than `key` that can belong to a child
pub fn before_first_child(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1);
    out.extend_from_slice(key);
    out.push(SEPARATOR);
    out
}

/// Smallest key greater than every descendant of `key`
pub fn after_last_child(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1);
    out.extend_from_slice(key);
    out.push(AFTER_CHILDREN);
    out
}

/// Length of the parent key prefix, or `None` for the base key
pub fn find_parent_len(key: &[u8]) -> Option<usize> {
    key.iter().rposition(|&b| b == SEPARATOR)
}

/// True if `key` lies strictly inside the subtree of `ancestor`
pub fn is_descendant_key(key: &[u8], ancestor: &[u8]) -> bool {
    key.len() > ancestor.len() && key.starts_with(ancestor) && key[ancestor.len()] == SEPARATOR
}

/// Decode the normalized RDN strings of a key, outermost first
pub fn key_to_rdn_strings(key: &[u8]) -> Result<Vec<String>> {
    let mut rdns = Vec::new();
    let mut current: Option<Vec<u8>> = None;
    let mut i = 0;

    while i < key.len() {
        match key[i] {
            SEPARATOR => {
                if let Some(rdn) = current.take() {
                    rdns.push(rdn);
                }
                current = Some(Vec::new());
            }
            ESCAPE => {
                let escaped = *key.get(i + 1).ok_or_else(|| invalid_key(key))?;
                current.as_mut().ok_or_else(|| invalid_key(key))?.push(escaped - ESCAPE_SHIFT);
                i += 1;
            }
            byte => current.as_mut().ok_or_else(|| invalid_key(key))?.push(byte),
        }
        i += 1;
    }
    if let Some(rdn) = current {
        rdns.push(rdn);
    }

    rdns.into_iter()
        .map(|bytes| String::from_utf8(bytes).map_err(|_| invalid_key(key)))
        .collect()
}

/// Human readable normalized DN for a key under `base`
pub fn key_to_dn_string(key: &[u8], base: &Dn) -> Result<String> {
    let mut parts = key_to_rdn_strings(key)?;
    parts.reverse();
    if !base.is_root() {
        parts.push(base.normalized());
    }
    Ok(parts.join(","))
}

fn invalid_key(key: &[u8]) -> Error {
    Error::new(ErrorKind::Parse, format!("invalid DN key {:02x?}", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(dn: &str) -> Bytes {
        dn_to_key(&Dn::parse(dn).unwrap(), 2)
    }

    #[test]
    fn base_has_empty_key() {
        assert!(key("dc=example,dc=com").is_empty());
        assert_eq!(find_parent_len(&key("dc=example,dc=com")), None);
    }

    #[test]
    fn subtree_is_contiguous() {
        let people = key("ou=people,dc=example,dc=com");
        let a = key("cn=a,ou=people,dc=example,dc=com");
        let deep = key("cn=x,cn=a,ou=people,dc=example,dc=com");
        let sibling = key("cn=ab,ou=people,dc=example,dc=com");
        let groups = key("ou=groups,dc=example,dc=com");

        let low = before_first_child(&a);
        let high = after_last_child(&a);
        assert!(a.as_ref() < low.as_slice());
        assert!(low.as_slice() <= deep.as_ref() && deep.as_ref() < high.as_slice());
        assert!(sibling.as_ref() >= high.as_slice());
        assert!(groups.as_ref() < people.as_ref());

        assert!(is_descendant_key(&deep, &people));
        assert!(!is_descendant_key(&sibling, &a));
        assert_eq!(find_parent_len(&a), Some(people.len()));
    }

    #[test]
    fn control_bytes_are_escaped() {
        let dn = Dn::parse("cn=a\\00b,dc=example,dc=com").unwrap();
        let encoded = dn_to_key(&dn, 2);
        assert_eq!(encoded.iter().filter(|&&b| b == SEPARATOR).count(), 1);
        assert_eq!(key_to_rdn_strings(&encoded).unwrap(), vec!["cn=a\u{0}b".to_string()]);
    }

    #[test]
    fn decodes_to_dn_string() {
        let base = Dn::parse("dc=example,dc=com").unwrap();
        let encoded = key("cn=A,ou=People,dc=example,dc=com");
        assert_eq!(
            key_to_dn_string(&encoded, &base).unwrap(),
            "cn=a,ou=people,dc=example,dc=com"
        );
    }
}
