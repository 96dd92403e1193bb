use serde::{Deserialize, Serialize};
use crate::codec::dn_key::dn_to_key;
use crate::core::dn::Dn;
use crate::core::entry::Entry;
use crate::core::error::Result;
use crate::storage::tree::{ReadableTransaction, TreeName, WriteableTransaction};

pub const DN2URI_INDEX_ID: &str = "dn2uri";

/// Stored value of a referral record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralRecord {
    pub dn: String,
    pub urls: Vec<String>,
}

/// DN key of every referral entry to its labeled URIs
#[derive(Debug, Clone)]
pub struct DN2URI {
    tree: TreeName,
    base_dn: Dn,
}

impl DN2URI {
    pub fn new(prefix: &str, base_dn: &Dn) -> Self {
        DN2URI { tree: TreeName::new(prefix, DN2URI_INDEX_ID), base_dn: base_dn.clone() }
    }

    pub fn tree(&self) -> &TreeName {
        &self.tree
    }

    /// Encoded record for a referral entry, `None` for ordinary entries
    pub fn record(&self, entry: &Entry) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let Some(urls) = entry.referral_urls() else {
            return Ok(None);
        };
        let record = ReferralRecord { dn: entry.dn.to_string(), urls };
        Ok(Some((dn_to_key(&entry.dn, self.base_dn.size()).to_vec(), bincode::serialize(&record)?)))
    }

    pub fn add_entry(&self, txn: &mut dyn WriteableTransaction, entry: &Entry) -> Result<()> {
        if let Some((key, value)) = self.record(entry)? {
            txn.put(&self.tree, &key, &value)?;
        }
        Ok(())
    }

    pub fn delete_entry(&self, txn: &mut dyn WriteableTransaction, dn: &Dn) -> Result<()> {
        txn.delete(&self.tree, &dn_to_key(dn, self.base_dn.size()))?;
        Ok(())
    }

    /// Replace the referral record of a modified entry
    pub fn replace_entry(&self, txn: &mut dyn WriteableTransaction, old: &Entry, new: &Entry) -> Result<()> {
        if old.is_referral() {
            self.delete_entry(txn, &old.dn)?;
        }
        self.add_entry(txn, new)
    }

    pub fn get(&self, txn: &dyn ReadableTransaction, dn: &Dn) -> Result<Option<ReferralRecord>> {
        match txn.read(&self.tree, &dn_to_key(dn, self.base_dn.size()))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Referral of the closest superior of `dn` (excluding `dn` itself) within the container
    pub fn referral_above(&self, txn: &dyn ReadableTransaction, dn: &Dn) -> Result<Option<ReferralRecord>> {
        let mut current = dn.parent();
        while let Some(ancestor) = current {
            if !ancestor.is_subordinate_or_equal_to(&self.base_dn) {
                break;
            }
            if let Some(record) = self.get(txn, &ancestor)? {
                return Ok(Some(record));
            }
            current = ancestor.parent();
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::BTreeStorage;
    use crate::storage::tree::Storage;

    #[test]
    fn finds_referral_above() {
        let base = Dn::parse("o=test").unwrap();
        let dn2uri = DN2URI::new("o=test", &base);
        let storage: Box<dyn Storage> = Box::new(BTreeStorage::in_memory());
        let referral = Entry::new(Dn::parse("ou=remote,o=test").unwrap())
            .with("objectClass", &["referral"])
            .with("ref", &["ldap://remote/ou=remote,o=test"]);

        storage
            .write(|txn| {
                txn.open_tree(dn2uri.tree(), true)?;
                dn2uri.add_entry(txn, &referral)?;
                dn2uri.add_entry(txn, &Entry::new(Dn::parse("ou=local,o=test").unwrap()))
            })
            .unwrap();

        storage
            .read(|txn| {
                let below = Dn::parse("cn=x,ou=remote,o=test").unwrap();
                let record = dn2uri.referral_above(txn, &below)?.unwrap();
                assert_eq!(record.urls, vec!["ldap://remote/ou=remote,o=test".to_string()]);
                assert!(dn2uri.referral_above(txn, &referral.dn)?.is_none());
                assert_eq!(txn.record_count(dn2uri.tree())?, 1);
                Ok(())
            })
            .unwrap();
    }
}
