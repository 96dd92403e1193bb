use std::fmt;
use std::sync::Arc;
use crate::core::dn::Dn;
use crate::core::entry::{Entry, Modification};
use crate::core::error::Result;
use crate::core::filter::Filter;
use crate::core::types::{CancellationToken, SearchScope};

/// Plugin points invoked for entries below the target of a subtree operation
pub trait SubordinateHooks: Send + Sync {
    fn subordinate_delete(&self, _entry: &Entry) -> Result<()> {
        Ok(())
    }

    /// Extra modifications to apply to a renamed subordinate
    fn subordinate_modify_dn(&self, _old_entry: &Entry, _new_entry: &Entry) -> Result<Vec<Modification>> {
        Ok(Vec::new())
    }
}

/// Per-operation state carried into an entry container
#[derive(Clone, Default)]
pub struct OperationContext {
    pub cancel: CancellationToken,
    pub manage_dsa_it: bool,                      // Operate on referral entries themselves
    pub subtree_delete: bool,
    pub unindexed_search_allowed: bool,
    pub lookthrough_limit: Option<u64>,           // Overrides the backend default, 0 unlimited
    pub modifications: Option<Vec<Modification>>, // Set by modify operations for targeted reindexing
    pub hooks: Option<Arc<dyn SubordinateHooks>>,
}

impl OperationContext {
    pub fn new() -> Self {
        OperationContext::default()
    }

    pub fn with_subtree_delete(mut self) -> Self {
        self.subtree_delete = true;
        self
    }

    pub fn with_manage_dsa_it(mut self) -> Self {
        self.manage_dsa_it = true;
        self
    }

    pub fn with_unindexed_search(mut self) -> Self {
        self.unindexed_search_allowed = true;
        self
    }

    pub fn with_modifications(mut self, modifications: Vec<Modification>) -> Self {
        self.modifications = Some(modifications);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn SubordinateHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn check_canceled(&self) -> Result<()> {
        self.cancel.check()
    }
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("manage_dsa_it", &self.manage_dsa_it)
            .field("subtree_delete", &self.subtree_delete)
            .field("unindexed_search_allowed", &self.unindexed_search_allowed)
            .field("lookthrough_limit", &self.lookthrough_limit)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub attribute: String,
    pub reverse: bool,
}

impl SortKey {
    pub fn new(attribute: &str, reverse: bool) -> Self {
        SortKey { attribute: attribute.to_ascii_lowercase(), reverse }
    }

    /// Parse a sort order such as "sn -givenName"
    pub fn parse_order(order: &str) -> Vec<SortKey> {
        order
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(|s| match s.strip_prefix('-') {
                Some(name) => SortKey::new(name, true),
                None => SortKey::new(s.trim_start_matches('+'), false),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortControl {
    pub keys: Vec<SortKey>,
    pub critical: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PagedResultsControl {
    pub size: usize,
    pub cookie: Vec<u8>,                          // Empty on the first request
}

#[derive(Debug, Clone, PartialEq)]
pub enum VlvTarget {
    Offset(i64),                                  // 1-based, 0 is treated as 1
    GreaterThanOrEqual(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VlvControl {
    pub before_count: usize,
    pub after_count: usize,
    pub target: VlvTarget,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base: Dn,
    pub scope: SearchScope,
    pub filter: Filter,
    pub attributes: Vec<String>,
    pub size_limit: usize,                        // 0 uses the backend default
    pub paged: Option<PagedResultsControl>,
    pub sort: Option<SortControl>,
    pub vlv: Option<VlvControl>,
}

impl SearchRequest {
    pub fn new(base: Dn, scope: SearchScope, filter: Filter) -> Self {
        SearchRequest {
            base,
            scope,
            filter,
            attributes: Vec::new(),
            size_limit: 0,
            paged: None,
            sort: None,
            vlv: None,
        }
    }

    pub fn with_attributes(mut self, attributes: &[&str]) -> Self {
        self.attributes = attributes.iter().map(|a| a.to_ascii_lowercase()).collect();
        self
    }

    pub fn with_size_limit(mut self, size_limit: usize) -> Self {
        self.size_limit = size_limit;
        self
    }

    pub fn with_paged(mut self, size: usize, cookie: Vec<u8>) -> Self {
        self.paged = Some(PagedResultsControl { size, cookie });
        self
    }

    pub fn with_sort(mut self, order: &str, critical: bool) -> Self {
        self.sort = Some(SortControl { keys: SortKey::parse_order(order), critical });
        self
    }

    pub fn with_vlv(mut self, before_count: usize, after_count: usize, target: VlvTarget) -> Self {
        self.vlv = Some(VlvControl { before_count, after_count, target });
        self
    }

    pub fn requests_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortResult {
    Success,
    UnwillingToPerform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VlvResponse {
    pub target_position: u64,
    pub content_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchOutcome {
    #[default]
    Success,
    SizeLimitExceeded,
    AdminLimitExceeded,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub entries: Vec<Entry>,
    pub references: Vec<Vec<String>>,             // URLs of referral entries in scope
    pub paged_cookie: Option<Vec<u8>>,            // Empty cookie ends the paged search
    pub vlv_response: Option<VlvResponse>,
    pub sort_result: Option<SortResult>,
    pub outcome: SearchOutcome,
}

impl SearchResult {
    pub fn dns(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.dn.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_order_parsing() {
        let keys = SortKey::parse_order("sn -givenName,+cn");
        assert_eq!(
            keys,
            vec![SortKey::new("sn", false), SortKey::new("givenname", true), SortKey::new("cn", false)]
        );
    }

    #[test]
    fn context_builders() {
        let ctx = OperationContext::new().with_subtree_delete().with_unindexed_search();
        assert!(ctx.subtree_delete && ctx.unindexed_search_allowed);
        assert!(!ctx.manage_dsa_it);
        ctx.cancel.cancel();
        assert!(ctx.check_canceled().unwrap_err().is_canceled());
    }
}
