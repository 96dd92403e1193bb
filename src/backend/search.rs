use std::collections::BTreeMap;
use std::fmt::Write;
use log::debug;
use crate::backend::entry_container::{ContainerIndexes, EntryContainer};
use crate::codec::dn_key::{after_last_child, before_first_child, find_parent_len};
use crate::core::dn::Dn;
use crate::core::entry::Entry;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::operation::{
    OperationContext, PagedResultsControl, SearchOutcome, SearchRequest, SearchResult, SortKey, SortResult,
    VlvResponse,
};
use crate::core::types::{EntryID, SearchScope};
use crate::index::dn2uri::ReferralRecord;
use crate::index::entry_id_set::EntryIDSet;
use crate::index::index_filter::IndexFilter;
use crate::index::vlv_index::{encode_sort_key, select_window};
use crate::storage::tree::{Cursor, ReadableTransaction};

/// Requesting this attribute returns the index evaluation trace instead of entries
pub const DEBUG_SEARCH_INDEX: &str = "debugsearchindex";

// Defined candidate sets this small skip the scope intersection
const SMALL_CANDIDATE_SET: u64 = 10;

impl EntryContainer {
    /// Evaluate a search below this container's base DN
    pub fn search(&self, request: &SearchRequest, ctx: &OperationContext) -> Result<SearchResult> {
        ctx.check_canceled()?;
        self.check_in_container(&request.base)?;
        validate_controls(request)?;

        let indexes = self.indexes.read();
        let settings = indexes.settings();
        let size_limit = if request.size_limit > 0 { request.size_limit } else { settings.size_limit };
        let lookthrough = ctx.lookthrough_limit.unwrap_or(settings.lookthrough_limit);

        let mut page = request.paged.clone();
        if let Some(paged) = &page {
            if paged.size == 0 {
                // Abandoned paged search
                return Ok(SearchResult { paged_cookie: Some(Vec::new()), ..SearchResult::default() });
            }
            if size_limit > 0 && paged.size >= size_limit {
                page = None;
            }
        }

        let txn = self.storage.begin_read()?;
        let mut search = Search {
            container: self,
            indexes: &indexes,
            txn: txn.as_ref(),
            request,
            ctx,
            size_limit,
            lookthrough,
            page,
            result: SearchResult::default(),
        };
        search.run()?;
        Ok(search.result)
    }
}

fn validate_controls(request: &SearchRequest) -> Result<()> {
    if let Some(sort) = &request.sort {
        if sort.keys.is_empty() && sort.critical {
            return Err(Error::new(
                ErrorKind::UnavailableCriticalExtension,
                "critical sort control names no sort keys".to_string(),
            ));
        }
    }
    if request.vlv.is_some() {
        if request.paged.is_some() {
            return Err(Error::new(
                ErrorKind::ConstraintViolation,
                "VLV and paged results controls cannot be combined".to_string(),
            ));
        }
        if request.sort.as_ref().map(|s| s.keys.is_empty()).unwrap_or(true) {
            return Err(Error::new(
                ErrorKind::VirtualListViewError,
                "VLV control requires a sort control".to_string(),
            ));
        }
    }
    Ok(())
}

/// State of one search evaluation
struct Search<'a> {
    container: &'a EntryContainer,
    indexes: &'a ContainerIndexes,
    txn: &'a dyn ReadableTransaction,
    request: &'a SearchRequest,
    ctx: &'a OperationContext,
    size_limit: usize,
    lookthrough: u64,                         // 0 is unlimited
    page: Option<PagedResultsControl>,
    result: SearchResult,
}

impl<'a> Search<'a> {
    fn run(&mut self) -> Result<()> {
        let request = self.request;
        self.container.check_referral_above(self.txn, &request.base, self.ctx)?;
        if request.scope == SearchScope::BaseObject {
            return self.base_object();
        }

        let sort_keys: Option<Vec<SortKey>> =
            request.sort.as_ref().map(|s| s.keys.clone()).filter(|keys| !keys.is_empty());

        if let Some(keys) = &sort_keys {
            let vlv = self.indexes.vlv_indexes().iter().find(|vlv| {
                vlv.serves(request, keys) && self.container.is_index_trusted(&vlv.tree().index_id)
            });
            if let Some(vlv) = vlv {
                debug!("[EntryContainer] Search served by VLV index {}", vlv.name());
                let records = vlv.sorted_records(self.txn)?;
                self.collect_references()?;
                self.result.sort_result = Some(SortResult::Success);
                let order = self.position(records, keys)?;
                self.emit(&order, true)?;
                return self.verify_base();
            }
        }

        let debug = request.requests_attribute(DEBUG_SEARCH_INDEX);
        let untrusted = self.container.untrusted_indexes();
        let mut evaluator = IndexFilter::new(self.txn, self.indexes.attribute_indexes(), &untrusted, debug);
        let mut candidates = evaluator.evaluate(&request.filter)?;
        let mut trace = evaluator.trace().map(String::from);

        let small = candidates.is_defined() && candidates.size().map(|s| s <= SMALL_CANDIDATE_SET).unwrap_or(false);
        if !small {
            let scope = self.scope_candidates()?;
            if let Some(trace) = &mut trace {
                let _ = write!(trace, " scope={}{}", request.scope, scope);
            }
            candidates.retain_all(&scope);
        }

        if let Some(mut trace) = trace {
            let _ = write!(trace, " final={}", candidates);
            let entry = Entry::new(Dn::parse("cn=debugsearch")?).with(DEBUG_SEARCH_INDEX, &[trace.as_str()]);
            self.result.entries.push(entry);
            return Ok(());
        }

        self.collect_references()?;
        if candidates.is_defined() {
            self.indexed(&candidates, sort_keys.as_deref())?;
        } else {
            self.unindexed(sort_keys.is_some())?;
        }
        self.verify_base()
    }

    fn base_object(&mut self) -> Result<()> {
        let base = &self.request.base;
        let id = self.container.dn2id.get(self.txn, base)?.ok_or_else(|| Error::no_such_object(base))?;
        let entry = self.entry(id)?;
        if !self.ctx.manage_dsa_it {
            if let Some(urls) = entry.referral_urls() {
                return Err(Error::referral(&urls));
            }
        }
        if self.request.filter.matches(&entry, self.container.rules()) {
            self.result.entries.push(entry);
        }
        if self.page.is_some() {
            self.result.paged_cookie = Some(Vec::new());
        }
        Ok(())
    }

    fn entry(&self, id: EntryID) -> Result<Entry> {
        self.indexes.id2entry().get(self.txn, id)?.ok_or_else(|| {
            Error::new(ErrorKind::InvalidState, format!("entry ID {} missing from id2entry", id))
        })
    }

    fn verify_base(&self) -> Result<()> {
        if self.result.entries.is_empty() && self.container.dn2id.get(self.txn, &self.request.base)?.is_none() {
            return Err(Error::no_such_object(&self.request.base));
        }
        Ok(())
    }

    /// Search references for every referral entry in scope
    fn collect_references(&mut self) -> Result<()> {
        if self.ctx.manage_dsa_it {
            return Ok(());
        }
        let base_key = self.container.dn2id.key(&self.request.base);
        let end = after_last_child(&base_key);
        let mut cursor = Cursor::new(self.txn, self.container.dn2uri.tree());
        let mut found = cursor.position_to_key_or_next(&base_key)?;
        while found {
            let (Some(key), Some(value)) = (cursor.key(), cursor.value()) else {
                break;
            };
            if key.as_ref() >= end.as_slice() {
                break;
            }
            let record: ReferralRecord = bincode::deserialize(value)?;
            if Dn::parse(&record.dn)?.matches_base_and_scope(&self.request.base, self.request.scope) {
                self.result.references.push(record.urls);
            }
            found = cursor.next()?;
        }
        Ok(())
    }

    /// IDs of the entries in scope, undefined past min(index entry limit, lookthrough limit)
    fn scope_candidates(&self) -> Result<EntryIDSet> {
        let limit = [self.indexes.settings().index_entry_limit as u64, self.lookthrough]
            .into_iter()
            .filter(|l| *l > 0)
            .min()
            .unwrap_or(0);
        let base_key = self.container.dn2id.key(&self.request.base);
        let mut ids = EntryIDSet::new();
        if self.request.scope == SearchScope::WholeSubtree {
            if let Some(id) = self.container.dn2id.get_by_key(self.txn, &base_key)? {
                ids.add(id);
            }
        }

        let end = after_last_child(&base_key);
        let mut cursor = Cursor::new(self.txn, self.container.dn2id.tree());
        let mut found = cursor.position_to_key_or_next(&before_first_child(&base_key))?;
        while found {
            let (Some(key), Some(value)) = (cursor.key(), cursor.value()) else {
                break;
            };
            if key.as_ref() >= end.as_slice() {
                break;
            }
            if self.request.scope != SearchScope::SingleLevel || find_parent_len(key) == Some(base_key.len()) {
                ids.add(EntryID::from_key(value)?);
                if limit > 0 && ids.size().unwrap_or(0) > limit {
                    return Ok(EntryIDSet::undefined());
                }
            }
            found = cursor.next()?;
        }
        Ok(ids)
    }

    fn indexed(&mut self, candidates: &EntryIDSet, sort_keys: Option<&[SortKey]>) -> Result<()> {
        let ids = candidates.ids();
        if self.lookthrough > 0 && ids.len() as u64 > self.lookthrough {
            debug!("[EntryContainer] {} candidates exceed the lookthrough limit {}", ids.len(), self.lookthrough);
            self.result.outcome = SearchOutcome::AdminLimitExceeded;
            return Ok(());
        }

        let Some(keys) = sort_keys else {
            return self.emit(&ids, false);
        };

        // Sort the entries passing base, scope and filter by (sort key, ID)
        let mut sorted = BTreeMap::new();
        for id in ids {
            self.ctx.check_canceled()?;
            let entry = self.entry(id)?;
            if self.in_scope(&entry) && self.request.filter.matches(&entry, self.container.rules()) {
                sorted.insert(encode_sort_key(&entry, keys, Some(id)), id);
            }
        }
        self.result.sort_result = Some(SortResult::Success);
        let order = self.position(sorted.into_iter().collect(), keys)?;
        self.emit(&order, true)
    }

    /// Apply the VLV window, if any, to a sorted list
    fn position(&mut self, sorted: Vec<(Vec<u8>, EntryID)>, keys: &[SortKey]) -> Result<Vec<EntryID>> {
        let Some(vlv) = &self.request.vlv else {
            return Ok(sorted.into_iter().map(|(_, id)| id).collect());
        };
        let window = select_window(&sorted, vlv, keys)?;
        self.result.vlv_response = Some(VlvResponse {
            target_position: window.target_position,
            content_count: window.content_count,
        });
        Ok(window.ids)
    }

    fn in_scope(&self, entry: &Entry) -> bool {
        entry.dn.matches_base_and_scope(&self.request.base, self.request.scope)
    }

    /// Return the entries of `order`, resuming after a paged results cookie
    fn emit(&mut self, order: &[EntryID], filtered: bool) -> Result<()> {
        let start = match self.page.as_ref().map(|p| p.cookie.as_slice()) {
            Some(cookie) if !cookie.is_empty() => {
                let resume = EntryID::from_key(cookie)?;
                order
                    .iter()
                    .position(|id| *id == resume)
                    .unwrap_or_else(|| order.partition_point(|id| *id < resume))
            }
            _ => 0,
        };

        for id in &order[start..] {
            self.ctx.check_canceled()?;
            if self.page_full() {
                self.result.paged_cookie = Some(id.to_key().to_vec());
                return Ok(());
            }
            let entry = self.entry(*id)?;
            if !filtered && !self.in_scope(&entry) {
                continue;
            }
            if !self.ctx.manage_dsa_it && entry.is_referral() {
                continue;
            }
            if !filtered && !self.request.filter.matches(&entry, self.container.rules()) {
                continue;
            }
            if !self.accept(entry) {
                return Ok(());
            }
        }
        self.finish_page();
        Ok(())
    }

    /// Walk the DN tree below the base when no index narrows the candidates
    fn unindexed(&mut self, sort_requested: bool) -> Result<()> {
        if !self.ctx.unindexed_search_allowed {
            return Err(Error::new(
                ErrorKind::InsufficientAccessRights,
                format!("unindexed search of {} {} is not allowed", self.request.base, self.request.filter),
            ));
        }
        if sort_requested {
            if self.request.vlv.is_some() {
                return Err(Error::new(
                    ErrorKind::UnwillingToPerform,
                    "VLV request cannot be served by an unindexed search".to_string(),
                ));
            }
            if self.request.sort.as_ref().map(|s| s.critical).unwrap_or(false) {
                return Err(Error::new(
                    ErrorKind::UnavailableCriticalExtension,
                    "cannot sort the results of an unindexed search".to_string(),
                ));
            }
            self.result.sort_result = Some(SortResult::UnwillingToPerform);
        }
        debug!("[EntryContainer] Unindexed search of {} {}", self.request.base, self.request.filter);

        let base_key = self.container.dn2id.key(&self.request.base);
        let cookie = self.page.as_ref().map(|p| p.cookie.clone()).filter(|c| !c.is_empty());
        let start = match cookie {
            Some(cookie) => cookie,
            None if self.request.scope == SearchScope::WholeSubtree => base_key.to_vec(),
            None => before_first_child(&base_key),
        };
        let end = after_last_child(&base_key);

        let mut examined: u64 = 0;
        let mut cursor = Cursor::new(self.txn, self.container.dn2id.tree());
        let mut found = cursor.position_to_key_or_next(&start)?;
        while found {
            self.ctx.check_canceled()?;
            let (Some(key), Some(value)) = (cursor.key().cloned(), cursor.value().cloned()) else {
                break;
            };
            if key.as_ref() >= end.as_slice() {
                break;
            }
            found = cursor.next()?;
            if self.request.scope == SearchScope::SingleLevel && find_parent_len(&key) != Some(base_key.len()) {
                continue;
            }
            if self.page_full() {
                self.result.paged_cookie = Some(key.to_vec());
                return Ok(());
            }

            examined += 1;
            if self.lookthrough > 0 && examined > self.lookthrough {
                self.result.outcome = SearchOutcome::AdminLimitExceeded;
                return Ok(());
            }
            let entry = self.entry(EntryID::from_key(&value)?)?;
            if !self.ctx.manage_dsa_it && entry.is_referral() {
                continue;
            }
            if self.request.filter.matches(&entry, self.container.rules()) && !self.accept(entry) {
                return Ok(());
            }
        }
        self.finish_page();
        Ok(())
    }

    fn page_full(&self) -> bool {
        self.page.as_ref().map(|p| self.result.entries.len() >= p.size).unwrap_or(false)
    }

    // False once the size limit stops the search
    fn accept(&mut self, entry: Entry) -> bool {
        if self.size_limit > 0 && self.result.entries.len() >= self.size_limit {
            self.result.outcome = SearchOutcome::SizeLimitExceeded;
            return false;
        }
        self.result.entries.push(entry);
        true
    }

    fn finish_page(&mut self) {
        if self.page.is_some() {
            self.result.paged_cookie = Some(Vec::new());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::backend::entry_container::ContainerSettings;
    use crate::backend::root_container::EntryIdAllocator;
    use crate::core::config::{IndexConfig, IndexType, VlvIndexConfig};
    use crate::core::filter::Filter;
    use crate::core::matching::MatchingRuleRegistry;
    use crate::core::operation::VlvTarget;
    use crate::storage::btree::BTreeStorage;

    fn populated(settings: ContainerSettings) -> EntryContainer {
        let base = Dn::parse("o=test").unwrap();
        let container = EntryContainer::new(
            base.clone(),
            base.normalized(),
            Arc::new(BTreeStorage::in_memory()),
            Arc::new(EntryIdAllocator::new(1)),
            Arc::new(MatchingRuleRegistry::new()),
            None,
            settings,
        )
        .unwrap();
        container.open().unwrap();

        let ctx = OperationContext::new();
        let root = Entry::new(base).with("objectClass", &["organization"]).with("o", &["test"]);
        container.add_entry(&root, &ctx).unwrap();
        let people = Entry::new(Dn::parse("ou=people,o=test").unwrap())
            .with("objectClass", &["organizationalUnit"])
            .with("ou", &["people"]);
        container.add_entry(&people, &ctx).unwrap();
        for (i, sn) in ["kappa", "alpha", "juliet", "bravo", "india", "charlie", "hotel", "delta", "golf", "echo"]
            .iter()
            .enumerate()
        {
            let person = Entry::new(Dn::parse(&format!("uid=u{},ou=people,o=test", i)).unwrap())
                .with("objectClass", &["person"])
                .with("sn", &[sn])
                .with("cn", &[&format!("user {}", i)]);
            container.add_entry(&person, &ctx).unwrap();
        }
        container
    }

    fn settings() -> ContainerSettings {
        ContainerSettings {
            indexes: vec![
                IndexConfig::new("objectClass", &[IndexType::Equality]),
                IndexConfig::new("sn", &[IndexType::Equality, IndexType::Ordering]),
            ],
            ..ContainerSettings::default()
        }
    }

    fn request(scope: SearchScope, filter: &str) -> SearchRequest {
        SearchRequest::new(Dn::parse("o=test").unwrap(), scope, Filter::parse(filter).unwrap())
    }

    #[test]
    fn indexed_search_returns_entries_in_id_order() {
        let container = populated(settings());
        let result = container
            .search(&request(SearchScope::WholeSubtree, "(objectClass=person)"), &OperationContext::new())
            .unwrap();
        assert_eq!(result.entries.len(), 10);
        assert_eq!(result.entries[0].dn.to_string(), "uid=u0,ou=people,o=test");

        let result = container
            .search(&request(SearchScope::SingleLevel, "(objectClass=*)"), &OperationContext::new())
            .unwrap();
        assert_eq!(result.dns(), vec!["ou=people,o=test".to_string()]);
    }

    #[test]
    fn sorted_vlv_window() {
        let container = populated(settings());
        let request = request(SearchScope::WholeSubtree, "(objectClass=person)")
            .with_sort("sn", false)
            .with_vlv(2, 2, VlvTarget::Offset(5));
        let result = container.search(&request, &OperationContext::new()).unwrap();
        let sns: Vec<&str> = result.entries.iter().map(|e| e.values("sn")[0].as_str()).collect();
        assert_eq!(sns, vec!["charlie", "delta", "echo", "golf", "hotel"]);
        assert_eq!(result.vlv_response, Some(VlvResponse { target_position: 5, content_count: 10 }));
        assert_eq!(result.sort_result, Some(SortResult::Success));
    }

    #[test]
    fn vlv_index_serves_matching_requests() {
        let mut settings = settings();
        settings.vlv_indexes.push(VlvIndexConfig {
            name: "bySn".to_string(),
            base_dn: "o=test".to_string(),
            scope: SearchScope::WholeSubtree,
            filter: "(objectClass=person)".to_string(),
            sort_order: "sn".to_string(),
        });
        let container = populated(settings);
        let request = request(SearchScope::WholeSubtree, "(objectClass=person)")
            .with_sort("sn", true)
            .with_vlv(0, 1, VlvTarget::GreaterThanOrEqual("echo".to_string()));
        let result = container.search(&request, &OperationContext::new()).unwrap();
        let sns: Vec<&str> = result.entries.iter().map(|e| e.values("sn")[0].as_str()).collect();
        assert_eq!(sns, vec!["echo", "golf"]);
        assert_eq!(result.vlv_response.unwrap().target_position, 5);
    }

    #[test]
    fn paged_results_resume_from_cookie() {
        let container = populated(settings());
        let ctx = OperationContext::new();
        let mut cookie = Vec::new();
        let mut seen = Vec::new();
        loop {
            let request = request(SearchScope::WholeSubtree, "(objectClass=person)").with_paged(4, cookie.clone());
            let result = container.search(&request, &ctx).unwrap();
            seen.extend(result.dns());
            cookie = result.paged_cookie.unwrap();
            if cookie.is_empty() {
                break;
            }
        }
        assert_eq!(seen.len(), 10);

        let abandoned = request(SearchScope::WholeSubtree, "(objectClass=person)").with_paged(0, Vec::new());
        let result = container.search(&abandoned, &ctx).unwrap();
        assert!(result.entries.is_empty());
        assert_eq!(result.paged_cookie, Some(Vec::new()));
    }

    #[test]
    fn unindexed_search_requires_privilege() {
        // Low entry limit so the scope set cannot narrow the candidates either
        let container = populated(ContainerSettings { index_entry_limit: 5, ..settings() });
        let request = request(SearchScope::WholeSubtree, "(cn=user 3)");
        let err = container.search(&request, &OperationContext::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InsufficientAccessRights);

        let ctx = OperationContext::new().with_unindexed_search();
        let result = container.search(&request, &ctx).unwrap();
        assert_eq!(result.dns(), vec!["uid=u3,ou=people,o=test".to_string()]);

        let sorted = request.clone().with_sort("sn", true);
        assert_eq!(container.search(&sorted, &ctx).unwrap_err().kind, ErrorKind::UnavailableCriticalExtension);
        let sorted = request.with_sort("sn", false);
        assert_eq!(container.search(&sorted, &ctx).unwrap().sort_result, Some(SortResult::UnwillingToPerform));
    }

    #[test]
    fn limits_and_controls() {
        let container = populated(settings());
        let ctx = OperationContext::new();
        let limited = request(SearchScope::WholeSubtree, "(objectClass=person)").with_size_limit(3);
        let result = container.search(&limited, &ctx).unwrap();
        assert_eq!(result.entries.len(), 3);
        assert_eq!(result.outcome, SearchOutcome::SizeLimitExceeded);

        let mut ctx = OperationContext::new();
        ctx.lookthrough_limit = Some(5);
        let result = container.search(&request(SearchScope::WholeSubtree, "(objectClass=person)"), &ctx).unwrap();
        assert_eq!(result.outcome, SearchOutcome::AdminLimitExceeded);
        assert!(result.entries.is_empty());

        let both = request(SearchScope::WholeSubtree, "(sn=*)")
            .with_sort("sn", false)
            .with_vlv(0, 0, VlvTarget::Offset(1))
            .with_paged(5, Vec::new());
        let err = container.search(&both, &OperationContext::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConstraintViolation);

        let empty_sort = request(SearchScope::WholeSubtree, "(sn=*)").with_sort("", true);
        let err = container.search(&empty_sort, &OperationContext::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnavailableCriticalExtension);
    }

    #[test]
    fn debug_search_index_trace() {
        let container = populated(settings());
        let request = request(SearchScope::WholeSubtree, "(sn=alpha)").with_attributes(&[DEBUG_SEARCH_INDEX]);
        let result = container.search(&request, &OperationContext::new()).unwrap();
        assert_eq!(result.entries.len(), 1);
        let trace = &result.entries[0].values(DEBUG_SEARCH_INDEX)[0];
        assert!(trace.contains("[INDEX:sn.equality][COUNT:1]"));
        assert!(trace.contains("final=[COUNT:1]"));
    }
}
