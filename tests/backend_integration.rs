use std::path::Path;
use dirstore::backend::inspect::Inspector;
use dirstore::backend::local_backend::Backend;
use dirstore::core::config::{BackendConfig, ImportConfig, ImportPhase, IndexConfig, IndexType, PhaseHook, RebuildConfig, RebuildMode, VerifyConfig, VlvIndexConfig};
use dirstore::core::dn::Dn;
use dirstore::core::entry::Entry;
use dirstore::core::error::ErrorKind;
use dirstore::core::filter::Filter;
use dirstore::core::operation::{OperationContext, SearchRequest, VlvTarget};
use dirstore::core::types::{CancellationToken, SearchScope};
use dirstore::import::source::VecEntryReader;

fn config(dir: &Path) -> BackendConfig {
    BackendConfig {
        storage_path: dir.join("db"),
        base_dns: vec!["dc=example,dc=com".to_string()],
        indexes: vec![
            IndexConfig::new("objectClass", &[IndexType::Equality]),
            IndexConfig::new("cn", &[IndexType::Equality, IndexType::Substring]),
            IndexConfig::new("sn", &[IndexType::Equality, IndexType::Ordering]),
        ],
        import_thread_count: 2,
        ..BackendConfig::default()
    }
}

fn dn(s: &str) -> Dn {
    Dn::parse(s).unwrap()
}

fn base() -> Entry {
    Entry::new(dn("dc=example,dc=com")).with("objectClass", &["domain"]).with("dc", &["example"])
}

fn people() -> Entry {
    Entry::new(dn("ou=people,dc=example,dc=com"))
        .with("objectClass", &["organizationalUnit"])
        .with("ou", &["people"])
}

fn person(i: usize, sn: &str) -> Entry {
    Entry::new(dn(&format!("uid=u{},ou=people,dc=example,dc=com", i)))
        .with("objectClass", &["person"])
        .with("cn", &[&format!("user {}", i)])
        .with("sn", &[sn])
}

const SURNAMES: [&str; 10] = ["kappa", "alpha", "juliet", "bravo", "india", "charlie", "hotel", "delta", "golf", "echo"];

fn directory() -> Vec<Entry> {
    let mut entries = vec![base(), people()];
    entries.extend(SURNAMES.iter().enumerate().map(|(i, sn)| person(i, sn)));
    entries
}

fn import_config() -> ImportConfig {
    ImportConfig { available_memory: Some(256 * 1024 * 1024), ..ImportConfig::default() }
}

fn subtree(filter: &str) -> SearchRequest {
    SearchRequest::new(dn("dc=example,dc=com"), SearchScope::WholeSubtree, Filter::parse(filter).unwrap())
}

#[test]
fn small_import_counts_children() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Backend::open(config(dir.path())).unwrap();
    let mut reader = VecEntryReader::new(vec![base(), people(), person(0, "alpha")]);
    let result = backend.import(&import_config(), &mut reader).unwrap();
    assert_eq!(result.counts.imported, 3);
    assert!(result.rejects.is_empty());

    assert_eq!(backend.num_subordinates(&dn("dc=example,dc=com"), false).unwrap(), 1);
    assert_eq!(backend.num_subordinates(&dn("ou=people,dc=example,dc=com"), false).unwrap(), 1);
    assert_eq!(backend.entry_count(&dn("dc=example,dc=com")).unwrap(), 3);

    let found = backend.search(&subtree("(objectClass=*)"), &OperationContext::new()).unwrap();
    assert_eq!(
        found.dns(),
        vec![
            "dc=example,dc=com".to_string(),
            "ou=people,dc=example,dc=com".to_string(),
            "uid=u0,ou=people,dc=example,dc=com".to_string(),
        ]
    );
    backend.close().unwrap();
}

#[test]
fn bulk_import_matches_online_adds() {
    let dir = tempfile::tempdir().unwrap();
    let imported = Backend::open(config(&dir.path().join("imported"))).unwrap();
    imported.import(&import_config(), &mut VecEntryReader::new(directory())).unwrap();

    let added = Backend::open(config(&dir.path().join("added"))).unwrap();
    let ctx = OperationContext::new();
    for entry in directory() {
        added.add_entry(&entry, &ctx).unwrap();
    }

    for filter in ["(objectClass=person)", "(sn>=golf)", "(cn=*ser*)", "(&(objectClass=person)(sn=echo))"] {
        let request = subtree(filter);
        assert_eq!(
            imported.search(&request, &ctx).unwrap().dns(),
            added.search(&request, &ctx).unwrap().dns(),
            "{}",
            filter
        );
    }
    for base in ["dc=example,dc=com", "ou=people,dc=example,dc=com"] {
        assert_eq!(
            imported.num_subordinates(&dn(base), true).unwrap(),
            added.num_subordinates(&dn(base), true).unwrap()
        );
    }

    let verify = VerifyConfig { base_dn: "dc=example,dc=com".to_string(), ..VerifyConfig::default() };
    for backend in [&imported, &added] {
        let result = backend.verify(&verify).unwrap();
        assert_eq!(result.checked, 12);
        assert_eq!(result.error_count(), 0, "{:?}", result.errors);
    }
}

#[test]
fn canceled_rebuild_leaves_indexes_untrusted() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Backend::open(config(dir.path())).unwrap();
    backend.import(&import_config(), &mut VecEntryReader::new(directory())).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let rebuild = RebuildConfig {
        base_dn: "dc=example,dc=com".to_string(),
        mode: RebuildMode::All,
        available_memory: Some(256 * 1024 * 1024),
        cancel,
        phase_hook: Some(PhaseHook::new(move |phase| {
            if phase == ImportPhase::PhaseTwo {
                trigger.cancel();
            }
        })),
        ..RebuildConfig::default()
    };
    let err = backend.rebuild(&rebuild).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Canceled);
    let stats = backend.stats().unwrap();
    assert!(stats.containers[0].untrusted_indexes.contains(&"sn.equality".to_string()));

    let degraded = RebuildConfig {
        base_dn: "dc=example,dc=com".to_string(),
        mode: RebuildMode::Degraded,
        available_memory: Some(256 * 1024 * 1024),
        ..RebuildConfig::default()
    };
    let result = backend.rebuild(&degraded).unwrap();
    assert_eq!(result.processed, 12);
    assert!(backend.stats().unwrap().containers[0].untrusted_indexes.is_empty());

    let found = backend.search(&subtree("(sn=delta)"), &OperationContext::new()).unwrap();
    assert_eq!(found.dns(), vec!["uid=u7,ou=people,dc=example,dc=com".to_string()]);
}

#[test]
fn entry_limit_makes_keys_undefined() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Backend::open(BackendConfig { index_entry_limit: 4, ..config(dir.path()) }).unwrap();
    let mut entries = vec![base(), people()];
    entries.extend((0..5).map(|i| person(i, "same")));
    backend.import(&import_config(), &mut VecEntryReader::new(entries)).unwrap();

    let container = backend.container(&dn("dc=example,dc=com")).unwrap();
    let stats = Inspector::new(&container).entry_limit_stats().unwrap();
    let sn = stats
        .iter()
        .find(|s| s.tree.as_ref().map(|t| t.index_id == "sn.equality").unwrap_or(false))
        .unwrap();
    assert_eq!(sn.undefined_keys, 1);

    let ctx = OperationContext::new().with_unindexed_search();
    assert_eq!(backend.search(&subtree("(sn=same)"), &ctx).unwrap().entries.len(), 5);
}

#[test]
fn vlv_index_built_by_import() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.vlv_indexes.push(VlvIndexConfig {
        name: "bySn".to_string(),
        base_dn: "dc=example,dc=com".to_string(),
        scope: SearchScope::WholeSubtree,
        filter: "(objectClass=person)".to_string(),
        sort_order: "sn".to_string(),
    });
    let backend = Backend::open(config).unwrap();
    backend.import(&import_config(), &mut VecEntryReader::new(directory())).unwrap();

    let request = subtree("(objectClass=person)").with_sort("sn", true).with_vlv(2, 2, VlvTarget::Offset(5));
    let result = backend.search(&request, &OperationContext::new()).unwrap();
    let sns: Vec<&str> = result.entries.iter().map(|e| e.values("sn")[0].as_str()).collect();
    assert_eq!(sns, vec!["charlie", "delta", "echo", "golf", "hotel"]);
    let response = result.vlv_response.unwrap();
    assert_eq!((response.target_position, response.content_count), (5, 10));
}

#[test]
fn referrals_and_renames() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Backend::open(config(dir.path())).unwrap();
    let ctx = OperationContext::new();
    for entry in directory() {
        backend.add_entry(&entry, &ctx).unwrap();
    }
    let referral = Entry::new(dn("ou=remote,dc=example,dc=com"))
        .with("objectClass", &["referral", "extensibleObject"])
        .with("ref", &["ldap://other.example.com/ou=remote,dc=example,dc=com"]);
    backend.add_entry(&referral, &ctx).unwrap();

    let result = backend.search(&subtree("(objectClass=person)"), &ctx).unwrap();
    assert_eq!(result.references, vec![vec!["ldap://other.example.com/ou=remote,dc=example,dc=com".to_string()]]);
    let below = SearchRequest::new(dn("cn=x,ou=remote,dc=example,dc=com"), SearchScope::BaseObject, Filter::match_all());
    assert_eq!(backend.search(&below, &ctx).unwrap_err().kind, ErrorKind::Referral);

    let staff = Entry::new(dn("ou=staff,dc=example,dc=com"))
        .with("objectClass", &["organizationalUnit"])
        .with("ou", &["staff"]);
    backend.rename_entry(&dn("ou=people,dc=example,dc=com"), &staff, &ctx).unwrap();
    assert!(!backend.entry_exists(&dn("uid=u3,ou=people,dc=example,dc=com")).unwrap());
    let moved = backend.get_entry(&dn("uid=u3,ou=staff,dc=example,dc=com")).unwrap().unwrap();
    assert_eq!(moved.values("sn"), ["bravo".to_string()]);
    assert_eq!(backend.num_subordinates(&dn("ou=staff,dc=example,dc=com"), false).unwrap(), 10);

    let outside = Entry::new(dn("ou=people,o=elsewhere"));
    let err = backend.rename_entry(&dn("ou=staff,dc=example,dc=com"), &outside, &ctx).unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnwillingToPerform);

    let base_dn = dn("dc=example,dc=com");
    let children_before = backend.num_subordinates(&base_dn, false).unwrap();
    let count_before = backend.entry_count(&base_dn).unwrap();
    let removed = backend
        .delete_entry(&dn("ou=staff,dc=example,dc=com"), &ctx.clone().with_subtree_delete())
        .unwrap();
    assert_eq!(removed, 11);
    assert_eq!(backend.num_subordinates(&base_dn, false).unwrap(), children_before - 1);
    assert_eq!(backend.entry_count(&base_dn).unwrap(), count_before - 11);
    let result = backend.search(&subtree("(objectClass=person)"), &ctx).unwrap();
    assert!(result.entries.is_empty());
    assert!(backend.search(&subtree("(sn=bravo)"), &ctx).unwrap().entries.is_empty());
}

#[test]
fn partial_import_keeps_other_branches() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Backend::open(config(dir.path())).unwrap();
    let ctx = OperationContext::new();
    for entry in directory() {
        backend.add_entry(&entry, &ctx).unwrap();
    }
    let groups = Entry::new(dn("ou=groups,dc=example,dc=com"))
        .with("objectClass", &["organizationalUnit"])
        .with("ou", &["groups"]);
    backend.add_entry(&groups, &ctx).unwrap();

    let replacement = vec![people(), person(42, "zulu")];
    let config = ImportConfig {
        include_branches: vec!["ou=people,dc=example,dc=com".to_string()],
        ..import_config()
    };
    let result = backend.import(&config, &mut VecEntryReader::new(replacement)).unwrap();
    assert_eq!(result.counts.imported, 2);
    assert_eq!(result.counts.migrated, 2);

    assert!(backend.entry_exists(&dn("ou=groups,dc=example,dc=com")).unwrap());
    assert!(!backend.entry_exists(&dn("uid=u0,ou=people,dc=example,dc=com")).unwrap());
    let found = backend.search(&subtree("(objectClass=person)"), &ctx).unwrap();
    assert_eq!(found.dns(), vec!["uid=u42,ou=people,dc=example,dc=com".to_string()]);
    assert_eq!(backend.entry_count(&dn("dc=example,dc=com")).unwrap(), 4);
    assert_eq!(backend.base_dns().len(), 1);
}
