use anyhow::Result;
use mail_agent::folders::{self, build_tree, FolderSelector};
use mail_agent::Error;

pub mod utils;
use utils::*;

fn sample_store() -> FakeMailStore {
    let store = FakeMailStore::new();
    store
        .add_folder(INBOX_ID, "f-clients", "Clients")
        .add_folder(INBOX_ID, "f-archive", "archive")
        .add_folder("f-clients", "f-acme", "ACME")
        .add_folder("f-clients", "f-zeta", "Zeta")
        .add_folder("f-acme", "f-2024", "2024")
        .add_hidden_folder(INBOX_ID, "f-hidden", "Secret");
    store
}

#[test]
fn tree_is_breadth_first_and_sorted() -> Result<()> {
    let store = sample_store();
    let tree = build_tree(&store, "inbox", false, 100)?;

    let paths: Vec<&str> = tree.index().iter().map(|n| n.path.as_str()).collect();
    assert_eq!(
        paths,
        vec![
            "/Inbox",
            "/Inbox/archive",
            "/Inbox/Clients",
            "/Inbox/Clients/ACME",
            "/Inbox/Clients/Zeta",
            "/Inbox/Clients/ACME/2024",
        ]
    );
    assert_eq!(tree.root().child_ids, vec!["f-archive", "f-clients"]);
    assert_eq!(tree.get("f-2024").unwrap().parent_id.as_deref(), Some("f-acme"));

    let nested = tree.nested();
    assert_eq!(nested["children"][1]["display_name"], "Clients");
    assert_eq!(nested["children"][1]["children"][0]["path"], "/Inbox/Clients/ACME");
    Ok(())
}

#[test]
fn hidden_folders_need_opt_in() -> Result<()> {
    let store = sample_store();
    assert_eq!(build_tree(&store, "inbox", false, 100)?.len(), 6);
    let tree = build_tree(&store, "inbox", true, 100)?;
    assert_eq!(tree.len(), 7);
    assert!(tree.get("f-hidden").unwrap().is_hidden);
    Ok(())
}

#[test]
fn traversal_limit_fails_without_partial_result() {
    let store = sample_store();
    let result = build_tree(&store, "inbox", false, 3);
    match result {
        Err(Error::TraversalLimitExceeded { limit }) => assert_eq!(limit, 3),
        other => panic!("expected traversal limit error, got {:?}", other.map(|t| t.len())),
    }
    assert!(build_tree(&store, "inbox", false, 0).is_err());
}

#[test]
fn path_resolution_is_case_insensitive_and_deterministic() -> Result<()> {
    let store = sample_store();
    let selector = FolderSelector::Path("inbox/clients//acme/2024/".to_string());
    let first = folders::resolve(&store, &selector, false)?;
    let second = folders::resolve(&store, &selector, false)?;
    assert_eq!(first, second);
    assert_eq!(first.resolved_folder_id, "f-2024");
    assert_eq!(first.resolved_folder_path.as_deref(), Some("/Inbox/Clients/ACME/2024"));
    assert_eq!(first.folder_mode, "path");

    let tree = build_tree(&store, "inbox", false, 100)?;
    assert_eq!(tree.resolve("Clients/ACME/2024")?.id, first.resolved_folder_id);
    Ok(())
}

#[test]
fn missing_segment_names_prefix() {
    let store = sample_store();
    let selector = FolderSelector::Path("Clients/Globex".to_string());
    match folders::resolve(&store, &selector, false) {
        Err(Error::FolderNotFound {
            segment,
            consumed,
            available,
        }) => {
            assert_eq!(segment, "Globex");
            assert_eq!(consumed, "/Inbox/Clients");
            assert_eq!(available, vec!["ACME", "Zeta"]);
        }
        other => panic!("expected FolderNotFound, got {:?}", other),
    }
}

#[test]
fn duplicate_sibling_names_are_ambiguous() -> Result<()> {
    let store = sample_store();
    store
        .add_folder("f-clients", "f-reports-1", "Reports")
        .add_folder("f-clients", "f-reports-2", "reports");

    let selector = FolderSelector::Path("Clients/REPORTS".to_string());
    match folders::resolve(&store, &selector, false) {
        Err(Error::AmbiguousFolderPath { candidates, .. }) => {
            assert_eq!(candidates, vec!["f-reports-1", "f-reports-2"]);
        }
        other => panic!("expected AmbiguousFolderPath, got {:?}", other),
    }

    // the flat index keeps both
    let tree = build_tree(&store, "inbox", false, 100)?;
    let reports = tree
        .index()
        .iter()
        .filter(|n| n.path.to_lowercase() == "/inbox/clients/reports")
        .count();
    assert_eq!(reports, 2);
    Ok(())
}

#[test]
fn explicit_id_bypasses_resolution() -> Result<()> {
    let store = FakeMailStore::new();
    let resolved = folders::resolve(&store, &FolderSelector::Id("AAMk-opaque".to_string()), false)?;
    assert_eq!(resolved.resolved_folder_id, "AAMk-opaque");
    assert_eq!(resolved.resolved_folder_path, None);
    assert_eq!(store.folder_calls.get(), 0);
    Ok(())
}
