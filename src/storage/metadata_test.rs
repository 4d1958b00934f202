use super::metadata::FileMetadataStore;
use super::metadata::MetadataStore;
use super::metadata::PersistedMetadata;
use crate::protocol::PeerId;

fn store(name: &str) -> FileMetadataStore {
    let path = format!("/tmp/raftcell_{}/raft-meta", name);
    let _ = std::fs::remove_dir_all(format!("/tmp/raftcell_{}", name));
    FileMetadataStore::new(path)
}

#[test]
fn test_load_without_file_is_none() {
    let store = store("test_load_without_file_is_none");
    assert_eq!(store.load().unwrap(), None);
}

#[test]
fn test_save_and_load_round_trip() {
    let store = store("test_save_and_load_round_trip");
    let metadata = PersistedMetadata {
        current_term: 4,
        voted_for: Some(PeerId::new("n2")),
    };
    store.save(&metadata).unwrap();
    assert_eq!(store.load().unwrap(), Some(metadata));
}

#[test]
fn test_save_overwrites_atomically() {
    let store = store("test_save_overwrites_atomically");
    store
        .save(&PersistedMetadata {
            current_term: 1,
            voted_for: None,
        })
        .unwrap();
    store
        .save(&PersistedMetadata {
            current_term: 2,
            voted_for: Some(PeerId::new("n3")),
        })
        .unwrap();

    let loaded = store.load().unwrap().unwrap();
    assert_eq!(loaded.current_term, 2);
    assert_eq!(loaded.voted_for, Some(PeerId::new("n3")));
}

#[test]
fn test_default_metadata_is_term_zero() {
    let metadata = PersistedMetadata::default();
    assert_eq!(metadata.current_term, 0);
    assert_eq!(metadata.voted_for, None);
}
