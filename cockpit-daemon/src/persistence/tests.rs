use super::*;
use tempfile::TempDir;

#[test]
fn test_missing_file_is_none() {
    let dir = TempDir::new().unwrap();
    let persistence = StatePersistence::new(dir.path().join("state.json"));
    assert_eq!(persistence.load().unwrap(), None);
}

#[test]
fn test_save_and_load() {
    let dir = TempDir::new().unwrap();
    let persistence = StatePersistence::new(dir.path().join("nested").join("state.json"));

    let mut state = PersistedState {
        active_model: Some("org/large".to_string()),
        ..PersistedState::default()
    };
    state.processes.insert(
        "vllm".to_string(),
        PersistedProcess {
            pid: 4242,
            start_time: Some(1_700_000_000),
            generation: 3,
            started_at: Utc::now(),
        },
    );

    persistence.save(&state).unwrap();
    assert_eq!(persistence.load().unwrap(), Some(state.clone()));

    // Overwrite leaves no temp files behind
    state.processes.clear();
    persistence.save(&state).unwrap();
    let entries: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(entries, vec![std::ffi::OsString::from("state.json")]);
    assert!(persistence.load().unwrap().unwrap().processes.is_empty());
}

#[test]
fn test_corrupt_file_is_ignored() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, "{ not json").unwrap();

    let persistence = StatePersistence::new(path);
    assert_eq!(persistence.load().unwrap(), None);
}

#[cfg(unix)]
#[test]
fn test_state_file_permissions() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let persistence = StatePersistence::new(dir.path().join("state.json"));
    persistence.save(&PersistedState::default()).unwrap();

    let mode = std::fs::metadata(persistence.path()).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}
