use std::fs;

use tempfile::TempDir;

use switchboard_lib::fsops::write_atomic;

#[test]
fn writes_new_file_with_exact_content() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("backend.env");
    write_atomic(&path, b"SWITCHBOARD_PROFILE=sqlite\n").unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"SWITCHBOARD_PROFILE=sqlite\n");
}

#[test]
fn replaces_existing_content_in_one_step() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("backend.env");
    fs::write(&path, b"old content that is much longer than the new one").unwrap();
    write_atomic(&path, b"new").unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"new");
}

#[test]
fn leaves_no_temp_files_behind() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("backend.env");
    write_atomic(&path, b"content").unwrap();
    let names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["backend.env".to_string()], "{names:?}");
}

#[test]
fn rejects_a_path_without_a_parent() {
    let err = write_atomic(std::path::Path::new(""), b"content").unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
}

#[test]
fn fails_when_the_parent_directory_is_missing() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("missing").join("backend.env");
    assert!(write_atomic(&path, b"content").is_err());
}
