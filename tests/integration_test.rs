use std::fs;
use std::process::Command;

#[test]
fn test_cli_reads_blocks() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");

    // Five files of 4 blocks each, 1024 bytes per block
    let mut list = String::new();
    for i in 0..5u8 {
        let path = dir.path().join(format!("input_{i}.bin"));
        fs::write(&path, vec![i; 4096]).expect("Failed to create input file");
        list.push_str(&format!("{}\n", path.display()));
    }
    let list_path = dir.path().join("files.txt");
    fs::write(&list_path, list).expect("Failed to write file list");

    let output = Command::new(env!("CARGO_BIN_EXE_pstream"))
        .arg(&list_path)
        .args(["-j", "2", "--block", "2", "--block-size", "1024", "-q"])
        .output()
        .expect("Failed to execute pstream");

    if !output.status.success() {
        eprintln!("stdout: {}", String::from_utf8_lossy(&output.stdout));
        eprintln!("stderr: {}", String::from_utf8_lossy(&output.stderr));
        panic!("pstream failed");
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Using 2 worker threads"));
    assert!(stdout.contains("Files read       : 5"));
    assert!(stdout.contains("Total data bytes : 5120"));
    assert!(stdout.contains("Per file read"));
    assert!(stdout.contains("Result hash      : "));
}

#[test]
fn test_cli_rejects_missing_file_list() {
    let output = Command::new(env!("CARGO_BIN_EXE_pstream"))
        .arg("/definitely/not/a/file/list.txt")
        .arg("-q")
        .output()
        .expect("Failed to execute pstream");

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to load file list"));
}
