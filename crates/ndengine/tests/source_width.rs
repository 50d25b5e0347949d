//! Workspace sources stay within rustfmt's default 100-column width.

use std::fs;
use std::path::{Path, PathBuf};

const MAX_WIDTH: usize = 100;

fn rust_files(dir: &Path, out: &mut Vec<PathBuf>) {
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            if path.file_name().is_some_and(|name| name != "target") {
                rust_files(&path, out);
            }
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            out.push(path);
        }
    }
}

#[test]
fn no_line_exceeds_rustfmt_width() {
    let crates = Path::new(env!("CARGO_MANIFEST_DIR")).parent().unwrap();
    let mut files = Vec::new();
    rust_files(crates, &mut files);
    assert!(files.len() > 10, "found only {} sources under {}", files.len(), crates.display());

    let mut long = Vec::new();
    for file in &files {
        let text = fs::read_to_string(file).unwrap();
        for (index, line) in text.lines().enumerate() {
            let width = line.chars().count();
            if width > MAX_WIDTH {
                long.push(format!("{}:{} ({width} columns)", file.display(), index + 1));
            }
        }
    }
    assert!(long.is_empty(), "lines over {MAX_WIDTH} columns:\n{}", long.join("\n"));
}
