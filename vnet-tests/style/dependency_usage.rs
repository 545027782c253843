//! Dependency Usage
//!
//! Every crate listed under `[dependencies]` of a `vnet-*` manifest must be
//! referenced from that crate's sources.

use std::fs;
use std::path::{Path, PathBuf};

/// Names under the `[dependencies]` table, ignoring dev and build tables.
fn declared_dependencies(manifest: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut in_dependencies = false;
    for line in manifest.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            in_dependencies = trimmed == "[dependencies]";
            continue;
        }
        if !in_dependencies || trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((name, _)) = trimmed.split_once('=') {
            names.push(name.trim().to_string());
        }
    }
    names
}

fn collect_sources(dir: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') || name == "target" {
            continue;
        }
        if path.is_dir() {
            collect_sources(&path, files);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            files.push(path);
        }
    }
}

fn is_referenced(ident: &str, sources: &[String]) -> bool {
    sources.iter().any(|content| {
        content
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .any(|word| word == ident)
    })
}

#[test]
fn test_declared_dependencies_are_used() {
    let mut unused = Vec::new();
    let mut crates_checked = 0;

    let Ok(entries) = fs::read_dir("..") else {
        panic!("workspace root not readable");
    };
    for entry in entries.flatten() {
        let crate_dir = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        let manifest_path = crate_dir.join("Cargo.toml");
        if !name.starts_with("vnet") || !manifest_path.is_file() {
            continue;
        }
        let manifest = fs::read_to_string(&manifest_path).unwrap();

        let mut files = Vec::new();
        collect_sources(&crate_dir, &mut files);
        let sources: Vec<String> = files
            .iter()
            .filter_map(|path| fs::read_to_string(path).ok())
            .collect();

        for dependency in declared_dependencies(&manifest) {
            let ident = dependency.replace('-', "_");
            if !is_referenced(&ident, &sources) {
                unused.push(format!("{name}: {dependency}"));
            }
        }
        crates_checked += 1;
    }

    assert!(crates_checked > 0, "no vnet crates found");
    assert!(
        unused.is_empty(),
        "dependencies declared but never referenced:\n  {}",
        unused.join("\n  ")
    );
}

#[test]
fn test_dev_dependencies_are_not_counted() {
    let manifest = "[dependencies]\n# Logging\ntracing = \"0.1\"\n\n[dev-dependencies]\nproptest = \"1.0\"\n";
    assert_eq!(declared_dependencies(manifest), vec!["tracing".to_string()]);
}
