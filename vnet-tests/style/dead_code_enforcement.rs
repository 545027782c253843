//! Dead Code Enforcement
//!
//! Production code in the `vnet-*` crates must not carry #[allow(dead_code)].
//! Test code is exempt.

use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
struct DeadCodeViolation {
    file_path: String,
    line_number: usize,
    context: String,
}

struct DeadCodeChecker {
    violations: Vec<DeadCodeViolation>,
    files_checked: usize,
}

impl DeadCodeChecker {
    fn new() -> Self {
        Self {
            violations: Vec::new(),
            files_checked: 0,
        }
    }

    fn find_rust_files(&self) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
        let mut files = Vec::new();
        Self::find_rust_files_recursive(Path::new(".."), &mut files, 0)?;
        Ok(files)
    }

    fn find_rust_files_recursive(
        dir: &Path,
        files: &mut Vec<PathBuf>,
        depth: usize,
    ) -> Result<(), Box<dyn std::error::Error>> {
        if depth > 8 || !dir.is_dir() {
            return Ok(());
        }

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if let Some(name) = path.file_name() {
                let name = name.to_string_lossy();
                if name.starts_with('.') || name == "target" {
                    continue;
                }
                if depth == 0 && path.is_dir() && !name.starts_with("vnet") {
                    continue;
                }
            }

            if path.is_dir() {
                Self::find_rust_files_recursive(&path, files, depth + 1)?;
            } else if path.extension().is_some_and(|ext| ext == "rs") {
                files.push(path);
            }
        }
        Ok(())
    }

    fn is_test_file(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy().to_lowercase();

        path_str.contains("/tests/")
            || path_str.contains("/benches/")
            || path_str.contains("vnet-tests")
            || path_str.contains("test_")
            || path_str.contains("_test")
            || path_str.ends_with("tests.rs")
    }

    fn scan_content(&mut self, path: &Path, content: &str) {
        for (index, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.starts_with("#[allow(") && trimmed.contains("dead_code") {
                self.violations.push(DeadCodeViolation {
                    file_path: path.display().to_string(),
                    line_number: index + 1,
                    context: trimmed.to_string(),
                });
            }
        }
    }

    fn check_file(&mut self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        if self.is_test_file(path) {
            return Ok(());
        }

        let content = fs::read_to_string(path)?;
        self.files_checked += 1;
        self.scan_content(path, &content);
        Ok(())
    }

    fn check_workspace(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        for file in self.find_rust_files()? {
            self.check_file(&file)?;
        }
        Ok(())
    }

    fn report_violations(&self) -> bool {
        if self.violations.is_empty() {
            println!(
                "Dead code enforcement: {} files checked, no violations found",
                self.files_checked
            );
            return true;
        }

        println!("Dead code enforcement violations found:");
        for violation in &self.violations {
            println!("{}:{}", violation.file_path, violation.line_number);
            println!("  {}", violation.context);
        }
        println!(
            "Found {} violation(s) in {} file(s) checked",
            self.violations.len(),
            self.files_checked
        );
        println!("Remove the unused code or use it. Test files are exempt.");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_test_file() {
        let checker = DeadCodeChecker::new();

        assert!(checker.is_test_file(Path::new("../vnet-sim/tests/scheduler.rs")));
        assert!(checker.is_test_file(Path::new("../vnet-tests/integration/harness.rs")));
        assert!(checker.is_test_file(Path::new("../vnet-sim/benches/performance.rs")));
        assert!(checker.is_test_file(Path::new("src/socket_tests.rs")));

        assert!(!checker.is_test_file(Path::new("../vnet-sim/src/lib.rs")));
        assert!(!checker.is_test_file(Path::new("../vnet-sim/src/network/state.rs")));
        assert!(!checker.is_test_file(Path::new("../vnet-core/src/address.rs")));
    }

    #[test]
    fn test_dead_code_detection() {
        let mut checker = DeadCodeChecker::new();
        let content = r#"
use std::collections::HashMap;

#[allow(dead_code)]
struct UnusedRoute {
    hops: u32,
}

#[allow(clippy::missing_docs, dead_code)]
fn unused_lookup() {}

// #[allow(dead_code)] in a comment is fine
"#;

        checker.scan_content(Path::new("route.rs"), content);

        assert_eq!(checker.violations.len(), 2);
        assert_eq!(checker.violations[0].line_number, 4);
        assert_eq!(checker.violations[1].line_number, 9);
    }

    #[test]
    fn dead_code_enforcement() {
        let mut checker = DeadCodeChecker::new();

        checker
            .check_workspace()
            .expect("Failed to check workspace");

        assert!(
            checker.report_violations(),
            "Dead code allowance violations found in production code - see output above"
        );
    }
}
