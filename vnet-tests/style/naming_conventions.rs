//! Naming Convention Checker
//!
//! Enforces the critical naming conventions: banned function prefixes,
//! banned type suffixes, generic module names and the `# Errors` doc format.

use std::fs;
use std::path::{Path, PathBuf};

/// A naming violation found in the code
#[derive(Debug)]
struct NamingViolation {
    file_path: String,
    line_number: usize,
    violation_type: &'static str,
    message: String,
}

impl NamingViolation {
    fn new(file_path: &Path, line_number: usize, violation_type: &'static str, message: String) -> Self {
        Self {
            file_path: file_path.display().to_string(),
            line_number,
            violation_type,
            message,
        }
    }
}

const BANNED_PREFIXES: [(&str, &str); 3] = [
    ("get_", "Use the noun directly: socket.state() not socket.get_state()"),
    ("set_", "Use a descriptive verb: configure_bandwidth() not set_bandwidth()"),
    ("handle_", "Be specific: on_connect_request() not handle_request()"),
];

const BANNED_SUFFIXES: [(&str, &str); 6] = [
    ("Factory", "Use a builder or a plain new() function"),
    ("Service", "Usually adds no semantic value"),
    ("Manager", "Name what it IS, not its role"),
    ("Handler", "Be more specific about what you're handling"),
    ("Processor", "Be more specific about what you're processing"),
    ("Controller", "Be more specific about what you're controlling"),
];

const BANNED_MODULES: [&str; 5] = ["utils", "common", "helpers", "misc", "stuff"];

/// Checker over the workspace's `vnet-*` crates
struct NamingChecker {
    violations: Vec<NamingViolation>,
    files_checked: usize,
}

impl NamingChecker {
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
        if depth > 8 {
            return Ok(());
        }

        if let Some(name) = dir.file_name() {
            let name = name.to_string_lossy();
            if name == "target" || name.starts_with('.') {
                return Ok(());
            }
            // Only the workspace's own crates
            if depth == 1 && !name.starts_with("vnet") {
                return Ok(());
            }
        }

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                Self::find_rust_files_recursive(&path, files, depth + 1)?;
            } else if path.extension().is_some_and(|ext| ext == "rs") {
                files.push(path);
            }
        }
        Ok(())
    }

    fn check_function_prefixes(&mut self, file_path: &Path, content: &str) {
        for (line_num, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.starts_with("//") {
                continue;
            }
            let is_fn = trimmed.starts_with("pub fn ")
                || trimmed.starts_with("pub(crate) fn ")
                || trimmed.starts_with("fn ");
            if !is_fn {
                continue;
            }
            for (prefix, correction) in BANNED_PREFIXES {
                if trimmed.contains(&format!("fn {prefix}")) {
                    self.violations.push(NamingViolation::new(
                        file_path,
                        line_num + 1,
                        "BANNED_FUNCTION_PREFIX",
                        format!("Function uses banned prefix '{prefix}'. {correction}"),
                    ));
                }
            }
        }
    }

    fn check_type_naming(&mut self, file_path: &Path, content: &str) {
        for (line_num, line) in content.lines().enumerate() {
            let words: Vec<&str> = line.split_whitespace().collect();
            let keyword_index = if words.first().is_some_and(|w| w.starts_with("pub")) { 1 } else { 0 };
            let is_type = matches!(words.get(keyword_index), Some(&"struct") | Some(&"enum"));
            if !is_type {
                continue;
            }
            let Some(raw_name) = words.get(keyword_index + 1) else {
                continue;
            };
            let type_name = raw_name
                .split(['<', '{', '(', ';'])
                .next()
                .unwrap_or_default();

            for (suffix, message) in BANNED_SUFFIXES {
                if type_name.ends_with(suffix) {
                    self.violations.push(NamingViolation::new(
                        file_path,
                        line_num + 1,
                        "BANNED_TYPE_SUFFIX",
                        format!("Type '{type_name}' uses banned '{suffix}' suffix. {message}"),
                    ));
                }
            }
        }
    }

    fn check_module_names(&mut self, file_path: &Path) {
        let Some(stem) = file_path.file_stem() else {
            return;
        };
        let stem = stem.to_string_lossy();
        if BANNED_MODULES.contains(&stem.as_ref()) {
            self.violations.push(NamingViolation::new(
                file_path,
                1,
                "BANNED_MODULE_NAME",
                format!("Module name '{stem}' is too generic. Name what the module does"),
            ));
        }
    }

    /// `# Errors` must be followed by `///` and then `- `Type` - condition` bullets
    fn check_errors_sections(&mut self, file_path: &Path, content: &str) {
        let lines: Vec<&str> = content.lines().map(str::trim).collect();
        for (index, line) in lines.iter().enumerate() {
            if *line != "/// # Errors" {
                continue;
            }
            if lines.get(index + 1) != Some(&"///") {
                self.violations.push(NamingViolation::new(
                    file_path,
                    index + 1,
                    "INVALID_DOC_FORMAT",
                    "# Errors section must be followed by blank line: `///`".to_string(),
                ));
                continue;
            }

            let mut found_content = false;
            for (offset, doc) in lines[index + 2..].iter().enumerate() {
                let Some(text) = doc.strip_prefix("///") else {
                    break;
                };
                let text = text.trim();
                if text.is_empty() || text.starts_with("# ") {
                    break;
                }
                found_content = true;
                let well_formed = text
                    .strip_prefix("- ")
                    .is_some_and(|bullet| bullet.starts_with('`') && bullet.contains("` - "));
                if !well_formed {
                    self.violations.push(NamingViolation::new(
                        file_path,
                        index + offset + 3,
                        "INVALID_DOC_FORMAT",
                        "Use format `- `ErrorType` - condition`".to_string(),
                    ));
                }
            }
            if !found_content {
                self.violations.push(NamingViolation::new(
                    file_path,
                    index + 1,
                    "INVALID_DOC_FORMAT",
                    "# Errors section cannot be empty - list specific error types".to_string(),
                ));
            }
        }
    }

    fn check_file(&mut self, file_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        // This file carries violation samples
        if file_path.ends_with("naming_conventions.rs") {
            return Ok(());
        }

        let content = fs::read_to_string(file_path)?;
        self.check_function_prefixes(file_path, &content);
        self.check_type_naming(file_path, &content);
        self.check_module_names(file_path);
        self.check_errors_sections(file_path, &content);
        self.files_checked += 1;
        Ok(())
    }

    fn check_workspace(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        for file in self.find_rust_files()? {
            if let Err(e) = self.check_file(&file) {
                eprintln!("Warning: Failed to check {}: {}", file.display(), e);
            }
        }
        Ok(())
    }

    fn report_violations(&self) -> bool {
        if self.violations.is_empty() {
            println!("Naming conventions check passed ({} files)", self.files_checked);
            return true;
        }

        println!("Naming convention violations found:");
        for violation in &self.violations {
            println!(
                "{}:{}:{} - {}",
                violation.file_path, violation.line_number, violation.violation_type, violation.message
            );
        }
        println!(
            "{} violation(s) in {} file(s) checked",
            self.violations.len(),
            self.files_checked
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banned_function_prefixes() {
        let mut checker = NamingChecker::new();
        const VIOLATION_CODE: &str = r#"
impl Link {
    pub fn get_bandwidth(&self) -> u32 { 0 }
    pub fn set_bandwidth(&mut self, v: u32) { }
    pub(crate) fn handle_packet(&self) { }
    pub fn bandwidth(&self) -> u32 { 0 }
    fn process_get_request(&self) { }
    // fn get_commented(&self) {}
}
"#;

        checker.check_function_prefixes(Path::new("link.rs"), VIOLATION_CODE);

        assert_eq!(checker.violations.len(), 3);
        assert!(checker.violations.iter().any(|v| v.message.contains("handle_")));
    }

    #[test]
    fn test_banned_type_suffixes() {
        let mut checker = NamingChecker::new();
        const TYPE_VIOLATION_CODE: &str = r#"
pub struct SocketManager {
}
pub(crate) enum EventHandler {
}
struct PacketFactory;
pub struct VirtualNetwork {
}
pub trait PeerManager {
}
"#;

        checker.check_type_naming(Path::new("types.rs"), TYPE_VIOLATION_CODE);

        assert_eq!(checker.violations.len(), 3);
        assert!(checker.violations.iter().any(|v| v.message.contains("PacketFactory")));
        assert!(!checker.violations.iter().any(|v| v.message.contains("PeerManager")));
    }

    #[test]
    fn test_banned_module_names() {
        let mut checker = NamingChecker::new();

        checker.check_module_names(Path::new("src/utils.rs"));
        checker.check_module_names(Path::new("src/common.rs"));
        checker.check_module_names(Path::new("src/delay.rs"));
        checker.check_module_names(Path::new("src/network/mod.rs"));

        assert_eq!(checker.violations.len(), 2);
    }

    #[test]
    fn test_errors_section_format() {
        let mut checker = NamingChecker::new();
        const DOCS: &str = r#"
/// Binds.
///
/// # Errors
///
/// - `SocketError::AddressInUse` - Another socket owns the address
pub fn bind() {}

/// # Errors
/// - `SocketError::WouldBlock` - Missing blank line
pub fn recv() {}

/// # Errors
///
/// Returns WouldBlock when empty
pub fn accept() {}
"#;

        checker.check_errors_sections(Path::new("socket.rs"), DOCS);

        assert_eq!(checker.violations.len(), 2);
        assert_eq!(checker.violations[0].line_number, 9);
        assert_eq!(checker.violations[1].line_number, 15);
    }

    #[test]
    fn naming_convention_enforcement() {
        let mut checker = NamingChecker::new();

        checker
            .check_workspace()
            .expect("Failed to check workspace");

        assert!(checker.files_checked > 0, "no vnet sources found");
        assert!(
            checker.report_violations(),
            "Naming convention violations found - see output above"
        );
    }
}
