//! Style Enforcement Tests
//!
//! Validates naming and documentation conventions that clippy cannot check.
//!
//! # Test Organization
//!
//! - `naming_conventions` - Banned prefixes and suffixes, generic module names, `# Errors` format
//! - `dead_code_enforcement` - Prevents #[allow(dead_code)] in production code
//! - `dependency_usage` - Every declared dependency is referenced from source
//!
//! These tests scan every `vnet-*` crate of the workspace and fail if
//! violations are found.

#[path = "style/naming_conventions.rs"]
mod naming_conventions;

#[path = "style/dead_code_enforcement.rs"]
mod dead_code_enforcement;

#[path = "style/dependency_usage.rs"]
mod dependency_usage;
