//! Parsing of `xcodebuild -showBuildSettings` output.
//!
//! The settings query emits one block per target:
//!
//! ```text
//! Build settings for action build and target Alpha:
//!     BUILT_PRODUCTS_DIR = /path/to/Build/Products/Release-iphoneos
//!     WRAPPER_NAME = Alpha.framework
//!     ...
//! ```
//!
//! Each block becomes one immutable [`BuildSettings`] record keyed by target
//! name. Setting lookups return a typed error naming the missing key so a
//! truncated or malformed query surfaces as a parse failure, not a panic.

use std::collections::HashMap;
use std::path::PathBuf;

use regex_lite::Regex;
use thiserror::Error;

use super::{FrameworkType, Variant};

/// Result type for settings lookups
pub type SettingsResult<T> = Result<T, SettingsError>;

/// Errors from settings parsing and lookup
#[derive(Debug, Clone, Error)]
pub enum SettingsError {
    #[error("malformed build settings output: {0}")]
    Malformed(String),

    #[error("target {target} has no setting {key}")]
    MissingSetting { target: String, key: String },
}

/// Build settings for one target within one scheme/variant build.
///
/// Immutable once parsed. Accessors for required settings return
/// [`SettingsError::MissingSetting`] rather than panicking.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    target: String,
    values: HashMap<String, String>,
}

impl BuildSettings {
    /// Parse every target block from a settings query's textual output.
    pub fn parse_all(output: &str) -> SettingsResult<Vec<BuildSettings>> {
        // regex-lite has no multiline flag shortcuts we need here; the
        // header is matched per trimmed line instead.
        let header =
            Regex::new(r#"^Build settings for action \S+ and target "?([^":]+)"?:$"#)
                .map_err(|e| SettingsError::Malformed(e.to_string()))?;

        let mut records = Vec::new();
        let mut current: Option<BuildSettings> = None;

        for line in output.lines() {
            if let Some(captures) = header.captures(line.trim_end()) {
                if let Some(done) = current.take() {
                    records.push(done);
                }
                current = Some(BuildSettings {
                    target: captures[1].trim().to_string(),
                    values: HashMap::new(),
                });
                continue;
            }
            if let Some(ref mut settings) = current {
                if let Some((key, value)) = line.trim().split_once(" = ") {
                    settings
                        .values
                        .insert(key.trim().to_string(), value.trim().to_string());
                }
            }
        }
        if let Some(done) = current.take() {
            records.push(done);
        }

        if records.is_empty() {
            return Err(SettingsError::Malformed(
                "no target blocks in settings output".to_string(),
            ));
        }
        Ok(records)
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn value(&self, key: &str) -> SettingsResult<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| SettingsError::MissingSetting {
                target: self.target.clone(),
                key: key.to_string(),
            })
    }

    fn optional(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// The framework type of the target's product, if it is a framework.
    /// Static frameworks are frameworks whose binary is a static archive.
    pub fn framework_type(&self) -> Option<FrameworkType> {
        match self.optional("PRODUCT_TYPE")? {
            "com.apple.product-type.framework" => {
                if self.optional("MACH_O_TYPE") == Some("staticlib") {
                    Some(FrameworkType::Static)
                } else {
                    Some(FrameworkType::Dynamic)
                }
            }
            _ => None,
        }
    }

    /// Build variants the target declares support for
    /// (`SUPPORTED_PLATFORMS`, space-separated SDK names). Unrecognized
    /// names are ignored rather than fatal.
    pub fn supported_variants(&self) -> SettingsResult<Vec<Variant>> {
        let raw = self.value("SUPPORTED_PLATFORMS")?;
        Ok(raw
            .split_whitespace()
            .filter_map(Variant::from_sdk_name)
            .collect())
    }

    pub fn bitcode_enabled(&self) -> bool {
        self.optional("ENABLE_BITCODE") == Some("YES")
    }

    pub fn built_products_dir(&self) -> SettingsResult<PathBuf> {
        Ok(PathBuf::from(self.value("BUILT_PRODUCTS_DIR")?))
    }

    /// The built product bundle (`<BUILT_PRODUCTS_DIR>/<WRAPPER_NAME>`).
    pub fn product_path(&self) -> SettingsResult<PathBuf> {
        Ok(self.built_products_dir()?.join(self.value("WRAPPER_NAME")?))
    }

    /// The product's executable
    /// (`<BUILT_PRODUCTS_DIR>/<EXECUTABLE_PATH>`).
    pub fn executable_path(&self) -> SettingsResult<PathBuf> {
        Ok(self.built_products_dir()?.join(self.value("EXECUTABLE_PATH")?))
    }

    /// The product's Swift module directory
    /// (`Modules/<module>.swiftmodule`), holding per-architecture module
    /// artifacts. `None` for targets without a module name.
    pub fn swift_module_path(&self) -> Option<PathBuf> {
        let name = self.optional("PRODUCT_MODULE_NAME")?;
        let product = self.product_path().ok()?;
        Some(product.join("Modules").join(format!("{name}.swiftmodule")))
    }

    /// The generated Swift interface header inside the product, when the
    /// target exposes one.
    pub fn swift_header_path(&self) -> Option<PathBuf> {
        let name = self.optional("SWIFT_OBJC_INTERFACE_HEADER_NAME")?;
        let product = self.product_path().ok()?;
        Some(product.join("Headers").join(name))
    }

    /// Path of the project file the target belongs to; used to skip targets
    /// that live inside nested dependency checkouts.
    pub fn project_path(&self) -> Option<PathBuf> {
        self.optional("PROJECT_FILE_PATH").map(PathBuf::from)
    }

    /// Per-target intermediates directory, removed before settings are
    /// returned so same-named products in one configuration cannot collide.
    pub fn target_temp_dir(&self) -> Option<PathBuf> {
        self.optional("TARGET_TEMP_DIR").map(PathBuf::from)
    }
}

#[cfg(test)]
pub(crate) fn sample_block(target: &str, pairs: &[(&str, &str)]) -> String {
    let mut out = format!("Build settings for action build and target {target}:\n");
    for (key, value) in pairs {
        out.push_str(&format!("    {key} = {value}\n"));
    }
    out
}
