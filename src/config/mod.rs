//! Build options and their optional `xcforge.toml` overlay.
//!
//! Options merge in two layers: built-in defaults, then the repo's
//! `xcforge.toml` when one exists at the build root. Caller-supplied values
//! (set directly on [`BuildOptions`] after loading) win over both.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::xcode::{BuildArguments, Platform, ProjectLocator, Scheme};

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors from loading the config overlay
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid xcforge.toml: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Name of the optional per-repo overlay file.
pub const CONFIG_FILENAME: &str = "xcforge.toml";

/// Options for one directory build.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Build configuration name.
    pub configuration: String,
    /// Requested platforms; empty means every platform a scheme supports.
    pub platforms: BTreeSet<Platform>,
    /// `-toolchain` override.
    pub toolchain: Option<String>,
    /// `-derivedDataPath` override.
    pub derived_data_path: Option<PathBuf>,
    /// How long to wait for a competing build's directory lock.
    pub lock_timeout: Duration,
    /// Identity of the dependency being built, when building one; used for
    /// error rewriting and the version record. `None` for a plain
    /// directory build.
    pub dependency: Option<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            configuration: "Release".to_string(),
            platforms: BTreeSet::new(),
            toolchain: None,
            derived_data_path: None,
            lock_timeout: Duration::from_secs(60 * 60),
            dependency: None,
        }
    }
}

/// Fields an `xcforge.toml` may override.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverlay {
    configuration: Option<String>,
    platforms: Option<Vec<Platform>>,
    toolchain: Option<String>,
    derived_data_path: Option<PathBuf>,
    lock_timeout_seconds: Option<u64>,
}

impl ConfigOverlay {
    /// Load `root/xcforge.toml`; a missing file is an empty overlay.
    pub fn load(root: &Path) -> ConfigResult<Self> {
        let path = root.join(CONFIG_FILENAME);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(toml::from_str(&text)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

impl BuildOptions {
    /// Apply an overlay on top of these options.
    pub fn with_overlay(mut self, overlay: ConfigOverlay) -> Self {
        if let Some(configuration) = overlay.configuration {
            self.configuration = configuration;
        }
        if let Some(platforms) = overlay.platforms {
            self.platforms = platforms.into_iter().collect();
        }
        if let Some(toolchain) = overlay.toolchain {
            self.toolchain = Some(toolchain);
        }
        if let Some(path) = overlay.derived_data_path {
            self.derived_data_path = Some(path);
        }
        if let Some(seconds) = overlay.lock_timeout_seconds {
            self.lock_timeout = Duration::from_secs(seconds);
        }
        self
    }

    /// Defaults overlaid with the repo's `xcforge.toml`.
    pub fn for_root(root: &Path) -> ConfigResult<Self> {
        Ok(Self::default().with_overlay(ConfigOverlay::load(root)?))
    }

    /// Base `xcodebuild` arguments for one (project, scheme) under these
    /// options. Every settings query for a scheme derives from the same
    /// arguments so the cache key matches across discovery and build.
    pub fn arguments(&self, project: ProjectLocator, scheme: Scheme) -> BuildArguments {
        let mut arguments = BuildArguments::new(project, scheme, self.configuration.clone());
        arguments.toolchain = self.toolchain.clone();
        arguments.derived_data_path = self.derived_data_path.clone();
        arguments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_overlay_keeps_defaults() {
        let temp = TempDir::new().unwrap();
        let options = BuildOptions::for_root(temp.path()).unwrap();
        assert_eq!(options.configuration, "Release");
        assert!(options.platforms.is_empty());
        assert_eq!(options.lock_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn test_overlay_overrides_selected_fields() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join(CONFIG_FILENAME),
            r#"
configuration = "Debug"
platforms = ["ios", "macos"]
lock_timeout_seconds = 120
"#,
        )
        .unwrap();

        let options = BuildOptions::for_root(temp.path()).unwrap();
        assert_eq!(options.configuration, "Debug");
        assert_eq!(
            options.platforms,
            [Platform::IOS, Platform::MacOS].into_iter().collect()
        );
        assert_eq!(options.lock_timeout, Duration::from_secs(120));
        assert_eq!(options.toolchain, None);
    }

    #[test]
    fn test_arguments_carry_option_overrides() {
        let options = BuildOptions {
            toolchain: Some("swift-dev".to_string()),
            derived_data_path: Some(PathBuf::from("/tmp/dd")),
            ..Default::default()
        };
        let locator = ProjectLocator::ProjectFile(PathBuf::from("/repo/Dep.xcodeproj"));
        let arguments = options.arguments(locator.clone(), Scheme::from("Dep"));

        assert_eq!(arguments.toolchain.as_deref(), Some("swift-dev"));
        assert_eq!(
            arguments.derived_data_path.as_deref(),
            Some(Path::new("/tmp/dd"))
        );
        // Identical inputs yield an identical cache key.
        assert_eq!(arguments, options.arguments(locator, Scheme::from("Dep")));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(CONFIG_FILENAME), "frobnicate = true\n").unwrap();
        assert!(matches!(
            BuildOptions::for_root(temp.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
