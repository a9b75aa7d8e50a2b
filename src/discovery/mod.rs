//! Enumeration of buildable projects and schemes under a directory.
//!
//! Discovery walks the root for workspace and project bundles (skipping
//! hidden entries and nested dependency checkouts), lists each locator's
//! schemes through a cached `-list` query, and filters to schemes that are
//! actually worth building: accepted by the caller's matcher, producing a
//! recognized framework type, and intersecting the requested platforms.
//!
//! Enumeration follows directory-scan order and is not stable across runs;
//! callers and tests treat the result as a set.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use walkdir::WalkDir;

use crate::cache::QueryCache;
use crate::config::BuildOptions;
use crate::executor::{BuildExecutor, ExecutorError};
use crate::task::{CancelToken, TaskError, TaskRequest};
use crate::xcode::{Platform, ProjectLocator, Scheme};

/// Result type for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors from project/scheme enumeration
#[derive(Debug, Clone, Error)]
pub enum DiscoveryError {
    #[error("directory walk failed: {0}")]
    Walk(String),

    #[error(transparent)]
    Task(#[from] Arc<TaskError>),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl From<TaskError> for DiscoveryError {
    fn from(err: TaskError) -> Self {
        DiscoveryError::Task(Arc::new(err))
    }
}

impl DiscoveryError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            DiscoveryError::Task(task) => matches!(**task, TaskError::Cancelled),
            DiscoveryError::Executor(executor) => executor.is_cancelled(),
            DiscoveryError::Walk(_) => false,
        }
    }
}

/// Predicate restricting the buildable scheme set by name.
pub type SchemeMatcher = dyn Fn(&str) -> bool + Send + Sync;

/// Discovers buildable (project, scheme) pairs, caching the per-project
/// scheme listing for the lifetime of a run.
pub struct SchemeDiscovery {
    scheme_cache: QueryCache<ProjectLocator, Vec<Scheme>, DiscoveryError>,
}

impl Default for SchemeDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemeDiscovery {
    pub fn new() -> Self {
        Self {
            scheme_cache: QueryCache::new(),
        }
    }

    /// Every workspace and project bundle under `root`, workspaces sorted
    /// ahead of projects. Hidden entries and anything under
    /// `checkouts_dir` are skipped, and bundle internals are not descended
    /// into.
    pub fn locate_projects(
        &self,
        root: &Path,
        checkouts_dir: &Path,
    ) -> DiscoveryResult<Vec<ProjectLocator>> {
        let mut locators = Vec::new();
        let mut walker = WalkDir::new(root).into_iter();

        while let Some(entry) = walker.next() {
            let entry = entry.map_err(|e| DiscoveryError::Walk(e.to_string()))?;
            let path = entry.path();
            if path == root {
                continue;
            }

            let name = entry.file_name().to_string_lossy();
            let hidden = name.starts_with('.');
            if entry.file_type().is_dir() && (hidden || path == checkouts_dir) {
                walker.skip_current_dir();
                continue;
            }
            if hidden {
                continue;
            }

            if entry.file_type().is_dir() {
                if name.ends_with(".xcworkspace") {
                    locators.push(ProjectLocator::Workspace(path.to_path_buf()));
                    walker.skip_current_dir();
                } else if name.ends_with(".xcodeproj") {
                    locators.push(ProjectLocator::ProjectFile(path.to_path_buf()));
                    walker.skip_current_dir();
                }
            }
        }

        locators.sort();
        Ok(locators)
    }

    /// The schemes `locator` exposes, via a cached `xcodebuild -list`
    /// query. A project sharing no schemes yields an empty list here; the
    /// orchestrator decides whether that is an error.
    pub fn schemes(
        &self,
        locator: &ProjectLocator,
        executor: &BuildExecutor,
        cancel: &CancelToken,
    ) -> DiscoveryResult<Vec<Scheme>> {
        self.scheme_cache
            .get_or_compute(locator, || {
                let mut args = vec!["-list".to_string()];
                match locator {
                    ProjectLocator::Workspace(path) => {
                        args.push("-workspace".to_string());
                        args.push(path.display().to_string());
                    }
                    ProjectLocator::ProjectFile(path) => {
                        args.push("-project".to_string());
                        args.push(path.display().to_string());
                    }
                }
                let request = TaskRequest::new("xcodebuild", args);
                let stdout = executor.runner().run(&request, cancel, &mut |_| {})?;
                Ok(parse_scheme_list(&String::from_utf8_lossy(&stdout)))
            })
            .map_err(|shared| (*shared).clone())
    }

    /// Produce the buildable (project, scheme) set for a directory.
    ///
    /// Eligibility queries use the run's full base arguments (configuration,
    /// toolchain, derived-data path), so the build stage replays them from
    /// the settings cache instead of re-running the toolchain.
    pub fn discover(
        &self,
        root: &Path,
        checkouts_dir: &Path,
        executor: &BuildExecutor,
        options: &BuildOptions,
        matcher: Option<&SchemeMatcher>,
        cancel: &CancelToken,
    ) -> DiscoveryResult<Vec<(ProjectLocator, Scheme)>> {
        let platform_filter = &options.platforms;
        let mut buildable = Vec::new();

        for locator in self.locate_projects(root, checkouts_dir)? {
            for scheme in self.schemes(&locator, executor, cancel)? {
                if let Some(matcher) = matcher {
                    if !matcher(scheme.name()) {
                        continue;
                    }
                }

                let arguments = options.arguments(locator.clone(), scheme.clone());
                let settings = match executor.query_settings(&arguments, cancel) {
                    Ok(settings) => settings,
                    Err(e) if e.is_cancelled() => return Err(e.into()),
                    Err(e) => {
                        eprintln!("[discovery] skipping {locator} / {scheme}: {e}");
                        continue;
                    }
                };

                let eligible = settings.iter().any(|target| {
                    if target.framework_type().is_none() {
                        return false;
                    }
                    if platform_filter.is_empty() {
                        return true;
                    }
                    target
                        .supported_variants()
                        .map(|variants| {
                            variants
                                .iter()
                                .any(|variant| platform_filter.contains(&variant.platform()))
                        })
                        .unwrap_or(false)
                });

                if eligible {
                    buildable.push((locator.clone(), scheme));
                }
            }
        }

        Ok(buildable)
    }
}

fn parse_scheme_list(output: &str) -> Vec<Scheme> {
    let mut schemes = Vec::new();
    let mut in_schemes = false;
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed == "Schemes:" {
            in_schemes = true;
            continue;
        }
        if in_schemes {
            if trimmed.is_empty() || trimmed.ends_with(':') {
                break;
            }
            schemes.push(Scheme::from(trimmed));
        }
    }
    schemes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedRunner;
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const LIST_OUTPUT: &str = "\
Information about project \"Dep\":
    Targets:
        Dep

    Build Configurations:
        Debug
        Release

    Schemes:
        Dep
        DepHelper
";

    fn framework_settings(platforms: &str) -> String {
        crate::xcode::settings::sample_block(
            "Dep",
            &[
                ("BUILT_PRODUCTS_DIR", "/b"),
                ("WRAPPER_NAME", "Dep.framework"),
                ("EXECUTABLE_PATH", "Dep.framework/Dep"),
                ("PRODUCT_TYPE", "com.apple.product-type.framework"),
                ("SUPPORTED_PLATFORMS", platforms),
            ],
        )
    }

    fn project_tree() -> (TempDir, PathBuf) {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        fs::create_dir_all(root.join("Dep.xcodeproj")).unwrap();
        fs::create_dir_all(root.join("Example/App.xcworkspace")).unwrap();
        fs::create_dir_all(root.join(".git/Some.xcodeproj")).unwrap();
        fs::create_dir_all(root.join("XCForge/Checkouts/Other/Other.xcodeproj")).unwrap();
        (temp, root)
    }

    #[test]
    fn test_locate_projects_skips_hidden_and_checkouts() {
        let (_temp, root) = project_tree();
        let discovery = SchemeDiscovery::new();
        let locators = discovery
            .locate_projects(&root, &root.join("XCForge/Checkouts"))
            .unwrap();

        assert_eq!(locators.len(), 2);
        assert!(matches!(locators[0], ProjectLocator::Workspace(_)));
        assert!(matches!(locators[1], ProjectLocator::ProjectFile(_)));
    }

    #[test]
    fn test_scheme_listing_parsed_and_cached() {
        let (_temp, root) = project_tree();
        let runner = Arc::new(
            ScriptedRunner::new().on_args("-list", LIST_OUTPUT.as_bytes().to_vec()),
        );
        let executor = BuildExecutor::new(runner.clone(), root.join("XCForge/Checkouts"));
        let discovery = SchemeDiscovery::new();
        let locator = ProjectLocator::ProjectFile(root.join("Dep.xcodeproj"));
        let cancel = CancelToken::new();

        let schemes = discovery.schemes(&locator, &executor, &cancel).unwrap();
        assert_eq!(schemes, vec![Scheme::from("Dep"), Scheme::from("DepHelper")]);

        discovery.schemes(&locator, &executor, &cancel).unwrap();
        assert_eq!(runner.invocation_count_matching("-list"), 1);
    }

    #[test]
    fn test_discover_filters_by_matcher_framework_and_platform() {
        let (_temp, root) = project_tree();
        let runner = Arc::new(
            ScriptedRunner::new()
                .on_args("-list", LIST_OUTPUT.as_bytes().to_vec())
                .on_all(
                    ["-scheme DepHelper", "-showBuildSettings"],
                    crate::xcode::settings::sample_block(
                        "DepHelper",
                        &[("PRODUCT_TYPE", "com.apple.product-type.tool")],
                    )
                    .into_bytes(),
                )
                .on_args(
                    "-showBuildSettings",
                    framework_settings("iphoneos iphonesimulator").into_bytes(),
                ),
        );
        let executor = BuildExecutor::new(runner, root.join("XCForge/Checkouts"));
        let discovery = SchemeDiscovery::new();

        let options = BuildOptions {
            platforms: [Platform::IOS].into_iter().collect(),
            ..Default::default()
        };
        let pairs = discovery
            .discover(
                &root,
                &root.join("XCForge/Checkouts"),
                &executor,
                &options,
                None,
                &CancelToken::new(),
            )
            .unwrap();

        let schemes: BTreeSet<String> = pairs
            .iter()
            .map(|(_, scheme)| scheme.name().to_string())
            .collect();
        // DepHelper is not a framework; Dep is listed once per locator that
        // exposes it.
        assert!(schemes.contains("Dep"));
        assert!(!schemes.contains("DepHelper"));

        // A platform filter with no intersection removes everything.
        let mac_only = BuildOptions {
            platforms: [Platform::MacOS].into_iter().collect(),
            ..Default::default()
        };
        let pairs = discovery
            .discover(
                &root,
                &root.join("XCForge/Checkouts"),
                &executor,
                &mac_only,
                None,
                &CancelToken::new(),
            )
            .unwrap();
        assert!(pairs.is_empty());
    }

    #[test]
    fn test_eligibility_query_uses_full_base_arguments() {
        let (_temp, root) = project_tree();
        let runner = Arc::new(
            ScriptedRunner::new()
                .on_args("-list", LIST_OUTPUT.as_bytes().to_vec())
                .on_args(
                    "-showBuildSettings",
                    framework_settings("iphoneos iphonesimulator").into_bytes(),
                ),
        );
        let executor = BuildExecutor::new(runner.clone(), root.join("XCForge/Checkouts"));
        let discovery = SchemeDiscovery::new();

        let options = BuildOptions {
            toolchain: Some("swift-dev".to_string()),
            derived_data_path: Some(root.join("DerivedData")),
            ..Default::default()
        };
        discovery
            .discover(
                &root,
                &root.join("XCForge/Checkouts"),
                &executor,
                &options,
                None,
                &CancelToken::new(),
            )
            .unwrap();

        // Eligibility queries carry the option overrides, so a later build
        // of the same scheme hits the settings cache instead of the
        // toolchain.
        let settings_queries: Vec<String> = runner
            .invocations()
            .iter()
            .map(|request| request.display_command())
            .filter(|command| command.contains("-showBuildSettings"))
            .collect();
        assert!(!settings_queries.is_empty());
        for command in &settings_queries {
            assert!(command.contains("-toolchain swift-dev"));
            assert!(command.contains("-derivedDataPath"));
        }

        let locator = ProjectLocator::ProjectFile(root.join("Dep.xcodeproj"));
        let before = runner.invocation_count_matching("-showBuildSettings");
        executor
            .query_settings(
                &options.arguments(locator, Scheme::from("Dep")),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(runner.invocation_count_matching("-showBuildSettings"), before);
    }

    #[test]
    fn test_matcher_rejection_overrides_eligibility() {
        let (_temp, root) = project_tree();
        let runner = Arc::new(
            ScriptedRunner::new()
                .on_args("-list", LIST_OUTPUT.as_bytes().to_vec())
                .on_args(
                    "-showBuildSettings",
                    framework_settings("iphoneos iphonesimulator").into_bytes(),
                ),
        );
        let executor = BuildExecutor::new(runner, root.join("XCForge/Checkouts"));
        let discovery = SchemeDiscovery::new();

        let matcher: Box<SchemeMatcher> = Box::new(|name: &str| name == "Nope");
        let options = BuildOptions::default();
        let pairs = discovery
            .discover(
                &root,
                &root.join("XCForge/Checkouts"),
                &executor,
                &options,
                Some(matcher.as_ref()),
                &CancelToken::new(),
            )
            .unwrap();
        assert!(pairs.is_empty());
    }
}
