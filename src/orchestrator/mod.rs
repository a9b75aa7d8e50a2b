//! Top-level build sequencing for a directory of dependencies.
//!
//! The orchestrator takes an exclusive lock on the shared build-output
//! directory, discovers buildable (project, scheme) pairs, and processes
//! schemes strictly one at a time: toolchain builds are resource-heavy and
//! unsafe in parallel against one shared build cache. Within a scheme,
//! variants group by platform; a lone variant builds directly, a
//! device/simulator pair builds device-first and fans in through the merge
//! engine, and any other count is a fatal configuration error.
//!
//! Every group is assembled in a staging directory and renamed into the
//! platform output directory only when complete, so a destination is either
//! fully populated or never created — including under cancellation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex_lite::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::config::BuildOptions;
use crate::discovery::{DiscoveryError, SchemeDiscovery, SchemeMatcher};
use crate::executor::{BuildExecutor, ExecutorError};
use crate::lock::{DirectoryLock, LockError};
use crate::merge::{copy_directory, resolve_destination_symlinks, MergeEngine, MergeError};
use crate::task::{CancelToken, TaskError, TaskEvent, TaskRequest, TaskRunner};
use crate::xcode::{BuildArguments, Platform, ProjectLocator, Scheme, Variant};

/// Shared build-output directory, relative to the build root.
pub const OUTPUT_DIR: &str = "XCForge/Build";
/// Nested dependency checkouts, relative to the build root.
pub const CHECKOUTS_DIR: &str = "XCForge/Checkouts";

/// Result type for orchestration
pub type BuildResult<T> = Result<T, BuildError>;

/// Errors from a directory build
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Discovery(DiscoveryError),

    #[error(transparent)]
    Executor(ExecutorError),

    #[error(transparent)]
    Merge(MergeError),

    #[error(transparent)]
    Task(TaskError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("dependency {dependency} has no shared schemes")]
    NoSharedSchemes { dependency: String },

    #[error("dependency {dependency} has no shared framework schemes for platforms {platforms:?}")]
    NoSharedFrameworkSchemes {
        dependency: String,
        platforms: Vec<Platform>,
    },

    #[error("{platform} maps to {count} build variants of scheme {scheme}; expected one variant or a device/simulator pair")]
    InvalidVariantCount {
        scheme: Scheme,
        platform: Platform,
        count: usize,
    },

    #[error("version record failed: {0}")]
    VersionRecord(String),

    #[error("built-products callback failed: {0}")]
    ProductsCallback(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<TaskError> for BuildError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Cancelled => BuildError::Cancelled,
            other => BuildError::Task(other),
        }
    }
}

impl From<ExecutorError> for BuildError {
    fn from(err: ExecutorError) -> Self {
        if err.is_cancelled() {
            BuildError::Cancelled
        } else {
            BuildError::Executor(err)
        }
    }
}

impl From<DiscoveryError> for BuildError {
    fn from(err: DiscoveryError) -> Self {
        if err.is_cancelled() {
            BuildError::Cancelled
        } else {
            BuildError::Discovery(err)
        }
    }
}

impl From<MergeError> for BuildError {
    fn from(err: MergeError) -> Self {
        if err.is_cancelled() {
            BuildError::Cancelled
        } else {
            BuildError::Merge(err)
        }
    }
}

impl BuildError {
    /// Fatal errors abort the whole directory build; everything else aborts
    /// only the failing scheme's remaining steps.
    fn is_fatal(&self) -> bool {
        matches!(
            self,
            BuildError::Cancelled
                | BuildError::InvalidVariantCount { .. }
                | BuildError::Lock(_)
                | BuildError::NoSharedSchemes { .. }
                | BuildError::NoSharedFrameworkSchemes { .. }
        )
    }
}

/// Progress events emitted during a directory build.
///
/// A `SchemeStarted` always precedes any output of its scheme, and a
/// scheme's terminal `SchemeBuilt`/`SchemeFailed` follows all of its
/// output.
#[derive(Debug, Clone)]
pub enum BuildEvent {
    SchemeStarted {
        project: ProjectLocator,
        scheme: Scheme,
    },
    /// A toolchain process was launched.
    Launch { command: String },
    /// A line of live toolchain output.
    Output(Vec<u8>),
    /// A line of live toolchain diagnostics.
    ErrorOutput(Vec<u8>),
    SchemeBuilt {
        scheme: Scheme,
        artifacts: Vec<PathBuf>,
    },
    SchemeFailed { scheme: Scheme, error: String },
}

/// What was built for one dependency or checkout, handed to the
/// version-record collaborator after each scheme.
#[derive(Debug, Clone, Serialize)]
pub struct VersionRecord {
    /// Dependency name, or the current commit when building a plain
    /// checkout.
    pub identity: String,
    pub platforms: Vec<Platform>,
    pub configuration: String,
    pub artifacts: Vec<PathBuf>,
    pub recorded_at: DateTime<Utc>,
}

/// External collaborator persisting version records. The on-disk format is
/// the collaborator's own.
pub trait VersionRecorder: Send + Sync {
    fn record_version(&self, record: &VersionRecord, root: &Path) -> BuildResult<()>;
}

/// Caller-supplied callback invoked with each scheme's artifact paths.
pub type ProducedCallback = dyn Fn(&[PathBuf]) -> BuildResult<()> + Send + Sync;

/// Caller-supplied filter consulted once per platform group with the
/// candidate variants that intersect the requested platform set.
pub type VariantFilter =
    dyn Fn(Vec<Variant>, &Scheme, &str, &ProjectLocator) -> BuildResult<Vec<Variant>> + Send + Sync;

/// Sequences discovery, per-scheme builds, merges, and post-processing for
/// one build root. Owns the run's caches; nothing here is global.
pub struct BuildOrchestrator {
    root: PathBuf,
    runner: Arc<dyn TaskRunner>,
    executor: BuildExecutor,
    discovery: SchemeDiscovery,
    merge: MergeEngine,
    options: BuildOptions,
    version_recorder: Option<Box<dyn VersionRecorder>>,
    products_callback: Option<Box<ProducedCallback>>,
    variant_filter: Option<Box<VariantFilter>>,
    scheme_matcher: Option<Box<SchemeMatcher>>,
}

impl BuildOrchestrator {
    pub fn new(runner: Arc<dyn TaskRunner>, root: impl Into<PathBuf>, options: BuildOptions) -> Self {
        let root = root.into();
        let checkouts = root.join(CHECKOUTS_DIR);
        Self {
            executor: BuildExecutor::new(Arc::clone(&runner), checkouts),
            discovery: SchemeDiscovery::new(),
            merge: MergeEngine::new(Arc::clone(&runner)),
            runner,
            root,
            options,
            version_recorder: None,
            products_callback: None,
            variant_filter: None,
            scheme_matcher: None,
        }
    }

    pub fn with_version_recorder(mut self, recorder: Box<dyn VersionRecorder>) -> Self {
        self.version_recorder = Some(recorder);
        self
    }

    pub fn with_products_callback(mut self, callback: Box<ProducedCallback>) -> Self {
        self.products_callback = Some(callback);
        self
    }

    pub fn with_variant_filter(mut self, filter: Box<VariantFilter>) -> Self {
        self.variant_filter = Some(filter);
        self
    }

    pub fn with_scheme_matcher(mut self, matcher: Box<SchemeMatcher>) -> Self {
        self.scheme_matcher = Some(matcher);
        self
    }

    /// Build every buildable scheme under the root. Returns the artifact
    /// paths of every scheme that built; if any scheme failed, the first
    /// failure is returned after the remaining schemes were attempted.
    pub fn build(
        &self,
        cancel: &CancelToken,
        observer: &mut dyn FnMut(BuildEvent),
    ) -> BuildResult<Vec<PathBuf>> {
        let build_dir = self.root.join(OUTPUT_DIR);
        // Held for the whole directory build; released on drop on every
        // exit path.
        let _lock = DirectoryLock::acquire(&build_dir, self.options.lock_timeout)?;

        let pairs = self.discovery.discover(
            &self.root,
            &self.root.join(CHECKOUTS_DIR),
            &self.executor,
            &self.options,
            self.scheme_matcher.as_deref(),
            cancel,
        )?;

        if pairs.is_empty() {
            return self.translate_empty_discovery(cancel);
        }

        let mut artifacts = Vec::new();
        let mut first_failure: Option<BuildError> = None;

        for (locator, scheme) in pairs {
            if cancel.is_cancelled() {
                return Err(BuildError::Cancelled);
            }
            observer(BuildEvent::SchemeStarted {
                project: locator.clone(),
                scheme: scheme.clone(),
            });

            let outcome = self
                .build_scheme(&locator, &scheme, &build_dir, cancel, observer)
                .and_then(|scheme_artifacts| {
                    self.post_build(&scheme, &scheme_artifacts, cancel)?;
                    Ok(scheme_artifacts)
                });
            match outcome {
                Ok(scheme_artifacts) => {
                    observer(BuildEvent::SchemeBuilt {
                        scheme: scheme.clone(),
                        artifacts: scheme_artifacts.clone(),
                    });
                    artifacts.extend(scheme_artifacts);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    observer(BuildEvent::SchemeFailed {
                        scheme: scheme.clone(),
                        error: e.to_string(),
                    });
                    first_failure.get_or_insert(e);
                }
            }
        }

        match first_failure {
            Some(failure) => Err(failure),
            None => Ok(artifacts),
        }
    }

    /// An empty buildable set is fine for a plain directory but an error
    /// when a specific dependency was requested; the raw toolchain
    /// condition is rewritten with the dependency's identity.
    fn translate_empty_discovery(&self, cancel: &CancelToken) -> BuildResult<Vec<PathBuf>> {
        let Some(ref dependency) = self.options.dependency else {
            return Ok(Vec::new());
        };

        let locators = self
            .discovery
            .locate_projects(&self.root, &self.root.join(CHECKOUTS_DIR))
            .map_err(BuildError::from)?;
        let mut any_schemes = false;
        for locator in &locators {
            // Listings are already cached from discovery.
            if let Ok(schemes) = self.discovery.schemes(locator, &self.executor, cancel) {
                any_schemes |= !schemes.is_empty();
            }
        }

        if any_schemes {
            Err(BuildError::NoSharedFrameworkSchemes {
                dependency: dependency.clone(),
                platforms: self.options.platforms.iter().copied().collect(),
            })
        } else {
            Err(BuildError::NoSharedSchemes {
                dependency: dependency.clone(),
            })
        }
    }

    /// The per-scheme pipeline: group the first target's variants by
    /// platform, filter, and build/merge each group into its platform
    /// output directory.
    fn build_scheme(
        &self,
        locator: &ProjectLocator,
        scheme: &Scheme,
        build_dir: &Path,
        cancel: &CancelToken,
        observer: &mut dyn FnMut(BuildEvent),
    ) -> BuildResult<Vec<PathBuf>> {
        // Same base arguments discovery queried with, so this settings
        // lookup replays from the cache.
        let base = self.options.arguments(locator.clone(), scheme.clone());

        let settings = self.executor.query_settings(&base, cancel)?;
        let first_target = settings
            .first()
            .ok_or_else(|| BuildError::Executor(ExecutorError::Settings(
                crate::xcode::SettingsError::Malformed("settings query returned no targets".into()),
            )))?;

        let groups = group_by_platform(first_target.supported_variants().map_err(
            |e| BuildError::Executor(ExecutorError::Settings(e)),
        )?);

        let mut artifacts = Vec::new();
        for (platform, variants) in groups {
            // Only variants intersecting the requested platform set reach
            // the caller's filter.
            if !self.options.platforms.is_empty() && !self.options.platforms.contains(&platform) {
                continue;
            }
            let variants = match self.variant_filter {
                Some(ref filter) => filter(
                    variants,
                    scheme,
                    &self.options.configuration,
                    locator,
                )?,
                None => variants,
            };
            if variants.is_empty() {
                continue;
            }

            artifacts.extend(self.build_platform_group(
                &base, scheme, platform, &variants, build_dir, cancel, observer,
            )?);
        }
        Ok(artifacts)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_platform_group(
        &self,
        base: &BuildArguments,
        scheme: &Scheme,
        platform: Platform,
        variants: &[Variant],
        build_dir: &Path,
        cancel: &CancelToken,
        observer: &mut dyn FnMut(BuildEvent),
    ) -> BuildResult<Vec<PathBuf>> {
        let staging = Staging::create(build_dir, platform, scheme)?;
        let mut sink = event_sink(observer);

        match variants {
            [single] => {
                let targets = self.executor.build(*single, base, cancel, &mut sink)?;
                for target in &targets {
                    let product = target.product_path().map_err(executor_settings)?;
                    let name = product.file_name().ok_or_else(|| {
                        BuildError::Io(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("product has no name: {}", product.display()),
                        ))
                    })?;
                    copy_directory(&product, &staging.path().join(name))?;
                }
            }
            [a, b] => {
                let (device, simulator) = match (a.is_simulator(), b.is_simulator()) {
                    (false, true) => (*a, *b),
                    (true, false) => (*b, *a),
                    _ => {
                        return Err(BuildError::InvalidVariantCount {
                            scheme: scheme.clone(),
                            platform,
                            count: variants.len(),
                        })
                    }
                };

                // Device first: the costlier build fails fast, and the
                // simulator stage merges against its outputs.
                let device_targets = self.executor.build(device, base, cancel, &mut sink)?;
                let simulator_targets = self.executor.build(simulator, base, cancel, &mut sink)?;

                for device_target in &device_targets {
                    let counterpart = simulator_targets
                        .iter()
                        .find(|sim| sim.target() == device_target.target());
                    match counterpart {
                        Some(simulator_target) => {
                            self.merge.merge(
                                device_target,
                                simulator_target,
                                staging.path(),
                                cancel,
                                &mut sink,
                            )?;
                        }
                        None => {
                            let product =
                                device_target.product_path().map_err(executor_settings)?;
                            if let Some(name) = product.file_name() {
                                copy_directory(&product, &staging.path().join(name))?;
                            }
                        }
                    }
                }
            }
            other => {
                return Err(BuildError::InvalidVariantCount {
                    scheme: scheme.clone(),
                    platform,
                    count: other.len(),
                })
            }
        }

        self.create_debug_symbols(staging.path(), cancel)?;

        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        let platform_dir = build_dir.join(platform.directory_name());
        let landed = staging.land(&platform_dir)?;
        Ok(landed)
    }

    /// Generate a companion dSYM bundle for every staged product whose
    /// binary embeds at least one debug-symbol UUID; products without UUIDs
    /// are skipped silently.
    fn create_debug_symbols(&self, staging_dir: &Path, cancel: &CancelToken) -> BuildResult<()> {
        let uuid_line = Regex::new(r"UUID: [0-9A-Fa-f-]+")
            .map_err(|e| BuildError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;

        for entry in fs::read_dir(staging_dir)? {
            let entry = entry?;
            let product = entry.path();
            if product.extension().map(|ext| ext != "framework").unwrap_or(true) {
                continue;
            }
            let Some(stem) = product.file_stem() else { continue };
            let binary = resolve_destination_symlinks(product.join(stem));
            if !binary.is_file() {
                continue;
            }

            let request = TaskRequest::new(
                "dwarfdump",
                ["--uuid".to_string(), binary.display().to_string()],
            );
            let stdout = match self.runner.run(&request, cancel, &mut |_| {}) {
                Ok(stdout) => stdout,
                Err(TaskError::Cancelled) => return Err(BuildError::Cancelled),
                // A binary without debug info is not an error.
                Err(_) => continue,
            };
            if !uuid_line.is_match(&String::from_utf8_lossy(&stdout)) {
                continue;
            }

            let dsym_name = format!(
                "{}.dSYM",
                product.file_name().unwrap_or_default().to_string_lossy()
            );
            let request = TaskRequest::new(
                "dsymutil",
                [
                    binary.display().to_string(),
                    "-o".to_string(),
                    staging_dir.join(dsym_name).display().to_string(),
                ],
            );
            self.runner.run(&request, cancel, &mut |_| {})?;
        }
        Ok(())
    }

    /// Post-build hook, once per scheme: persist a version record, then
    /// hand the artifact paths to the caller. Both steps are skipped when
    /// the root is not a version-controlled checkout.
    fn post_build(
        &self,
        _scheme: &Scheme,
        artifacts: &[PathBuf],
        cancel: &CancelToken,
    ) -> BuildResult<()> {
        if !self.root.join(".git").exists() {
            return Ok(());
        }

        let Some(identity) = self.build_identity(cancel)? else {
            return Ok(());
        };

        if let Some(ref recorder) = self.version_recorder {
            let record = VersionRecord {
                identity,
                platforms: artifact_platforms(artifacts),
                configuration: self.options.configuration.clone(),
                artifacts: artifacts.to_vec(),
                recorded_at: Utc::now(),
            };
            recorder.record_version(&record, &self.root)?;
        }

        if let Some(ref callback) = self.products_callback {
            callback(artifacts)?;
        }
        Ok(())
    }

    /// Dependency name when building a dependency, otherwise the checkout's
    /// current commit. `None` when the commit cannot be resolved.
    fn build_identity(&self, cancel: &CancelToken) -> BuildResult<Option<String>> {
        if let Some(ref dependency) = self.options.dependency {
            return Ok(Some(dependency.clone()));
        }
        let request = TaskRequest::new("git", ["rev-parse", "HEAD"]).current_dir(&self.root);
        match self.runner.run(&request, cancel, &mut |_| {}) {
            Ok(stdout) => Ok(Some(String::from_utf8_lossy(&stdout).trim().to_string())),
            Err(TaskError::Cancelled) => Err(BuildError::Cancelled),
            Err(_) => Ok(None),
        }
    }
}

fn executor_settings(err: crate::xcode::SettingsError) -> BuildError {
    BuildError::Executor(ExecutorError::Settings(err))
}

/// Adapter forwarding task events to the build observer.
fn event_sink<'a>(
    observer: &'a mut dyn FnMut(BuildEvent),
) -> impl FnMut(TaskEvent) + 'a {
    move |event| {
        let mapped = match event {
            TaskEvent::Launch { command } => BuildEvent::Launch { command },
            TaskEvent::Stdout(line) => BuildEvent::Output(line),
            TaskEvent::Stderr(line) => BuildEvent::ErrorOutput(line),
        };
        observer(mapped);
    }
}

/// Group variants by platform in first-seen order.
fn group_by_platform(variants: Vec<Variant>) -> Vec<(Platform, Vec<Variant>)> {
    let mut groups: Vec<(Platform, Vec<Variant>)> = Vec::new();
    for variant in variants {
        let platform = variant.platform();
        match groups.iter_mut().find(|(p, _)| *p == platform) {
            Some((_, group)) => group.push(variant),
            None => groups.push((platform, vec![variant])),
        }
    }
    groups
}

/// Platforms inferable from landed artifact paths (their parent directory
/// names).
fn artifact_platforms(artifacts: &[PathBuf]) -> Vec<Platform> {
    let mut platforms = Vec::new();
    for artifact in artifacts {
        let Some(parent) = artifact.parent().and_then(|p| p.file_name()) else {
            continue;
        };
        let found = [
            Platform::IOS,
            Platform::MacOS,
            Platform::TvOS,
            Platform::WatchOS,
        ]
        .into_iter()
        .find(|platform| platform.directory_name() == parent);
        if let Some(platform) = found {
            if !platforms.contains(&platform) {
                platforms.push(platform);
            }
        }
    }
    platforms
}

/// Scratch directory a platform group is assembled in. Dropped without
/// landing, it removes itself, so a failed or cancelled group leaves no
/// partial destination.
struct Staging {
    path: PathBuf,
}

impl Staging {
    fn create(build_dir: &Path, platform: Platform, scheme: &Scheme) -> io::Result<Self> {
        let path = build_dir.join(format!(
            ".staging-{}-{}",
            platform.directory_name(),
            scheme.name().replace(['/', ' '], "_")
        ));
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// Move every staged entry into the platform directory, replacing
    /// same-named leftovers from earlier runs.
    fn land(&self, platform_dir: &Path) -> io::Result<Vec<PathBuf>> {
        fs::create_dir_all(platform_dir)?;
        let mut landed = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let target = platform_dir.join(entry.file_name());
            match fs::symlink_metadata(&target) {
                Ok(meta) if meta.file_type().is_dir() => fs::remove_dir_all(&target)?,
                Ok(_) => fs::remove_file(&target)?,
                Err(_) => {}
            }
            fs::rename(entry.path(), &target)?;
            landed.push(target);
        }
        Ok(landed)
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}
