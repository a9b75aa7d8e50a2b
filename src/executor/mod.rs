//! Per-variant scheme builds and the cached toolchain queries behind them.
//!
//! The executor owns the two query caches of a run: build settings keyed by
//! exact [`BuildArguments`], and simulator destination strings keyed by
//! [`Variant`]. Both remember failures, so a scheme that cannot be queried
//! never costs a second toolchain round trip.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::cache::QueryCache;
use crate::task::{CancelToken, TaskError, TaskEvent, TaskRequest, TaskRunner};
use crate::xcode::{BuildArguments, BuildSettings, SettingsError, Variant};

/// Wall-clock budget for a settings query. A hung query is a toolchain
/// defect, not a slow build, and is reported as such.
pub const SETTINGS_TIMEOUT: Duration = Duration::from_secs(60);

/// Result type for executor operations
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Errors from building one scheme variant. Clone-able because outcomes are
/// memoized and replayed by the query caches.
#[derive(Debug, Clone, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Task(#[from] Arc<TaskError>),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("no available simulators for {variant}")]
    NoAvailableSimulators { variant: Variant },

    #[error("could not parse simulator inventory: {0}")]
    DeviceInventory(String),

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl From<TaskError> for ExecutorError {
    fn from(err: TaskError) -> Self {
        ExecutorError::Task(Arc::new(err))
    }
}

impl From<io::Error> for ExecutorError {
    fn from(err: io::Error) -> Self {
        ExecutorError::Io(Arc::new(err))
    }
}

impl ExecutorError {
    /// Whether this error is (or wraps) a cancellation, which the
    /// orchestrator propagates distinctly from build failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecutorError::Task(task) if matches!(**task, TaskError::Cancelled))
    }
}

/// The `xcodebuild` action to run for a variant. Device builds archive
/// (plain device builds trip an instrumentation defect in the toolchain);
/// everything else builds.
pub fn build_action(variant: Option<Variant>) -> &'static str {
    match variant {
        Some(v) if !v.is_simulator() && v != Variant::MacOSX => "archive",
        _ => "build",
    }
}

#[derive(Debug, Deserialize)]
struct DeviceInventory {
    devices: HashMap<String, Vec<SimulatorDevice>>,
}

#[derive(Debug, Deserialize)]
struct SimulatorDevice {
    udid: String,
    #[serde(default, rename = "isAvailable")]
    is_available: bool,
    #[serde(default)]
    state: String,
}

/// Runs one scheme for one platform variant and returns the per-target
/// build settings of what was built.
pub struct BuildExecutor {
    runner: Arc<dyn TaskRunner>,
    settings_cache: QueryCache<BuildArguments, Vec<BuildSettings>, ExecutorError>,
    destination_cache: QueryCache<Variant, String, ExecutorError>,
    /// Nested dependency checkouts; targets whose project lives under this
    /// directory belong to transitive dependencies and are not rebuilt.
    checkouts_dir: PathBuf,
}

impl BuildExecutor {
    pub fn new(runner: Arc<dyn TaskRunner>, checkouts_dir: PathBuf) -> Self {
        Self {
            runner,
            settings_cache: QueryCache::new(),
            destination_cache: QueryCache::new(),
            checkouts_dir,
        }
    }

    pub fn runner(&self) -> &Arc<dyn TaskRunner> {
        &self.runner
    }

    /// Query build settings for `arguments`, memoized on the exact
    /// arguments. The query runs under [`SETTINGS_TIMEOUT`].
    pub fn query_settings(
        &self,
        arguments: &BuildArguments,
        cancel: &CancelToken,
    ) -> ExecutorResult<Vec<BuildSettings>> {
        self.settings_cache
            .get_or_compute(arguments, || {
                let mut args = arguments.to_arguments();
                args.push(build_action(arguments.variant).to_string());
                args.push("-showBuildSettings".to_string());
                args.push("-skipUnavailableActions".to_string());

                let request = TaskRequest::new("xcodebuild", args).timeout(SETTINGS_TIMEOUT);
                let stdout = self.runner.run(&request, cancel, &mut |_| {})?;
                let text = String::from_utf8_lossy(&stdout);
                Ok(BuildSettings::parse_all(&text)?)
            })
            .map_err(|shared| (*shared).clone())
    }

    /// Resolve a concrete `-destination` value for a simulator variant,
    /// memoized once per variant. Device and macOS variants need none.
    pub fn resolve_destination(
        &self,
        variant: Variant,
        cancel: &CancelToken,
    ) -> ExecutorResult<Option<String>> {
        let Some(platform_name) = variant.simulator_platform_name() else {
            return Ok(None);
        };

        self.destination_cache
            .get_or_compute(&variant, || {
                let request = TaskRequest::new(
                    "xcrun",
                    ["simctl", "list", "devices", "available", "--json"],
                );
                let stdout = self.runner.run(&request, cancel, &mut |_| {})?;
                let inventory: DeviceInventory = serde_json::from_slice(&stdout)
                    .map_err(|e| ExecutorError::DeviceInventory(e.to_string()))?;

                let runtime_marker = format!(".{platform_name}-");
                let mut candidates: Vec<&SimulatorDevice> = inventory
                    .devices
                    .iter()
                    .filter(|(runtime, _)| runtime.contains(&runtime_marker))
                    .flat_map(|(_, devices)| devices)
                    .filter(|device| device.is_available)
                    .collect();
                // A booted device avoids simulator spin-up inside the build.
                candidates.sort_by_key(|device| device.state != "Booted");

                candidates
                    .first()
                    .map(|device| format!("id={}", device.udid))
                    .ok_or(ExecutorError::NoAvailableSimulators { variant })
            })
            .map(Some)
            .map_err(|shared| (*shared).clone())
    }

    /// Build `arguments`' scheme for `variant` and return the settings of
    /// every target the build produced a framework for.
    ///
    /// Output events of the underlying toolchain process stream through
    /// `sink` live.
    pub fn build(
        &self,
        variant: Variant,
        arguments: &BuildArguments,
        cancel: &CancelToken,
        sink: &mut dyn FnMut(TaskEvent),
    ) -> ExecutorResult<Vec<BuildSettings>> {
        let mut arguments = arguments.clone();
        arguments.variant = Some(variant);
        if arguments.destination.is_none() {
            arguments.destination = self.resolve_destination(variant, cancel)?;
        }

        let mut args = arguments.to_arguments();
        args.push(build_action(Some(variant)).to_string());
        let request = TaskRequest::new("xcodebuild", args)
            .current_dir(parent_dir(arguments.project.path()));
        self.runner.run(&request, cancel, sink)?;

        let settings = self.query_settings(&arguments, cancel)?;
        let mut produced = Vec::new();
        for target in settings {
            if target.framework_type().is_none() {
                continue;
            }
            if let Some(project) = target.project_path() {
                if project.starts_with(&self.checkouts_dir) {
                    continue;
                }
            }
            if variant.requires_bitcode() && !target.bitcode_enabled() {
                continue;
            }
            // Same-named products of two targets share an intermediates
            // path across schemes; stale state from a previous target must
            // not leak into this one.
            if let Some(temp_dir) = target.target_temp_dir() {
                match fs::remove_dir_all(&temp_dir) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            produced.push(target);
        }
        Ok(produced)
    }
}

fn parent_dir(path: &std::path::Path) -> PathBuf {
    path.parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}
