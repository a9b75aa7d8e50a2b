//! XCForge — framework build orchestration for Xcode dependencies.
//!
//! Builds native framework binaries for every buildable scheme under a
//! directory, producing one artifact per platform per dependency: a single
//! device/simulator fat framework where both variants exist, a plain copy
//! otherwise. Toolchain invocations are cached, serialized against a locked
//! shared build directory, and cancellable at any point.

pub mod cache;
pub mod config;
pub mod discovery;
pub mod executor;
pub mod lock;
pub mod merge;
pub mod mock;
pub mod orchestrator;
pub mod strip;
pub mod task;
pub mod xcode;

pub use config::{BuildOptions, ConfigOverlay};
pub use orchestrator::{
    BuildError, BuildEvent, BuildOrchestrator, BuildResult, VersionRecord, VersionRecorder,
};
pub use strip::{strip_framework, StripOptions};
pub use task::{CancelToken, ProcessRunner, TaskEvent, TaskRequest, TaskRunner};
pub use xcode::{
    BuildArguments, BuildSettings, FrameworkType, Platform, ProjectLocator, Scheme, Variant,
};
