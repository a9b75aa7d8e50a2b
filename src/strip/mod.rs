//! Post-processing of a framework bundle for distribution: architecture
//! stripping, debug-symbol stripping, header/module removal, and
//! codesigning.
//!
//! The step order is fixed because any binary mutation after signing
//! invalidates the signature.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::merge::resolve_destination_symlinks;
use crate::task::{CancelToken, TaskError, TaskRequest, TaskRunner};

/// Result type for strip operations
pub type StripResult<T> = Result<T, StripError>;

/// Errors from framework post-processing
#[derive(Debug, Error)]
pub enum StripError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("unexpected framework layout: {0}")]
    Layout(String),
}

/// What to do to a framework bundle before distribution.
#[derive(Debug, Clone, Default)]
pub struct StripOptions {
    /// Architectures to keep; every other slice is removed.
    pub keep_architectures: Vec<String>,
    /// Strip debugging symbols from the binary.
    pub strip_debug_symbols: bool,
    /// Codesign with this identity after all mutations.
    pub codesign_identity: Option<String>,
}

/// Bundle subdirectories removed before distribution. Absence of any of
/// them is not an error.
const REMOVED_DIRECTORIES: [&str; 3] = ["Headers", "PrivateHeaders", "Modules"];

/// Strip and optionally re-sign `framework` in place.
pub fn strip_framework(
    runner: &Arc<dyn TaskRunner>,
    framework: &Path,
    options: &StripOptions,
    cancel: &CancelToken,
) -> StripResult<()> {
    let binary = framework_binary(framework)?;

    let present = list_architectures(runner, &binary, cancel)?;
    for architecture in present {
        if options
            .keep_architectures
            .iter()
            .any(|keep| *keep == architecture)
        {
            continue;
        }
        let request = TaskRequest::new(
            "lipo",
            [
                binary.display().to_string(),
                "-remove".to_string(),
                architecture,
                "-output".to_string(),
                binary.display().to_string(),
            ],
        );
        runner.run(&request, cancel, &mut |_| {})?;
    }

    if options.strip_debug_symbols {
        let request = TaskRequest::new("strip", ["-S".to_string(), binary.display().to_string()]);
        runner.run(&request, cancel, &mut |_| {})?;
    }

    for name in REMOVED_DIRECTORIES {
        remove_bundle_directory(framework, name)?;
    }

    if let Some(ref identity) = options.codesign_identity {
        let request = TaskRequest::new(
            "codesign",
            [
                "--force".to_string(),
                "--sign".to_string(),
                identity.clone(),
                "--preserve-metadata=identifier,entitlements".to_string(),
                framework.display().to_string(),
            ],
        );
        runner.run(&request, cancel, &mut |_| {})?;
    }

    Ok(())
}

/// The framework's main binary: `Foo.framework/Foo`, following symlinked
/// layouts.
fn framework_binary(framework: &Path) -> StripResult<PathBuf> {
    let stem = framework
        .file_stem()
        .ok_or_else(|| StripError::Layout(format!("no framework name: {}", framework.display())))?;
    Ok(resolve_destination_symlinks(framework.join(stem)))
}

fn list_architectures(
    runner: &Arc<dyn TaskRunner>,
    binary: &Path,
    cancel: &CancelToken,
) -> StripResult<Vec<String>> {
    let request = TaskRequest::new(
        "lipo",
        ["-archs".to_string(), binary.display().to_string()],
    );
    let stdout = runner.run(&request, cancel, &mut |_| {})?;
    Ok(String::from_utf8_lossy(&stdout)
        .split_whitespace()
        .map(str::to_string)
        .collect())
}

/// Remove a bundle subdirectory, resolving a symlinked entry to its target
/// first. Idempotent: a missing directory is success.
fn remove_bundle_directory(framework: &Path, name: &str) -> StripResult<()> {
    let entry = framework.join(name);
    let resolved = resolve_destination_symlinks(entry.clone());

    match fs::remove_dir_all(&resolved) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    // The symlink itself, when the entry was one.
    if fs::symlink_metadata(&entry)
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
    {
        fs::remove_file(&entry)?;
    }
    Ok(())
}
