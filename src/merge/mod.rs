//! Fan-in of a device build and a simulator build into one fat framework.
//!
//! The merge runs a fixed sequence: copy the device product (layout,
//! resources, manifest), `lipo -create` the two executables, merge the
//! generated Swift interface headers under a simulator guard, recover
//! per-architecture Swift module artifacts from the simulator build, and
//! copy companion symbol maps. Each step must fully succeed before the next
//! begins; a failed merge is surfaced, never treated as a valid product.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::task::{CancelToken, TaskError, TaskEvent, TaskRequest, TaskRunner};
use crate::xcode::{BuildSettings, SettingsError};

/// Result type for merge operations
pub type MergeResult<T> = Result<T, MergeError>;

/// Errors from merging two variant builds
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("unexpected product layout: {0}")]
    Layout(String),
}

impl MergeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MergeError::Task(TaskError::Cancelled))
    }
}

/// Combines device and simulator builds of one target.
pub struct MergeEngine {
    runner: Arc<dyn TaskRunner>,
}

impl MergeEngine {
    pub fn new(runner: Arc<dyn TaskRunner>) -> Self {
        Self { runner }
    }

    /// Merge `device` and `simulator` builds of the same target into
    /// `destination_dir` (the platform output directory). Tool launches and
    /// output go to `sink`. Returns the path of the merged product bundle.
    pub fn merge(
        &self,
        device: &BuildSettings,
        simulator: &BuildSettings,
        destination_dir: &Path,
        cancel: &CancelToken,
        sink: &mut dyn FnMut(TaskEvent),
    ) -> MergeResult<PathBuf> {
        let device_product = device.product_path()?;
        let product_name = device_product
            .file_name()
            .ok_or_else(|| {
                MergeError::Layout(format!("product has no name: {}", device_product.display()))
            })?
            .to_os_string();
        let merged_product = destination_dir.join(&product_name);

        self.check_cancel(cancel)?;
        fs::create_dir_all(destination_dir)?;
        copy_directory(&device_product, &merged_product)?;

        self.check_cancel(cancel)?;
        self.merge_executables(device, simulator, &merged_product, cancel, sink)?;

        self.check_cancel(cancel)?;
        merge_swift_headers(device, simulator, &merged_product)?;

        self.check_cancel(cancel)?;
        recover_simulator_modules(device, simulator, &merged_product)?;

        self.check_cancel(cancel)?;
        copy_symbol_maps(device, destination_dir)?;
        copy_symbol_maps(simulator, destination_dir)?;

        Ok(merged_product)
    }

    fn check_cancel(&self, cancel: &CancelToken) -> MergeResult<()> {
        if cancel.is_cancelled() {
            Err(MergeError::Task(TaskError::Cancelled))
        } else {
            Ok(())
        }
    }

    /// Architecture-union merge of the two executables over the copied
    /// device executable.
    fn merge_executables(
        &self,
        device: &BuildSettings,
        simulator: &BuildSettings,
        merged_product: &Path,
        cancel: &CancelToken,
        sink: &mut dyn FnMut(TaskEvent),
    ) -> MergeResult<()> {
        let device_executable = device.executable_path()?;
        let relative = device_executable
            .strip_prefix(device.product_path()?)
            .map_err(|_| {
                MergeError::Layout(format!(
                    "executable {} is outside its product bundle",
                    device_executable.display()
                ))
            })?
            .to_path_buf();
        let output = merged_product.join(relative);

        let request = TaskRequest::new(
            "lipo",
            [
                "-create".to_string(),
                device_executable.display().to_string(),
                simulator.executable_path()?.display().to_string(),
                "-output".to_string(),
                output.display().to_string(),
            ],
        );
        self.runner.run(&request, cancel, sink)?;
        Ok(())
    }
}

/// Merge the generated Swift interface headers of both variants into the
/// merged product, gated on `TARGET_OS_SIMULATOR`. Silently skipped when
/// either variant has no header.
fn merge_swift_headers(
    device: &BuildSettings,
    simulator: &BuildSettings,
    merged_product: &Path,
) -> MergeResult<()> {
    let (Some(device_header), Some(simulator_header)) =
        (device.swift_header_path(), simulator.swift_header_path())
    else {
        return Ok(());
    };
    if !device_header.is_file() || !simulator_header.is_file() {
        return Ok(());
    }

    let device_contents = fs::read_to_string(&device_header)?;
    let simulator_contents = fs::read_to_string(&simulator_header)?;

    let name = device_header.file_name().ok_or_else(|| {
        MergeError::Layout(format!("header has no name: {}", device_header.display()))
    })?;
    let destination = merged_product.join("Headers").join(name);
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }

    let merged = format!(
        "#ifndef TARGET_OS_SIMULATOR\n#include <TargetConditionals.h>\n#endif\n\
         #if TARGET_OS_SIMULATOR\n{simulator_contents}\n#else\n{device_contents}\n#endif\n"
    );
    fs::write(resolve_destination_symlinks(destination), merged)?;
    Ok(())
}

/// Copy per-architecture Swift module files the simulator build produced
/// into the merged product's module directory. Subdirectories and hidden
/// files are skipped; symlinked destinations are resolved before writing.
fn recover_simulator_modules(
    device: &BuildSettings,
    simulator: &BuildSettings,
    merged_product: &Path,
) -> MergeResult<()> {
    let Some(simulator_modules) = simulator.swift_module_path() else {
        return Ok(());
    };
    if !simulator_modules.is_dir() {
        return Ok(());
    }

    let device_modules = device.swift_module_path().ok_or_else(|| {
        MergeError::Layout(format!(
            "simulator build of {} has a Swift module but the device build does not",
            simulator.target()
        ))
    })?;
    let relative = device_modules
        .strip_prefix(device.product_path()?)
        .map_err(|_| {
            MergeError::Layout(format!(
                "module directory {} is outside its product bundle",
                device_modules.display()
            ))
        })?
        .to_path_buf();
    let destination_dir = merged_product.join(relative);
    fs::create_dir_all(&destination_dir)?;

    for entry in fs::read_dir(&simulator_modules)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let destination = resolve_destination_symlinks(destination_dir.join(&name));
        fs::copy(entry.path(), destination)?;
    }
    Ok(())
}

/// Copy every `.bcsymbolmap` companion from a build's products directory
/// into the destination directory.
fn copy_symbol_maps(settings: &BuildSettings, destination_dir: &Path) -> MergeResult<()> {
    let products_dir = settings.built_products_dir()?;
    if !products_dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(&products_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().map(|ext| ext == "bcsymbolmap").unwrap_or(false)
            && entry.file_type()?.is_file()
        {
            let name = entry.file_name();
            fs::copy(&path, destination_dir.join(name))?;
        }
    }
    Ok(())
}

/// Follow a chain of symlinks at `path`, returning the final target so a
/// write lands in the linked file rather than replacing the link.
pub(crate) fn resolve_destination_symlinks(path: PathBuf) -> PathBuf {
    let mut current = path;
    for _ in 0..16 {
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => match fs::read_link(&current) {
                Ok(target) => {
                    current = if target.is_absolute() {
                        target
                    } else {
                        current
                            .parent()
                            .map(|parent| parent.join(&target))
                            .unwrap_or(target)
                    };
                }
                Err(_) => break,
            },
            _ => break,
        }
    }
    current
}

/// Recursively copy a bundle, preserving symlinks as symlinks.
pub(crate) fn copy_directory(source: &Path, destination: &Path) -> io::Result<()> {
    fs::create_dir_all(destination)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = destination.join(entry.file_name());
        if file_type.is_dir() {
            copy_directory(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &target)?;
            #[cfg(not(unix))]
            {
                // Symlinked bundle members only occur on Apple hosts.
                let resolved = resolve_destination_symlinks(entry.path());
                if resolved.is_file() {
                    fs::copy(&resolved, &target)?;
                }
            }
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
