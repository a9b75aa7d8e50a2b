//! Core Xcode data model: platforms, build variants, project locators,
//! schemes, and the build-arguments cache key.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub mod settings;

pub use settings::{BuildSettings, SettingsError, SettingsResult};

/// A platform an artifact is produced for. Each platform owns one output
/// subdirectory under the build directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[serde(rename = "ios")]
    IOS,
    #[serde(rename = "macos")]
    MacOS,
    #[serde(rename = "tvos")]
    TvOS,
    #[serde(rename = "watchos")]
    WatchOS,
}

impl Platform {
    /// Name of the platform's artifact subdirectory (`Build/<name>/`).
    pub fn directory_name(&self) -> &'static str {
        match self {
            Platform::IOS => "iOS",
            Platform::MacOS => "Mac",
            Platform::TvOS => "tvOS",
            Platform::WatchOS => "watchOS",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::IOS => "iOS",
            Platform::MacOS => "macOS",
            Platform::TvOS => "tvOS",
            Platform::WatchOS => "watchOS",
        };
        write!(f, "{name}")
    }
}

/// A platform plus device/simulator environment — the unit a single
/// toolchain build runs against (the SDK in toolchain terms).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    #[serde(rename = "iphoneos")]
    IPhoneOS,
    #[serde(rename = "iphonesimulator")]
    IPhoneSimulator,
    #[serde(rename = "macosx")]
    MacOSX,
    #[serde(rename = "appletvos")]
    AppleTVOS,
    #[serde(rename = "appletvsimulator")]
    AppleTVSimulator,
    #[serde(rename = "watchos")]
    WatchOS,
    #[serde(rename = "watchsimulator")]
    WatchSimulator,
}

impl Variant {
    pub const ALL: [Variant; 7] = [
        Variant::IPhoneOS,
        Variant::IPhoneSimulator,
        Variant::MacOSX,
        Variant::AppleTVOS,
        Variant::AppleTVSimulator,
        Variant::WatchOS,
        Variant::WatchSimulator,
    ];

    /// The SDK name understood by `xcodebuild -sdk` and reported in
    /// `SUPPORTED_PLATFORMS`.
    pub fn sdk_name(&self) -> &'static str {
        match self {
            Variant::IPhoneOS => "iphoneos",
            Variant::IPhoneSimulator => "iphonesimulator",
            Variant::MacOSX => "macosx",
            Variant::AppleTVOS => "appletvos",
            Variant::AppleTVSimulator => "appletvsimulator",
            Variant::WatchOS => "watchos",
            Variant::WatchSimulator => "watchsimulator",
        }
    }

    pub fn from_sdk_name(name: &str) -> Option<Variant> {
        Variant::ALL
            .iter()
            .copied()
            .find(|variant| variant.sdk_name().eq_ignore_ascii_case(name))
    }

    pub fn platform(&self) -> Platform {
        match self {
            Variant::IPhoneOS | Variant::IPhoneSimulator => Platform::IOS,
            Variant::MacOSX => Platform::MacOS,
            Variant::AppleTVOS | Variant::AppleTVSimulator => Platform::TvOS,
            Variant::WatchOS | Variant::WatchSimulator => Platform::WatchOS,
        }
    }

    pub fn is_simulator(&self) -> bool {
        matches!(
            self,
            Variant::IPhoneSimulator | Variant::AppleTVSimulator | Variant::WatchSimulator
        )
    }

    /// Device variants of embedded platforms require bitcode-capable
    /// products; a project with bitcode disabled is skipped for them.
    pub fn requires_bitcode(&self) -> bool {
        matches!(
            self,
            Variant::IPhoneOS | Variant::AppleTVOS | Variant::WatchOS
        )
    }

    /// The platform name `simctl` reports for this simulator variant.
    pub fn simulator_platform_name(&self) -> Option<&'static str> {
        match self {
            Variant::IPhoneSimulator => Some("iOS"),
            Variant::AppleTVSimulator => Some("tvOS"),
            Variant::WatchSimulator => Some("watchOS"),
            _ => None,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sdk_name())
    }
}

/// The kind of framework product a target produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameworkType {
    Dynamic,
    Static,
}

/// A project or workspace on disk. Workspaces aggregate projects, so they
/// sort ahead of plain projects at the same path and win scheme
/// aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "path", rename_all = "lowercase")]
pub enum ProjectLocator {
    Workspace(PathBuf),
    ProjectFile(PathBuf),
}

impl ProjectLocator {
    pub fn path(&self) -> &Path {
        match self {
            ProjectLocator::Workspace(path) | ProjectLocator::ProjectFile(path) => path,
        }
    }

    fn order_level(&self) -> u8 {
        match self {
            ProjectLocator::Workspace(_) => 0,
            ProjectLocator::ProjectFile(_) => 1,
        }
    }
}

impl PartialOrd for ProjectLocator {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProjectLocator {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.order_level()
            .cmp(&other.order_level())
            .then_with(|| self.path().cmp(other.path()))
    }
}

impl fmt::Display for ProjectLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path().display())
    }
}

/// A named buildable unit within a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scheme(pub String);

impl Scheme {
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Scheme {
    fn from(name: &str) -> Self {
        Scheme(name.to_string())
    }
}

/// Everything that identifies one `xcodebuild` invocation. Used as the
/// settings-cache key; equality requires every field to match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildArguments {
    pub project: ProjectLocator,
    pub scheme: Scheme,
    pub configuration: String,
    pub variant: Option<Variant>,
    pub derived_data_path: Option<PathBuf>,
    pub toolchain: Option<String>,
    pub destination: Option<String>,
}

impl BuildArguments {
    pub fn new(project: ProjectLocator, scheme: Scheme, configuration: impl Into<String>) -> Self {
        Self {
            project,
            scheme,
            configuration: configuration.into(),
            variant: None,
            derived_data_path: None,
            toolchain: None,
            destination: None,
        }
    }

    /// Render as `xcodebuild` command-line arguments, action excluded.
    pub fn to_arguments(&self) -> Vec<String> {
        let mut args = Vec::new();
        match &self.project {
            ProjectLocator::Workspace(path) => {
                args.push("-workspace".to_string());
                args.push(path.display().to_string());
            }
            ProjectLocator::ProjectFile(path) => {
                args.push("-project".to_string());
                args.push(path.display().to_string());
            }
        }
        args.push("-scheme".to_string());
        args.push(self.scheme.name().to_string());
        args.push("-configuration".to_string());
        args.push(self.configuration.clone());
        if let Some(ref path) = self.derived_data_path {
            args.push("-derivedDataPath".to_string());
            args.push(path.display().to_string());
        }
        if let Some(ref toolchain) = self.toolchain {
            args.push("-toolchain".to_string());
            args.push(toolchain.clone());
        }
        if let Some(variant) = self.variant {
            args.push("-sdk".to_string());
            args.push(variant.sdk_name().to_string());
        }
        if let Some(ref destination) = self.destination {
            args.push("-destination".to_string());
            args.push(destination.clone());
        }
        args
    }
}
