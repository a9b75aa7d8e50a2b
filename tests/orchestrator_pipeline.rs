//! End-to-end pipeline tests against a scripted toolchain.
//!
//! These tests drive the full orchestrator — discovery, per-scheme builds,
//! fan-out/fan-in merge, post-build hooks — with every toolchain invocation
//! answered by a `ScriptedRunner`, never a real `xcodebuild`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use xcforge::mock::ScriptedRunner;
use xcforge::orchestrator::{
    BuildError, BuildEvent, BuildOrchestrator, BuildResult, VersionRecord, VersionRecorder,
};
use xcforge::{BuildOptions, CancelToken, Platform, Scheme, Variant};

const LIST_OUTPUT: &str = "\
Information about project \"Dep\":
    Schemes:
        Dep
";

fn settings_block(target: &str, pairs: &[(&str, String)]) -> String {
    let mut out = format!("Build settings for action build and target {target}:\n");
    for (key, value) in pairs {
        out.push_str(&format!("    {key} = {value}\n"));
    }
    out
}

fn framework_settings(products_dir: &Path, platforms: &str) -> String {
    settings_block(
        "Dep",
        &[
            ("BUILT_PRODUCTS_DIR", products_dir.display().to_string()),
            ("WRAPPER_NAME", "Dep.framework".to_string()),
            ("EXECUTABLE_PATH", "Dep.framework/Dep".to_string()),
            (
                "PRODUCT_TYPE",
                "com.apple.product-type.framework".to_string(),
            ),
            ("SUPPORTED_PLATFORMS", platforms.to_string()),
            ("ENABLE_BITCODE", "YES".to_string()),
            ("PRODUCT_MODULE_NAME", "Dep".to_string()),
        ],
    )
}

const SIMCTL_JSON: &str = r#"{"devices":{
    "com.apple.CoreSimulator.SimRuntime.iOS-18-0":[
        {"udid":"SIM-1","isAvailable":true,"state":"Booted","name":"iPhone 16"}
    ]}}"#;

struct Fixture {
    _temp: TempDir,
    root: PathBuf,
    device_products: PathBuf,
    simulator_products: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        fs::create_dir_all(root.join("Dep.xcodeproj")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();

        let device_products = root.join("DerivedData/Release-iphoneos");
        let simulator_products = root.join("DerivedData/Release-iphonesimulator");
        for (dir, binary) in [
            (&device_products, b"arm64-slices".as_slice()),
            (&simulator_products, b"x86-slices".as_slice()),
        ] {
            let product = dir.join("Dep.framework");
            fs::create_dir_all(product.join("Modules/Dep.swiftmodule")).unwrap();
            fs::write(product.join("Dep"), binary).unwrap();
            fs::write(product.join("Info.plist"), b"plist").unwrap();
        }
        fs::write(
            device_products.join("Dep.framework/Modules/Dep.swiftmodule/arm64.swiftmodule"),
            b"arm64",
        )
        .unwrap();
        fs::write(
            simulator_products.join("Dep.framework/Modules/Dep.swiftmodule/x86_64.swiftmodule"),
            b"x86_64",
        )
        .unwrap();

        Self {
            _temp: temp,
            root,
            device_products,
            simulator_products,
        }
    }

    /// A runner scripted for a device+simulator iOS pair.
    fn pair_runner(&self) -> ScriptedRunner {
        ScriptedRunner::new()
            .on_args("-list", LIST_OUTPUT.as_bytes().to_vec())
            .on_all(
                ["-sdk iphoneos", "-showBuildSettings"],
                framework_settings(&self.device_products, "iphoneos iphonesimulator").into_bytes(),
            )
            .on_all(
                ["-sdk iphonesimulator", "-showBuildSettings"],
                framework_settings(&self.simulator_products, "iphoneos iphonesimulator")
                    .into_bytes(),
            )
            .on_args(
                "-showBuildSettings",
                framework_settings(&self.device_products, "iphoneos iphonesimulator").into_bytes(),
            )
            .on_program("xcrun", SIMCTL_JSON.as_bytes().to_vec())
            .on_all(["-sdk iphoneos", " archive"], Vec::new())
            .on_all(["-sdk iphonesimulator", " build"], Vec::new())
            .on_args("lipo", Vec::new())
            .on_program("dwarfdump", Vec::new())
            .on_program("git", b"0123abcd\n".to_vec())
    }

    fn orchestrator(&self, runner: Arc<ScriptedRunner>, options: BuildOptions) -> BuildOrchestrator {
        BuildOrchestrator::new(runner, self.root.clone(), options)
    }

    fn platform_dir(&self, platform: Platform) -> PathBuf {
        self.root
            .join("XCForge/Build")
            .join(platform.directory_name())
    }
}

#[test]
fn test_device_simulator_pair_builds_device_first_and_merges_once() {
    let fixture = Fixture::new();
    let runner = Arc::new(fixture.pair_runner());
    let orchestrator = fixture.orchestrator(runner.clone(), BuildOptions::default());

    let mut events = Vec::new();
    let artifacts = orchestrator
        .build(&CancelToken::new(), &mut |event| events.push(event))
        .unwrap();

    // One merged artifact for iOS.
    let merged = fixture.platform_dir(Platform::IOS).join("Dep.framework");
    assert_eq!(artifacts, vec![merged.clone()]);
    assert!(merged.join("Info.plist").is_file());

    // Simulator-only module artifacts were recovered into the merged
    // product.
    let modules = merged.join("Modules/Dep.swiftmodule");
    assert!(modules.join("arm64.swiftmodule").is_file());
    assert!(modules.join("x86_64.swiftmodule").is_file());

    // Exactly one fat-binary merge over both executables.
    assert_eq!(runner.invocation_count_matching("lipo -create"), 1);
    let lipo = runner
        .invocations()
        .into_iter()
        .find(|request| request.program == "lipo")
        .unwrap();
    let command = lipo.display_command();
    assert!(command.contains("Release-iphoneos/Dep.framework/Dep"));
    assert!(command.contains("Release-iphonesimulator/Dep.framework/Dep"));

    // Device before simulator.
    let builds: Vec<String> = runner
        .invocations()
        .iter()
        .filter(|request| {
            let command = request.display_command();
            command.ends_with(" archive") || command.ends_with(" build")
        })
        .map(|request| request.display_command())
        .collect();
    assert_eq!(builds.len(), 2);
    assert!(builds[0].contains("-sdk iphoneos"));
    assert!(builds[1].contains("-sdk iphonesimulator"));

    // Scheme-started precedes all output; the terminal event follows it.
    assert!(matches!(events.first(), Some(BuildEvent::SchemeStarted { .. })));
    assert!(matches!(events.last(), Some(BuildEvent::SchemeBuilt { .. })));

    // No staging directory survives.
    let leftovers: Vec<_> = fs::read_dir(fixture.root.join("XCForge/Build"))
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(".staging"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_single_variant_scheme_copies_directly_without_merge() {
    let fixture = Fixture::new();
    let mac_products = fixture.root.join("DerivedData/Release");
    let product = mac_products.join("Dep.framework");
    fs::create_dir_all(&product).unwrap();
    fs::write(product.join("Dep"), b"mac binary").unwrap();

    let runner = Arc::new(
        ScriptedRunner::new()
            .on_args("-list", LIST_OUTPUT.as_bytes().to_vec())
            .on_args(
                "-showBuildSettings",
                framework_settings(&mac_products, "macosx").into_bytes(),
            )
            .on_all(["-sdk macosx", " build"], Vec::new())
            .on_program("dwarfdump", Vec::new())
            .on_program("git", b"0123abcd\n".to_vec()),
    );
    let orchestrator = fixture.orchestrator(runner.clone(), BuildOptions::default());

    let artifacts = orchestrator
        .build(&CancelToken::new(), &mut |_| {})
        .unwrap();

    let copied = fixture.platform_dir(Platform::MacOS).join("Dep.framework");
    assert_eq!(artifacts, vec![copied.clone()]);
    assert_eq!(fs::read(copied.join("Dep")).unwrap(), b"mac binary");
    assert_eq!(runner.invocation_count("lipo"), 0);
}

#[test]
fn test_three_variants_for_one_platform_is_fatal_with_no_artifact() {
    let fixture = Fixture::new();
    let runner = Arc::new(fixture.pair_runner());
    let orchestrator = fixture
        .orchestrator(runner, BuildOptions::default())
        .with_variant_filter(Box::new(|_, _, _, _| {
            Ok(vec![
                Variant::IPhoneOS,
                Variant::IPhoneSimulator,
                Variant::IPhoneOS,
            ])
        }));

    let err = orchestrator
        .build(&CancelToken::new(), &mut |_| {})
        .unwrap_err();
    match err {
        BuildError::InvalidVariantCount {
            platform, count, ..
        } => {
            assert_eq!(platform, Platform::IOS);
            assert_eq!(count, 3);
        }
        other => panic!("expected InvalidVariantCount, got {other}"),
    }
    assert!(!fixture.platform_dir(Platform::IOS).exists());
}

#[test]
fn test_empty_directory_completes_with_no_artifacts() {
    let temp = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new());
    let orchestrator =
        BuildOrchestrator::new(runner, temp.path().to_path_buf(), BuildOptions::default());

    let artifacts = orchestrator
        .build(&CancelToken::new(), &mut |_| {})
        .unwrap();
    assert!(artifacts.is_empty());
}

#[test]
fn test_empty_discovery_for_dependency_is_rewritten_with_identity() {
    // No projects at all: the raw condition becomes "no shared schemes"
    // carrying the dependency's name.
    let temp = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::new());
    let options = BuildOptions {
        dependency: Some("Alamofire".to_string()),
        ..Default::default()
    };
    let orchestrator = BuildOrchestrator::new(runner, temp.path().to_path_buf(), options.clone());
    let err = orchestrator
        .build(&CancelToken::new(), &mut |_| {})
        .unwrap_err();
    assert!(matches!(
        err,
        BuildError::NoSharedSchemes { ref dependency } if dependency == "Alamofire"
    ));

    // Schemes exist but none produce frameworks: the platform-scoped
    // variant of the error, still carrying the identity.
    let fixture = Fixture::new();
    let runner = Arc::new(
        ScriptedRunner::new()
            .on_args("-list", LIST_OUTPUT.as_bytes().to_vec())
            .on_args(
                "-showBuildSettings",
                settings_block(
                    "Dep",
                    &[(
                        "PRODUCT_TYPE",
                        "com.apple.product-type.tool".to_string(),
                    )],
                )
                .into_bytes(),
            ),
    );
    let orchestrator = fixture.orchestrator(runner, options);
    let err = orchestrator
        .build(&CancelToken::new(), &mut |_| {})
        .unwrap_err();
    assert!(matches!(
        err,
        BuildError::NoSharedFrameworkSchemes { ref dependency, .. } if dependency == "Alamofire"
    ));
}

#[test]
fn test_scheme_rejected_by_matcher_is_never_built() {
    let fixture = Fixture::new();
    let runner = Arc::new(fixture.pair_runner());
    let orchestrator = fixture
        .orchestrator(runner.clone(), BuildOptions::default())
        .with_scheme_matcher(Box::new(|name| name != "Dep"));

    let artifacts = orchestrator
        .build(&CancelToken::new(), &mut |_| {})
        .unwrap();
    assert!(artifacts.is_empty());
    assert_eq!(runner.invocation_count_matching(" archive"), 0);
}

struct RecordingRecorder {
    records: Mutex<Vec<VersionRecord>>,
    order: Arc<AtomicUsize>,
    recorded_at_step: AtomicUsize,
}

impl VersionRecorder for RecordingRecorder {
    fn record_version(&self, record: &VersionRecord, _root: &Path) -> BuildResult<()> {
        self.recorded_at_step
            .store(self.order.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

#[test]
fn test_post_build_hook_records_version_then_invokes_callback() {
    let fixture = Fixture::new();
    let runner = Arc::new(fixture.pair_runner());

    let order = Arc::new(AtomicUsize::new(0));
    let recorder = Arc::new(RecordingRecorder {
        records: Mutex::new(Vec::new()),
        order: Arc::clone(&order),
        recorded_at_step: AtomicUsize::new(usize::MAX),
    });
    let callback_step = Arc::new(AtomicUsize::new(usize::MAX));

    struct SharedRecorder(Arc<RecordingRecorder>);
    impl VersionRecorder for SharedRecorder {
        fn record_version(&self, record: &VersionRecord, root: &Path) -> BuildResult<()> {
            self.0.record_version(record, root)
        }
    }

    let callback_order = Arc::clone(&order);
    let callback_step_clone = Arc::clone(&callback_step);
    let orchestrator = fixture
        .orchestrator(runner, BuildOptions::default())
        .with_version_recorder(Box::new(SharedRecorder(Arc::clone(&recorder))))
        .with_products_callback(Box::new(move |artifacts| {
            assert!(!artifacts.is_empty());
            callback_step_clone.store(
                callback_order.fetch_add(1, Ordering::SeqCst),
                Ordering::SeqCst,
            );
            Ok(())
        }));

    orchestrator
        .build(&CancelToken::new(), &mut |_| {})
        .unwrap();

    let records = recorder.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    // Built from a plain checkout: identity is the current commit.
    assert_eq!(records[0].identity, "0123abcd");
    assert_eq!(records[0].configuration, "Release");
    assert_eq!(records[0].platforms, vec![Platform::IOS]);
    assert!(records[0].artifacts[0].ends_with("Dep.framework"));

    // Version record strictly before the callback.
    assert!(
        recorder.recorded_at_step.load(Ordering::SeqCst)
            < callback_step.load(Ordering::SeqCst)
    );
}

#[test]
fn test_post_build_hook_skipped_outside_version_control() {
    let fixture = Fixture::new();
    fs::remove_dir_all(fixture.root.join(".git")).unwrap();
    let runner = Arc::new(fixture.pair_runner());

    let called = Arc::new(AtomicUsize::new(0));
    let called_clone = Arc::clone(&called);
    let orchestrator = fixture
        .orchestrator(runner, BuildOptions::default())
        .with_products_callback(Box::new(move |_| {
            called_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

    orchestrator
        .build(&CancelToken::new(), &mut |_| {})
        .unwrap();
    assert_eq!(called.load(Ordering::SeqCst), 0);
}

#[test]
fn test_cancellation_mid_scheme_leaves_destination_absent() {
    let fixture = Fixture::new();
    let runner = Arc::new(fixture.pair_runner());
    let orchestrator = fixture.orchestrator(runner, BuildOptions::default());

    let cancel = CancelToken::new();
    let cancel_handle = cancel.clone();
    let err = orchestrator
        .build(&cancel, &mut |event| {
            // Trip cancellation once the second half of the pair launches,
            // after the device product has already been built.
            if let BuildEvent::Launch { ref command } = event {
                if command.contains("-sdk iphonesimulator") {
                    cancel_handle.cancel();
                }
            }
        })
        .unwrap_err();

    assert!(matches!(err, BuildError::Cancelled));
    assert!(!fixture.platform_dir(Platform::IOS).exists());

    // No staged half-merged product remains either.
    let build_dir = fixture.root.join("XCForge/Build");
    let leftovers: Vec<_> = fs::read_dir(&build_dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(".staging"))
        .collect();
    assert!(leftovers.is_empty());

    // The directory lock was released on the cancellation path.
    let relock = xcforge::lock::DirectoryLock::acquire(
        &build_dir,
        std::time::Duration::from_millis(200),
    );
    assert!(relock.is_ok());
}

#[test]
fn test_cancellation_mid_merge_leaves_destination_absent() {
    let fixture = Fixture::new();
    let runner = Arc::new(fixture.pair_runner());
    let orchestrator = fixture.orchestrator(runner.clone(), BuildOptions::default());

    let cancel = CancelToken::new();
    let cancel_handle = cancel.clone();
    let err = orchestrator
        .build(&cancel, &mut |event| {
            // Both variants have built; trip cancellation while the fat
            // binary is being assembled.
            if let BuildEvent::Launch { ref command } = event {
                if command.starts_with("lipo") {
                    cancel_handle.cancel();
                }
            }
        })
        .unwrap_err();

    assert!(matches!(err, BuildError::Cancelled));
    // The merge got as far as the executable union and no further.
    assert_eq!(runner.invocation_count_matching("lipo -create"), 1);
    assert!(!fixture.platform_dir(Platform::IOS).exists());

    let leftovers: Vec<_> = fs::read_dir(fixture.root.join("XCForge/Build"))
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(".staging"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_settings_queried_once_per_scheme_with_option_overrides() {
    let fixture = Fixture::new();
    let runner = Arc::new(fixture.pair_runner());
    let options = BuildOptions {
        toolchain: Some("swift-dev".to_string()),
        derived_data_path: Some(fixture.root.join("DerivedData")),
        ..Default::default()
    };
    let orchestrator = fixture.orchestrator(runner.clone(), options);

    orchestrator
        .build(&CancelToken::new(), &mut |_| {})
        .unwrap();

    // Discovery's eligibility check and the build stage share one cached
    // base settings query; the variant-specific queries carry `-sdk`.
    let base_queries: Vec<String> = runner
        .invocations()
        .iter()
        .map(|request| request.display_command())
        .filter(|command| {
            command.contains("-showBuildSettings") && !command.contains("-sdk ")
        })
        .collect();
    assert_eq!(base_queries.len(), 1, "base queries: {base_queries:?}");
    assert!(base_queries[0].contains("-toolchain swift-dev"));
    assert!(base_queries[0].contains("-derivedDataPath"));
}

#[test]
fn test_failed_build_surfaces_stderr_and_emits_scheme_failed() {
    let fixture = Fixture::new();
    let runner = Arc::new(
        ScriptedRunner::new()
            .on_args("-list", LIST_OUTPUT.as_bytes().to_vec())
            .on_args(
                "-showBuildSettings",
                framework_settings(&fixture.device_products, "macosx").into_bytes(),
            )
            .fail_on(" build", 65, "error: linker command failed"),
    );
    let orchestrator = fixture.orchestrator(runner, BuildOptions::default());

    let mut failed_schemes = Vec::new();
    let err = orchestrator
        .build(&CancelToken::new(), &mut |event| {
            if let BuildEvent::SchemeFailed { scheme, .. } = event {
                failed_schemes.push(scheme);
            }
        })
        .unwrap_err();

    assert!(err.to_string().contains("linker command failed"));
    assert_eq!(failed_schemes, vec![Scheme::from("Dep")]);
}

#[test]
fn test_debug_symbols_generated_when_uuids_present() {
    let fixture = Fixture::new();
    let runner = Arc::new(
        ScriptedRunner::new()
            .on_args("-list", LIST_OUTPUT.as_bytes().to_vec())
            .on_all(
                ["-sdk iphoneos", "-showBuildSettings"],
                framework_settings(&fixture.device_products, "iphoneos iphonesimulator")
                    .into_bytes(),
            )
            .on_all(
                ["-sdk iphonesimulator", "-showBuildSettings"],
                framework_settings(&fixture.simulator_products, "iphoneos iphonesimulator")
                    .into_bytes(),
            )
            .on_args(
                "-showBuildSettings",
                framework_settings(&fixture.device_products, "iphoneos iphonesimulator")
                    .into_bytes(),
            )
            .on_program("xcrun", SIMCTL_JSON.as_bytes().to_vec())
            .on_all(["-sdk iphoneos", " archive"], Vec::new())
            .on_all(["-sdk iphonesimulator", " build"], Vec::new())
            .on_args("lipo", Vec::new())
            .on_program(
                "dwarfdump",
                b"UUID: ABCDEF01-2345-6789-ABCD-EF0123456789 (arm64) Dep\n".to_vec(),
            )
            .on_program("dsymutil", Vec::new())
            .on_program("git", b"0123abcd\n".to_vec()),
    );
    let orchestrator = fixture.orchestrator(runner.clone(), BuildOptions::default());

    orchestrator
        .build(&CancelToken::new(), &mut |_| {})
        .unwrap();
    assert_eq!(runner.invocation_count("dsymutil"), 1);
    let dsymutil = runner
        .invocations()
        .into_iter()
        .find(|request| request.program == "dsymutil")
        .unwrap();
    assert!(dsymutil
        .display_command()
        .contains("Dep.framework.dSYM"));
}
