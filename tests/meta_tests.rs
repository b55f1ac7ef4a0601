//! Meta-tests that verify test suite integrity
//!
//! These tests ensure that:
//! - No tests are ignored
//! - E2E test files exist
//! - The operator-facing constants keep their documented values

use std::path::{Path, PathBuf};

fn rust_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            rust_files(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            out.push(path);
        }
    }
}

/// Verify no tests are ignored in the workspace
///
/// Ignored tests can hide regressions. All tests must run.
#[test]
fn no_ignored_tests() {
    let marker = concat!("#[", "ignore");
    let mut files = Vec::new();
    for dir in ["src", "tests", "crates"] {
        rust_files(Path::new(dir), &mut files);
    }
    assert!(!files.is_empty(), "no sources found from {:?}", std::env::current_dir());

    let offenders: Vec<String> = files
        .iter()
        .filter(|path| {
            std::fs::read_to_string(path)
                .map(|text| text.contains(marker))
                .unwrap_or(false)
        })
        .map(|path| path.display().to_string())
        .collect();

    assert!(
        offenders.is_empty(),
        "Found ignored tests - all tests must run:\n{}",
        offenders.join("\n")
    );
}

/// Verify E2E test files exist and are not empty
#[test]
fn e2e_tests_exist() {
    let test_files = [
        "e2e_reconnection.rs",
        "e2e_alerts.rs",
        "e2e_meter.rs",
        "e2e_supervisor.rs",
        "e2e_server.rs",
    ];

    for file in test_files {
        let path = format!("tests/{}", file);
        let full_path = Path::new(&path);

        assert!(
            full_path.exists(),
            "Missing E2E test file: {}. All E2E tests must be present.",
            file
        );

        let metadata = std::fs::metadata(full_path).expect("Failed to get file metadata");
        assert!(
            metadata.len() > 100,
            "E2E test file {} appears to be empty or too small ({} bytes)",
            file,
            metadata.len()
        );
    }
}

// ============================================================================
// OPERATOR-FACING BEHAVIOUR INTEGRITY TESTS
// ============================================================================

/// Verify the default retry schedule operators rely on
#[test]
fn default_retry_schedule() {
    let policy = streamwatch::RetryPolicy::default();
    let delays: Vec<u64> = (0..4)
        .map(|attempt| policy.delay_for(attempt).as_millis() as u64)
        .collect();
    assert_eq!(delays, vec![1000, 1500, 2250, 3375]);
    assert_eq!(policy.delay_for(100).as_millis(), 30_000);
}

/// Verify the alert tone envelope constants
#[test]
fn alert_tone_constants() {
    use streamwatch::alerts::tone::{TONE_DURATION, TONE_FLOOR, TONE_FREQUENCY, TONE_GAIN};
    assert_eq!(TONE_FREQUENCY, 880.0);
    assert_eq!(TONE_GAIN, 0.3);
    assert_eq!(TONE_FLOOR, 0.0001);
    assert_eq!(TONE_DURATION, 0.3);
}

/// Verify the analyser matches the level meter's expectations
#[test]
fn analyser_defaults() {
    use streamwatch::meter::analyser::{Analyser, DEFAULT_FFT_SIZE, DEFAULT_SMOOTHING};
    assert_eq!(DEFAULT_FFT_SIZE, 256);
    assert_eq!(DEFAULT_SMOOTHING, 0.7);
    let analyser = Analyser::new(DEFAULT_FFT_SIZE, DEFAULT_SMOOTHING);
    assert_eq!(analyser.frequency_bin_count(), 128);
}

/// Verify a fresh configuration matches first-run expectations
#[test]
fn first_run_configuration() {
    let config = streamwatch::Configuration::default();
    assert_eq!(config.grid_layout, "2x2");
    assert!(config.notifications.audible_enabled);
    assert!(!config.notifications.email_enabled);
    assert!(config.monitor.sources_start_muted);
    assert_eq!(config.monitor.stall_grace_ms, 10_000);
    assert_eq!(config.monitor.snapshot_interval_ms, 50);
}

/// Verify all exported types are accessible
#[test]
fn public_api_accessible() {
    let _ = streamwatch::VERSION;
    let _ = streamwatch::ConnectionState::Idle;
    let _ = streamwatch::AlertKind::Recovery;
    let _ = streamwatch::LevelSample::default();
    let _ = streamwatch::Source::new("id", "name", "");
    let _ = streamwatch::server::ServerConfig::default();
    let _ = streamwatch::AlertLog::default();
}
