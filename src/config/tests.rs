//! Unit tests for configuration module
//!
//! Parsing, validation and file handling.

use super::*;
use anyhow::Result;
use std::fs;
use tempfile::tempdir;

#[test]
fn test_default_configuration_is_valid() {
    let config = BackendConfig::default();

    assert_eq!(config.backends.enabled, vec![BackendKind::Headless]);
    assert_eq!(config.headless.outputs, 1);
    assert_eq!(config.globals.destroy_delay(), Duration::from_millis(5000));
    assert_eq!(config.libinput.seat, "seat0");
    assert!(config.validate().is_ok());
}

#[test]
fn test_configuration_from_file() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("backends.toml");

    let test_config = r#"
[backends]
enabled = ["drm", "libinput"]

[drm]
devices = ["/dev/dri/card0", "/dev/dri/card1"]

[libinput]
seat = "seat1"

[globals]
destroy_delay_ms = 2500
"#;
    fs::write(&file_path, test_config)?;

    let config = BackendConfig::load(&file_path)?;
    assert_eq!(config.backends.enabled, vec![BackendKind::Drm, BackendKind::Libinput]);
    assert_eq!(config.drm.devices.len(), 2);
    assert_eq!(config.libinput.seat, "seat1");
    assert_eq!(config.globals.destroy_delay(), Duration::from_millis(2500));

    // Sections left out keep their defaults
    assert_eq!(config.headless, HeadlessConfig::default());
    assert!(!config.general.debug);

    Ok(())
}

#[test]
fn test_headless_input_devices_parse() -> Result<()> {
    let config: BackendConfig = toml::from_str(
        r#"
[headless]
outputs = 2
width = 1280
height = 720
refresh_mhz = 144000
input_devices = ["keyboard", "tablet-pad"]
"#,
    )?;
    assert_eq!(config.headless.outputs, 2);
    assert_eq!(
        config.headless.input_devices,
        vec![InputDeviceType::Keyboard, InputDeviceType::TabletPad]
    );
    config.validate()?;
    Ok(())
}

#[test]
fn test_invalid_configurations_are_rejected() {
    let mut config = BackendConfig::default();
    config.backends.enabled.clear();
    assert!(config.validate().is_err());

    let mut config = BackendConfig::default();
    config.backends.enabled = vec![BackendKind::Headless, BackendKind::Headless];
    assert!(config.validate().is_err());

    let mut config = BackendConfig::default();
    config.headless.width = 0;
    assert!(config.validate().is_err());

    let mut config = BackendConfig::default();
    config.headless.refresh_mhz = 0;
    assert!(config.validate().is_err());

    let mut config = BackendConfig::default();
    config.drm.devices = vec![PathBuf::from("/dev/input/event3")];
    assert!(config.validate().is_err());

    let mut config = BackendConfig::default();
    config.libinput.seat = "  ".to_string();
    assert!(config.validate().is_err());

    let mut config = BackendConfig::default();
    config.globals.destroy_delay_ms = MAX_DESTROY_DELAY_MS + 1;
    assert!(config.validate().is_err());
}

#[test]
fn test_unknown_backend_kind_fails_to_parse() {
    let result: std::result::Result<BackendConfig, _> = toml::from_str(
        r#"
[backends]
enabled = ["x11"]
"#,
    );
    assert!(result.is_err());
}

#[test]
fn test_load_reports_missing_file() {
    let dir = tempdir().unwrap();
    let err = BackendConfig::load(dir.path().join("missing.toml")).unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[test]
fn test_load_rejects_invalid_values() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("bad.toml");
    fs::write(&file_path, "[headless]\noutputs = 1\nwidth = 0\nheight = 600\nrefresh_mhz = 60000\n")?;
    assert!(BackendConfig::load(&file_path).is_err());
    Ok(())
}

#[test]
fn test_save_and_reload() -> Result<()> {
    let dir = tempdir()?;
    let file_path = dir.path().join("saved.toml");

    let mut config = BackendConfig::default();
    config.backends.enabled = vec![BackendKind::Headless, BackendKind::Drm];
    config.drm.devices = vec![PathBuf::from("/dev/dri/card0")];
    config.general.debug = true;
    config.save(&file_path)?;

    let reloaded = BackendConfig::load(&file_path)?;
    assert_eq!(reloaded, config);
    Ok(())
}
