//! Firmware update selection logic.
//!
//! The actual flashing (boot ROM protocol, image format) lives behind
//! [`FirmwareFlasher`]. This module decides which images to try and whether
//! flashing is needed at all.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::LinkConfig;
use crate::error::{LinkError, Result};
use crate::protocol::FwVersion;

/// Directory prefix of every firmware image name.
pub const FIRMWARE_DIR: &str = "qorvo/";

/// A loaded firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub name: String,
    /// Version embedded in the image, when it carries one.
    pub version: Option<FwVersion>,
    pub data: Vec<u8>,
}

/// Loads and flashes firmware images.
pub trait FirmwareFlasher: Send + Sync {
    fn load(&self, name: &str) -> Option<FirmwareImage>;

    fn flash(&self, image: &FirmwareImage) -> Result<()>;
}

/// Result of a firmware update request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Updates are switched off by configuration.
    Disabled,
    /// No usable image was found.
    NotFound,
    /// The running firmware already matches the image.
    UpToDate,
    Flashed,
}

impl fmt::Display for UpdateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateOutcome::Disabled => write!(f, "disabled"),
            UpdateOutcome::NotFound => write!(f, "no image found"),
            UpdateOutcome::UpToDate => write!(f, "up to date"),
            UpdateOutcome::Flashed => write!(f, "flashed"),
        }
    }
}

/// Image names to try for a device id, most specific first.
pub fn candidate_images(device_id: u16) -> Vec<String> {
    let variant = match device_id {
        0x420 => Some(("7xx", "b0")),
        0x430 => Some(("7xx", "c0")),
        0x440 => Some(("8xx", "a0")),
        _ => None,
    };
    let mut names = Vec::new();
    if let Some((series, rev)) = variant {
        names.push(format!("{FIRMWARE_DIR}qm35{series}_{rev}_prod.bin"));
        names.push(format!("{FIRMWARE_DIR}qm35{series}_{rev}.bin"));
        names.push(format!("{FIRMWARE_DIR}qm35{series}_prod.bin"));
        names.push(format!("{FIRMWARE_DIR}qm35{series}.bin"));
    }
    names.push(format!("{FIRMWARE_DIR}qm35_prod.bin"));
    names.push(format!("{FIRMWARE_DIR}qm35.bin"));
    names
}

/// Try one image.
fn update_single(
    flasher: &dyn FirmwareFlasher,
    current: Option<&FwVersion>,
    name: &str,
    force: bool,
) -> Result<UpdateOutcome> {
    let Some(image) = flasher.load(name) else {
        return Ok(UpdateOutcome::NotFound);
    };
    match &image.version {
        Some(version) => info!(name, %version, "Loaded firmware"),
        None if force => info!(name, "Loaded firmware without version"),
        None => {
            info!(name, "Loaded firmware version not found, no upgrade");
            return Ok(UpdateOutcome::NotFound);
        }
    }
    if !force
        && let (Some(version), Some(current)) = (&image.version, current)
        && !version.differs(current)
    {
        info!(%version, "Running firmware is identical, no upgrade");
        return Ok(UpdateOutcome::UpToDate);
    }
    flasher.flash(&image)?;
    info!(name, "Firmware flashed");
    Ok(UpdateOutcome::Flashed)
}

/// Pick and flash firmware.
///
/// An explicit `name` wins over `config.fw_name`, which wins over the list
/// derived from `device_id`. Candidates are tried until one is found; once a
/// flashing attempt failed, later ones are forced.
pub fn update(
    flasher: &dyn FirmwareFlasher,
    config: &LinkConfig,
    current: Option<&FwVersion>,
    device_id: u16,
    name: Option<&str>,
) -> Result<UpdateOutcome> {
    if config.no_fw_update {
        info!("Firmware upgrade disabled by configuration");
        return Ok(UpdateOutcome::Disabled);
    }

    let mut force = config.force_fw_update || current.is_none();
    if force {
        let cause = if config.force_fw_update {
            "configuration"
        } else {
            "firmware version not available"
        };
        warn!(cause, "Firmware upgrade forced");
    }

    let explicit = name.or(config.fw_name.as_deref().filter(|n| !n.is_empty()));
    let candidates = match explicit {
        Some(name) => vec![name.to_string()],
        None => candidate_images(device_id),
    };

    let mut result = Ok(UpdateOutcome::NotFound);
    for candidate in &candidates {
        result = update_single(flasher, current, candidate, force);
        match &result {
            Err(LinkError::Cancelled) => break,
            Err(e) => {
                warn!(name = %candidate, error = %e, "Flashing failed");
                force = true;
            }
            Ok(UpdateOutcome::NotFound) => {}
            Ok(_) => break,
        }
    }

    match &result {
        Ok(UpdateOutcome::NotFound) => {
            warn!("Firmware upgrade failed (file not found or not containing a version)")
        }
        Err(e) => warn!(error = %e, "Firmware upgrade failed"),
        Ok(_) => {}
    }
    result
}

/// Flasher without any image.
pub struct NoFirmware;

impl FirmwareFlasher for NoFirmware {
    fn load(&self, _name: &str) -> Option<FirmwareImage> {
        None
    }

    fn flash(&self, _image: &FirmwareImage) -> Result<()> {
        Err(LinkError::NotFound)
    }
}

type FlashHook = Box<dyn Fn(&FirmwareImage) + Send + Sync>;

/// In-memory image store.
///
/// Records every flashed image; a hook can make the "device" pick up the
/// new version.
#[derive(Default)]
pub struct ImageLibrary {
    images: Mutex<HashMap<String, FirmwareImage>>,
    flashed: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<LinkError>>,
    hook: Option<FlashHook>,
}

impl ImageLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `hook` after every successful flash.
    pub fn with_hook<F>(hook: F) -> Self
    where
        F: Fn(&FirmwareImage) + Send + Sync + 'static,
    {
        Self {
            hook: Some(Box::new(hook)),
            ..Self::default()
        }
    }

    pub fn add(&self, name: &str, version: Option<FwVersion>, data: Vec<u8>) {
        self.images.lock().insert(
            name.to_string(),
            FirmwareImage {
                name: name.to_string(),
                version,
                data,
            },
        );
    }

    /// Make the next flash attempt fail with `error`.
    pub fn queue_failure(&self, error: LinkError) {
        self.failures.lock().push_back(error);
    }

    /// Names of the images flashed so far.
    pub fn flashed(&self) -> Vec<String> {
        self.flashed.lock().clone()
    }
}

impl FirmwareFlasher for ImageLibrary {
    fn load(&self, name: &str) -> Option<FirmwareImage> {
        self.images.lock().get(name).cloned()
    }

    fn flash(&self, image: &FirmwareImage) -> Result<()> {
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        self.flashed.lock().push(image.name.clone());
        if let Some(hook) = &self.hook {
            hook(image);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(major: u8) -> FwVersion {
        FwVersion {
            major,
            ..Default::default()
        }
    }

    fn config() -> LinkConfig {
        LinkConfig::fast()
    }

    #[test]
    fn test_candidates_by_device_id() {
        let names = candidate_images(0x440);
        assert_eq!(names.len(), 6);
        assert_eq!(names[0], "qorvo/qm358xx_a0_prod.bin");
        assert_eq!(names[3], "qorvo/qm358xx.bin");
        assert_eq!(candidate_images(0x430)[1], "qorvo/qm357xx_c0.bin");
        assert_eq!(
            candidate_images(0x999),
            vec!["qorvo/qm35_prod.bin".to_string(), "qorvo/qm35.bin".to_string()]
        );
    }

    #[test]
    fn test_disabled() {
        let lib = ImageLibrary::new();
        let config = LinkConfig {
            no_fw_update: true,
            ..config()
        };
        let outcome = update(&lib, &config, None, 0x440, None).unwrap();
        assert_eq!(outcome, UpdateOutcome::Disabled);
    }

    #[test]
    fn test_same_version_is_up_to_date() {
        let lib = ImageLibrary::new();
        lib.add("qorvo/qm358xx.bin", Some(version(1)), vec![0; 4]);
        let current = version(1);
        let outcome = update(&lib, &config(), Some(&current), 0x440, None).unwrap();
        assert_eq!(outcome, UpdateOutcome::UpToDate);
        assert!(lib.flashed().is_empty());
    }

    #[test]
    fn test_unknown_version_forces_flash() {
        let lib = ImageLibrary::new();
        lib.add("qorvo/qm35.bin", Some(version(1)), vec![0; 4]);
        let outcome = update(&lib, &config(), None, 0x440, None).unwrap();
        assert_eq!(outcome, UpdateOutcome::Flashed);
        assert_eq!(lib.flashed(), vec!["qorvo/qm35.bin".to_string()]);
    }

    #[test]
    fn test_failure_forces_next_candidates() {
        let lib = ImageLibrary::new();
        lib.add("qorvo/qm358xx_a0_prod.bin", Some(version(2)), vec![1]);
        lib.add("qorvo/qm358xx.bin", Some(version(1)), vec![2]);
        lib.queue_failure(LinkError::Timeout);
        let current = version(1);
        // Same version as the running one, but flashed anyway after the failure.
        let outcome = update(&lib, &config(), Some(&current), 0x440, None).unwrap();
        assert_eq!(outcome, UpdateOutcome::Flashed);
        assert_eq!(lib.flashed(), vec!["qorvo/qm358xx.bin".to_string()]);
    }

    #[test]
    fn test_cancel_stops_immediately() {
        let lib = ImageLibrary::new();
        lib.add("qorvo/qm35_prod.bin", Some(version(2)), vec![1]);
        lib.add("qorvo/qm35.bin", Some(version(2)), vec![1]);
        lib.queue_failure(LinkError::Cancelled);
        let result = update(&lib, &config(), None, 0, None);
        assert!(matches!(result, Err(LinkError::Cancelled)));
        assert!(lib.flashed().is_empty());
    }

    #[test]
    fn test_explicit_name_wins() {
        let lib = ImageLibrary::new();
        lib.add("custom.bin", None, vec![1]);
        lib.add("qorvo/qm35.bin", Some(version(3)), vec![1]);
        let config = LinkConfig {
            fw_name: Some("qorvo/qm35.bin".into()),
            ..config()
        };
        let current = version(1);
        let outcome = update(&lib, &config, Some(&current), 0, Some("custom.bin")).unwrap();
        // No version in the image and not forced.
        assert_eq!(outcome, UpdateOutcome::NotFound);

        let outcome = update(&lib, &config, Some(&current), 0, None).unwrap();
        assert_eq!(outcome, UpdateOutcome::Flashed);
    }
}
