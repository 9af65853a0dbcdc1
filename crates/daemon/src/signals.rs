//! Device signals read from the host.
//!
//! - encoder capability: `ffmpeg -encoders` must list libx265
//! - power: `/sys/class/power_supply`
//! - network: assumed from configuration

use crate::admission::{DeviceSignals, NetworkClass, PowerState};
use hevc_sweep_config::AdmissionConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// Encoder the sweep targets
pub const HEVC_ENCODER: &str = "libx265";

const DEFAULT_POWER_SUPPLY_DIR: &str = "/sys/class/power_supply";

/// Whether `ffmpeg -encoders` output lists `encoder`.
///
/// Encoder lines look like ` V....D libx265   libx265 H.265 / HEVC`; the
/// name is the second column.
pub fn has_encoder(encoders_output: &str, encoder: &str) -> bool {
    encoders_output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|name| name == encoder)
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// Read the power state from a sysfs power-supply directory.
///
/// Any online mains/USB supply means charging. Otherwise the first battery
/// decides: `Discharging` is unplugged, `Full` is full, `Charging` is
/// charging. A host with neither reports unknown.
pub fn read_power_state(power_supply_dir: &Path) -> PowerState {
    let entries = match fs::read_dir(power_supply_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %power_supply_dir.display(), error = %e, "no power supply information");
            return PowerState::Unknown;
        }
    };

    let mut supplies: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    supplies.sort();

    let mut battery_state = None;
    for supply in &supplies {
        let kind = read_trimmed(&supply.join("type")).unwrap_or_default();
        match kind.as_str() {
            "Mains" | "USB" => {
                if read_trimmed(&supply.join("online")).as_deref() == Some("1") {
                    return PowerState::Charging;
                }
            }
            "Battery" if battery_state.is_none() => {
                battery_state = match read_trimmed(&supply.join("status")).as_deref() {
                    Some("Discharging") => Some(PowerState::Unplugged),
                    Some("Full") => Some(PowerState::Full),
                    Some("Charging") => Some(PowerState::Charging),
                    _ => None,
                };
            }
            _ => {}
        }
    }

    battery_state.unwrap_or(PowerState::Unknown)
}

/// [`DeviceSignals`] backed by the running host.
#[derive(Debug, Clone)]
pub struct HostSignals {
    network: NetworkClass,
    power_supply_dir: PathBuf,
}

impl HostSignals {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            network: config.network.into(),
            power_supply_dir: PathBuf::from(DEFAULT_POWER_SUPPLY_DIR),
        }
    }

    pub fn with_power_supply_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.power_supply_dir = dir.into();
        self
    }
}

impl DeviceSignals for HostSignals {
    fn can_encode(&self) -> bool {
        let output = Command::new("ffmpeg")
            .args(["-hide_banner", "-encoders"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output();
        match output {
            Ok(output) if output.status.success() => {
                let found = has_encoder(&String::from_utf8_lossy(&output.stdout), HEVC_ENCODER);
                if !found {
                    warn!(encoder = HEVC_ENCODER, "ffmpeg lacks the HEVC encoder");
                }
                found
            }
            Ok(output) => {
                warn!(status = %output.status, "ffmpeg -encoders failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "could not run ffmpeg -encoders");
                false
            }
        }
    }

    fn network(&self) -> NetworkClass {
        self.network
    }

    fn power(&self) -> PowerState {
        read_power_state(&self.power_supply_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hevc_sweep_config::AssumedNetwork;
    use tempfile::TempDir;

    fn supply(base: &Path, name: &str, files: &[(&str, &str)]) {
        let dir = base.join(name);
        fs::create_dir_all(&dir).unwrap();
        for (file, contents) in files {
            fs::write(dir.join(file), format!("{}\n", contents)).unwrap();
        }
    }

    #[test]
    fn test_has_encoder() {
        let output = "Encoders:\n V..... = Video\n ------\n V....D libx264              libx264 H.264 / AVC\n V....D libx265              libx265 H.265 / HEVC\n A....D aac                  AAC\n";
        assert!(has_encoder(output, "libx265"));
        assert!(has_encoder(output, "aac"));
        assert!(!has_encoder(output, "libsvtav1"));
        assert!(!has_encoder("", "libx265"));
    }

    #[test]
    fn test_power_from_mains() {
        let temp = TempDir::new().unwrap();
        supply(temp.path(), "AC", &[("type", "Mains"), ("online", "1")]);
        supply(temp.path(), "BAT0", &[("type", "Battery"), ("status", "Discharging")]);
        assert_eq!(read_power_state(temp.path()), PowerState::Charging);
    }

    #[test]
    fn test_power_from_battery() {
        let temp = TempDir::new().unwrap();
        supply(temp.path(), "AC", &[("type", "Mains"), ("online", "0")]);
        supply(temp.path(), "BAT0", &[("type", "Battery"), ("status", "Discharging")]);
        assert_eq!(read_power_state(temp.path()), PowerState::Unplugged);

        fs::write(temp.path().join("BAT0").join("status"), "Full\n").unwrap();
        assert_eq!(read_power_state(temp.path()), PowerState::Full);
    }

    #[test]
    fn test_power_unknown() {
        let temp = TempDir::new().unwrap();
        assert_eq!(read_power_state(temp.path()), PowerState::Unknown);
        assert_eq!(read_power_state(&temp.path().join("missing")), PowerState::Unknown);

        supply(temp.path(), "BAT0", &[("type", "Battery"), ("status", "Not charging")]);
        assert_eq!(read_power_state(temp.path()), PowerState::Unknown);
    }

    #[test]
    fn test_host_signals_network_and_power() {
        let temp = TempDir::new().unwrap();
        supply(temp.path(), "BAT1", &[("type", "Battery"), ("status", "Discharging")]);

        let config = AdmissionConfig {
            network: AssumedNetwork::Metered,
            ..AdmissionConfig::default()
        };
        let signals = HostSignals::new(&config).with_power_supply_dir(temp.path());
        assert_eq!(signals.network(), NetworkClass::Metered);
        assert_eq!(signals.power(), PowerState::Unplugged);
    }
}
