//! Ambient signal probes.
//!
//! A probe turns something observable on the host into background sensor
//! signals. Probes are injected into the [`BackgroundSensor`], so the
//! aggregation logic never touches the OS directly and tests can script
//! whatever they need.
//!
//! [`BackgroundSensor`]: crate::libs::background::BackgroundSensor

use crate::libs::background::{SensorKind, Signal};
use crate::libs::error::PresenceError;
use parking_lot::Mutex;
use sysinfo::{Networks, System};

/// A source of ambient signals polled by the sampling loop.
pub trait SignalProbe: Send + Sync {
    fn name(&self) -> &str;

    /// Takes one sample. An error skips this probe for the current cycle.
    fn sample(&self) -> Result<Vec<(SensorKind, Signal)>, PresenceError>;
}

/// Reports nothing. Used when system probing is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProbe;

impl SignalProbe for NullProbe {
    fn name(&self) -> &str {
        "null"
    }

    fn sample(&self) -> Result<Vec<(SensorKind, Signal)>, PresenceError> {
        Ok(Vec::new())
    }
}

/// CPU load above this percentage counts as someone using the machine.
const BUSY_CPU_PERCENT: f32 = 15.0;
/// Bytes moved between two samples above which the network counts as active.
const ACTIVE_NETWORK_BYTES: u64 = 64 * 1024;

struct SystemState {
    system: System,
    networks: Networks,
}

/// Coarse host activity heuristics built on `sysinfo`.
///
/// CPU usage is mapped to a raw system-activity level and traffic since the
/// previous sample to network active/idle.
pub struct SystemProbe {
    state: Mutex<SystemState>,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta; the first refresh only sets the baseline.
        system.refresh_cpu_usage();
        Self {
            state: Mutex::new(SystemState {
                system,
                networks: Networks::new_with_refreshed_list(),
            }),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps a CPU usage percentage to a presence level.
pub fn cpu_activity_level(cpu_percent: f32) -> f64 {
    if !cpu_percent.is_finite() {
        return 0.5;
    }
    let busy = (cpu_percent / BUSY_CPU_PERCENT).clamp(0.0, 1.0) as f64;
    0.2 + 0.6 * busy
}

impl SignalProbe for SystemProbe {
    fn name(&self) -> &str {
        "system"
    }

    fn sample(&self) -> Result<Vec<(SensorKind, Signal)>, PresenceError> {
        let mut state = self.state.lock();

        state.system.refresh_cpu_usage();
        let cpu = state.system.global_cpu_usage();

        state.networks.refresh(true);
        let moved: u64 = state
            .networks
            .iter()
            .map(|(_, data)| data.received().saturating_add(data.transmitted()))
            .sum();

        if state.system.cpus().is_empty() {
            return Err(PresenceError::ProbeFailed {
                probe: self.name().to_string(),
                reason: "no CPU information available".to_string(),
            });
        }

        let network = if moved >= ACTIVE_NETWORK_BYTES {
            Signal::NetworkActive
        } else {
            Signal::NetworkIdle
        };

        Ok(vec![
            (SensorKind::SystemActivity, Signal::Level(cpu_activity_level(cpu))),
            (SensorKind::Network, network),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_activity_level_range() {
        assert!((cpu_activity_level(0.0) - 0.2).abs() < 1e-9);
        assert!((cpu_activity_level(100.0) - 0.8).abs() < 1e-9);
        assert_eq!(cpu_activity_level(f32::NAN), 0.5);
    }

    #[test]
    fn test_null_probe_is_silent() {
        assert!(NullProbe.sample().unwrap().is_empty());
    }
}
