use std::str::FromStr;
use std::time::Duration;

/// Which backend drives installs. Decided once at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Simulated,
    Platform,
}

impl DeliveryMode {
    /// Debug builds simulate installs, release builds talk to the platform.
    pub fn from_build() -> Self {
        if cfg!(debug_assertions) {
            Self::Simulated
        } else {
            Self::Platform
        }
    }

    pub fn is_simulated(self) -> bool {
        matches!(self, Self::Simulated)
    }
}

impl FromStr for DeliveryMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sim" | "simulated" | "debug" => Ok(Self::Simulated),
            "platform" | "real" | "release" => Ok(Self::Platform),
            other => anyhow::bail!("unknown delivery mode: {}", other),
        }
    }
}

/// How long terminal states stay visible before the engine reverts to idle.
#[derive(Debug, Clone)]
pub struct ResetDelays {
    pub installed: Duration,
    pub failed: Duration,
    pub cancelled: Duration,
}

impl Default for ResetDelays {
    fn default() -> Self {
        Self {
            installed: Duration::from_millis(2000),
            failed: Duration::from_millis(3000),
            cancelled: Duration::from_millis(2000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulationScript {
    pub step: Duration,
    pub progress_steps: Vec<u8>,
}

impl Default for SimulationScript {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(500),
            progress_steps: vec![30, 60, 90],
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub mode: DeliveryMode,
    pub reset_delays: ResetDelays,
    pub simulation: SimulationScript,
}

impl DeliveryConfig {
    pub fn new(mode: DeliveryMode) -> Self {
        Self {
            mode,
            reset_delays: ResetDelays::default(),
            simulation: SimulationScript::default(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self::new(DeliveryMode::from_build())
    }
}
