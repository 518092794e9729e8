//! Board-specific callouts
//!
//! Presence checks, chassis intrusion, FRU power and host actions differ per
//! platform. The daemon only sees them through [`BoardCallouts`];
//! [`CommandCallouts`] maps each one to an optional shell command template.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::hw::{render_template, SensorIo};

/// Answer of a board sensor-validity check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// The sensor must be ignored this tick
    Invalid,
    Valid,
    /// Read normally, but never escalate its read failures
    NotApplicable,
}

impl Validity {
    /// Board helpers answer -1, 0 or 1
    pub fn from_code(code: i64) -> Self {
        match code {
            c if c < 0 => Validity::NotApplicable,
            0 => Validity::Invalid,
            _ => Validity::Valid,
        }
    }
}

#[cfg_attr(any(test, feature = "test-utils"), mockall::automock)]
pub trait BoardCallouts: Send {
    fn fan_dead(&self, fan_id: &str, label: &str);

    fn fan_recovered(&self, fan_id: &str, label: &str);

    fn sensor_valid_check(&self, board: &str, sensor: &str, rule: &str, attribute: &str) -> Validity;

    fn chassis_intrusion_tripped(&self) -> bool;

    /// Whether FRU power is on
    fn host_power_status(&self) -> bool;

    /// Every M.2 slot is powered off, so missing devices are expected
    fn all_slots_power_off(&self) -> bool;

    /// Request a host-level action such as `host_shutdown`; returns whether it was carried out
    fn host_action(&self, action: &str, cause: &str) -> bool;
}

/// Neutral answers: everything valid, no intrusion, power on
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCallouts;

impl BoardCallouts for NoopCallouts {
    fn fan_dead(&self, _fan_id: &str, _label: &str) {}

    fn fan_recovered(&self, _fan_id: &str, _label: &str) {}

    fn sensor_valid_check(&self, _board: &str, _sensor: &str, _rule: &str, _attribute: &str) -> Validity {
        Validity::Valid
    }

    fn chassis_intrusion_tripped(&self) -> bool {
        false
    }

    fn host_power_status(&self) -> bool {
        true
    }

    fn all_slots_power_off(&self) -> bool {
        false
    }

    fn host_action(&self, action: &str, cause: &str) -> bool {
        warn!("ACTION: {} requested ({}) but no host action handler is configured", action, cause);
        false
    }
}

/// Command templates for each callout
///
/// Placeholders: `{fan}` `{label}` for fan callouts, `{board}` `{sensor}`
/// `{rule}` `{attribute}` for validity checks, `{action}` `{cause}` for host
/// actions. An unset template behaves like [`NoopCallouts`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalloutCommands {
    #[serde(default)]
    pub fan_dead: Option<String>,
    #[serde(default)]
    pub fan_recovered: Option<String>,
    #[serde(default)]
    pub sensor_valid_check: Option<String>,
    #[serde(default)]
    pub chassis_intrusion: Option<String>,
    #[serde(default)]
    pub host_power_status: Option<String>,
    #[serde(default)]
    pub all_slots_power_off: Option<String>,
    #[serde(default)]
    pub host_action: Option<String>,
}

pub struct CommandCallouts {
    io: Arc<dyn SensorIo>,
    commands: CalloutCommands,
}

impl CommandCallouts {
    pub fn new(io: Arc<dyn SensorIo>, commands: CalloutCommands) -> Self {
        Self { io, commands }
    }

    fn run(&self, template: &str, vars: &[(&str, &str)]) -> Option<String> {
        let command = render_template(template, vars);
        match self.io.run_command(&command) {
            Ok(stdout) => Some(stdout),
            Err(e) => {
                warn!("Board callout failed: {}", e);
                None
            }
        }
    }
}

fn truthy(stdout: &str) -> bool {
    matches!(stdout.trim().to_ascii_lowercase().as_str(), "1" | "on" | "true" | "yes")
}

impl BoardCallouts for CommandCallouts {
    fn fan_dead(&self, fan_id: &str, label: &str) {
        if let Some(template) = &self.commands.fan_dead {
            self.run(template, &[("fan", fan_id), ("label", label)]);
        }
    }

    fn fan_recovered(&self, fan_id: &str, label: &str) {
        if let Some(template) = &self.commands.fan_recovered {
            self.run(template, &[("fan", fan_id), ("label", label)]);
        }
    }

    fn sensor_valid_check(&self, board: &str, sensor: &str, rule: &str, attribute: &str) -> Validity {
        let Some(template) = &self.commands.sensor_valid_check else {
            return Validity::Valid;
        };
        let vars = [("board", board), ("sensor", sensor), ("rule", rule), ("attribute", attribute)];
        match self.run(template, &vars) {
            Some(stdout) => match stdout.trim().parse::<i64>() {
                Ok(code) => Validity::from_code(code),
                Err(_) => {
                    warn!("Unexpected validity answer {:?} for {}:{}", stdout.trim(), board, sensor);
                    Validity::Invalid
                }
            },
            // A check that cannot run must not let a possibly bogus reading through
            None => Validity::Invalid,
        }
    }

    fn chassis_intrusion_tripped(&self) -> bool {
        match &self.commands.chassis_intrusion {
            Some(template) => self.run(template, &[]).map_or(false, |out| truthy(&out)),
            None => false,
        }
    }

    fn host_power_status(&self) -> bool {
        match &self.commands.host_power_status {
            // Unknown power state is treated as on so control continues
            Some(template) => self.run(template, &[]).map_or(true, |out| truthy(&out)),
            None => true,
        }
    }

    fn all_slots_power_off(&self) -> bool {
        match &self.commands.all_slots_power_off {
            Some(template) => self.run(template, &[]).map_or(false, |out| truthy(&out)),
            None => false,
        }
    }

    fn host_action(&self, action: &str, cause: &str) -> bool {
        match &self.commands.host_action {
            Some(template) => {
                info!("ACTION: {} ({})", action, cause);
                self.run(template, &[("action", action), ("cause", cause)]).is_some()
            }
            None => NoopCallouts.host_action(action, cause),
        }
    }
}
