use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::model::{AppDescriptor, AppType, CardInfo};

pub const CONFIG_VERSION: u32 = 1;
pub const MAX_SLOTS: usize = 4;

const MIN_TIMEOUT_MS: u64 = 100;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ManagerConfigInput {
    pub version: u32,
    pub slot_count: Option<usize>,
    pub max_apps_per_card: Option<usize>,
    pub auto_activate_new_cards: Option<bool>,
    pub radio_on_at_start: Option<bool>,
    pub command_timeout_ms: Option<u64>,
    pub drain_timeout_ms: Option<u64>,
    pub tick_interval_ms: Option<u64>,
    pub preferences: PreferencesConfigInput,
    pub simulation: SimulationConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PreferencesConfigInput {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimulationConfigInput {
    pub reply_delay_ms: Option<u64>,
    pub reply_jitter_ms: Option<u64>,
    pub cards: Vec<SimCardInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimCardInput {
    pub slot: Option<usize>,
    pub icc_id: String,
    pub apps: Vec<SimAppInput>,
    pub fail_activation: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimAppInput {
    pub app_type: String,
    pub app_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimCardConfig {
    pub slot: usize,
    pub card: CardInfo,
    pub fail_activation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationConfig {
    pub reply_delay: Duration,
    pub reply_jitter: Duration,
    pub cards: Vec<SimCardConfig>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            reply_delay: Duration::from_millis(50),
            reply_jitter: Duration::ZERO,
            cards: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    pub version: u32,
    /// Number of logical subscription slots (and physical card slots).
    pub slot_count: usize,
    pub max_apps_per_card: usize,
    /// Activate the default application of a card the user has no
    /// preference for.
    pub auto_activate_new_cards: bool,
    /// Radio state assumed for every slot before the first radio event.
    pub radio_on_at_start: bool,
    /// Outstanding modem commands older than this fail with a generic failure.
    pub command_timeout: Duration,
    /// Data drains older than this are treated as complete.
    pub drain_timeout: Duration,
    /// How often the service checks timeouts.
    pub tick_interval: Duration,
    pub preferences_path: Option<PathBuf>,
    pub simulation: SimulationConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            slot_count: 2,
            max_apps_per_card: 8,
            auto_activate_new_cards: true,
            radio_on_at_start: true,
            command_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
            tick_interval: Duration::from_secs(1),
            preferences_path: None,
            simulation: SimulationConfig::default(),
        }
    }
}

impl ManagerConfigInput {
    pub fn resolve(self) -> Result<ManagerConfig, String> {
        let defaults = ManagerConfig::default();
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(format!("Unsupported config version {}", version));
        }

        let slot_count = self.slot_count.unwrap_or(defaults.slot_count);
        if slot_count == 0 || slot_count > MAX_SLOTS {
            return Err(format!(
                "slot_count must be between 1 and {MAX_SLOTS}, got {slot_count}"
            ));
        }

        let timeout = |value: Option<u64>, default: Duration| {
            Duration::from_millis(
                value
                    .unwrap_or(default.as_millis() as u64)
                    .max(MIN_TIMEOUT_MS),
            )
        };

        let simulation = self.simulation.resolve(slot_count)?;

        Ok(ManagerConfig {
            version,
            slot_count,
            max_apps_per_card: self
                .max_apps_per_card
                .unwrap_or(defaults.max_apps_per_card)
                .max(1),
            auto_activate_new_cards: self
                .auto_activate_new_cards
                .unwrap_or(defaults.auto_activate_new_cards),
            radio_on_at_start: self.radio_on_at_start.unwrap_or(defaults.radio_on_at_start),
            command_timeout: timeout(self.command_timeout_ms, defaults.command_timeout),
            drain_timeout: timeout(self.drain_timeout_ms, defaults.drain_timeout),
            tick_interval: timeout(self.tick_interval_ms, defaults.tick_interval),
            preferences_path: self.preferences.path.and_then(|p| {
                let trimmed = p.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(trimmed))
                }
            }),
            simulation,
        })
    }
}

impl SimulationConfigInput {
    fn resolve(self, slot_count: usize) -> Result<SimulationConfig, String> {
        let defaults = SimulationConfig::default();
        let mut used = HashSet::new();
        let mut cards = Vec::new();
        for (idx, card) in self.cards.into_iter().enumerate() {
            let slot = card.slot.unwrap_or(idx);
            if slot >= slot_count {
                return Err(format!(
                    "simulated card slot {slot} out of range for {slot_count} slots"
                ));
            }
            if !used.insert(slot) {
                continue;
            }
            let icc_id = card.icc_id.trim().to_string();
            if icc_id.is_empty() {
                continue;
            }
            let mut apps = Vec::with_capacity(card.apps.len());
            for app in card.apps {
                let app_type: AppType = app.app_type.parse()?;
                apps.push(AppDescriptor {
                    app_type,
                    app_id: app.app_id.trim().to_string(),
                });
            }
            cards.push(SimCardConfig {
                slot,
                card: CardInfo {
                    icc_id: Some(icc_id),
                    apps,
                },
                fail_activation: card.fail_activation,
            });
        }

        Ok(SimulationConfig {
            reply_delay: self
                .reply_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reply_delay),
            reply_jitter: self
                .reply_jitter_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reply_jitter),
            cards,
        })
    }
}

impl ManagerConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(ManagerConfig::default());
        }
        let parsed: ManagerConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))?;
        parsed.resolve()
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&text).map_err(anyhow::Error::msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_gives_defaults() {
        let cfg = ManagerConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, ManagerConfig::default());
        assert_eq!(cfg.slot_count, 2);
        assert!(cfg.auto_activate_new_cards);
    }

    #[test]
    fn parse_toml_config_basic() {
        let toml = r#"
            version = 1
            slot_count = 3
            command_timeout_ms = 5000
            drain_timeout_ms = 20
            auto_activate_new_cards = false

            [preferences]
            path = "/var/lib/strata/subscriptions.toml"

            [simulation]
            reply_delay_ms = 10

            [[simulation.cards]]
            icc_id = "8901260000000000001"
            apps = [{ app_type = "usim", app_id = "A0000000871002" }]

            [[simulation.cards]]
            slot = 2
            icc_id = "8901260000000000002"
            fail_activation = true
            apps = [
                { app_type = "CSIM", app_id = "A0000003431002" },
                { app_type = "USIM", app_id = "A0000000871002" },
            ]
        "#;

        let cfg = ManagerConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.slot_count, 3);
        assert_eq!(cfg.command_timeout, Duration::from_secs(5));
        assert_eq!(cfg.drain_timeout, Duration::from_millis(MIN_TIMEOUT_MS));
        assert!(!cfg.auto_activate_new_cards);
        assert_eq!(
            cfg.preferences_path.as_deref(),
            Some(Path::new("/var/lib/strata/subscriptions.toml"))
        );
        assert_eq!(cfg.simulation.reply_delay, Duration::from_millis(10));
        assert_eq!(cfg.simulation.cards.len(), 2);
        assert_eq!(cfg.simulation.cards[0].slot, 0);
        assert_eq!(cfg.simulation.cards[0].card.apps[0].app_type, AppType::Usim);
        assert_eq!(cfg.simulation.cards[1].slot, 2);
        assert!(cfg.simulation.cards[1].fail_activation);
        assert_eq!(cfg.simulation.cards[1].card.default_app_index(), Some(1));
    }

    #[test]
    fn rejects_bad_slot_count_and_version() {
        assert!(ManagerConfig::from_toml_str("slot_count = 0").is_err());
        assert!(ManagerConfig::from_toml_str("slot_count = 9").is_err());
        assert!(ManagerConfig::from_toml_str("version = 2").is_err());
    }

    #[test]
    fn rejects_card_outside_slots_and_bad_app_type() {
        let out_of_range = r#"
            slot_count = 1
            [[simulation.cards]]
            slot = 1
            icc_id = "89"
        "#;
        assert!(ManagerConfig::from_toml_str(out_of_range).is_err());

        let bad_type = r#"
            [[simulation.cards]]
            icc_id = "89"
            apps = [{ app_type = "ESIM", app_id = "A0" }]
        "#;
        assert!(ManagerConfig::from_toml_str(bad_type).is_err());
    }

    #[test]
    fn duplicate_and_blank_cards_are_skipped() {
        let toml = r#"
            [[simulation.cards]]
            slot = 0
            icc_id = "first"
            [[simulation.cards]]
            slot = 0
            icc_id = "second"
            [[simulation.cards]]
            slot = 1
            icc_id = "  "
        "#;
        let cfg = ManagerConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.simulation.cards.len(), 1);
        assert_eq!(cfg.simulation.cards[0].card.icc_id.as_deref(), Some("first"));
    }
}
