use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::MixSpec;

// =============================================================================
// DELIVERY PRESETS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputPreset {
    #[serde(rename = "Broadcast")]
    Broadcast,
    #[serde(rename = "YouTube")]
    YouTube,
    #[serde(rename = "Spotify")]
    Spotify,
    #[serde(rename = "Apple Music")]
    AppleMusic,
}

impl OutputPreset {
    pub fn all_presets() -> [OutputPreset; 4] {
        [
            OutputPreset::Broadcast,
            OutputPreset::YouTube,
            OutputPreset::Spotify,
            OutputPreset::AppleMusic,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutputPreset::Broadcast => "Broadcast",
            OutputPreset::YouTube => "YouTube",
            OutputPreset::Spotify => "Spotify",
            OutputPreset::AppleMusic => "Apple Music",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            OutputPreset::Broadcast => "EBU R128 broadcast delivery",
            OutputPreset::YouTube => "Optimized for streaming platforms",
            OutputPreset::Spotify => "Optimized for music streaming",
            OutputPreset::AppleMusic => "Sound Check normalized streaming",
        }
    }

    /// Case-insensitive lookup; spaces, dashes and underscores are ignored.
    pub fn from_name(name: &str) -> Option<OutputPreset> {
        let key: String = name
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '_'))
            .collect::<String>()
            .to_ascii_lowercase();
        Self::all_presets().into_iter().find(|p| {
            p.name()
                .chars()
                .filter(|c| *c != ' ')
                .collect::<String>()
                .to_ascii_lowercase()
                == key
        })
    }

    pub fn get_lufs_target(&self) -> f32 {
        match self {
            OutputPreset::Broadcast => -23.0,
            OutputPreset::YouTube => -14.0,
            OutputPreset::Spotify => -14.0,
            OutputPreset::AppleMusic => -16.0,
        }
    }

    pub fn get_true_peak_ceiling(&self) -> f32 {
        -1.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetValues {
    pub integrated_loudness: Option<f32>,
    pub true_peak_ceiling: Option<f32>,
}

static BAKED_IN: Lazy<PresetManager> = Lazy::new(PresetManager::new);

#[derive(Debug)]
pub struct PresetManager {
    presets: HashMap<String, PresetValues>,
}

impl PresetManager {
    /// Load presets from baked-in JSON. This is fallible but non-fatal.
    /// Falls back to the compiled-in table if parsing fails.
    pub fn new() -> Self {
        let presets_str = include_str!("../presets.json");
        Self::from_json(presets_str).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Option<Self> {
        match serde_json::from_str::<HashMap<String, PresetValues>>(json) {
            Ok(presets) => Some(Self { presets }),
            Err(e) => {
                log::warn!("preset table is malformed, using built-in values: {e}");
                None
            }
        }
    }

    /// Shared manager parsed once from the baked-in table.
    pub fn global() -> &'static PresetManager {
        &BAKED_IN
    }

    pub fn get_preset_values(&self, preset_name: &str) -> Option<&PresetValues> {
        self.presets.get(preset_name)
    }

    pub fn get_lufs_target(&self, preset: OutputPreset) -> f32 {
        self.get_preset_values(preset.name())
            .and_then(|values| values.integrated_loudness)
            .unwrap_or_else(|| preset.get_lufs_target())
    }

    pub fn get_true_peak_ceiling(&self, preset: OutputPreset) -> f32 {
        self.get_preset_values(preset.name())
            .and_then(|values| values.true_peak_ceiling)
            .unwrap_or_else(|| preset.get_true_peak_ceiling())
    }

    /// `spec` with the preset's target and ceiling.
    pub fn apply(&self, preset: OutputPreset, spec: MixSpec) -> MixSpec {
        MixSpec {
            target_lufs: self.get_lufs_target(preset),
            limiter_ceiling_db: self.get_true_peak_ceiling(preset),
            ..spec
        }
    }
}

impl Default for PresetManager {
    fn default() -> Self {
        let presets = OutputPreset::all_presets()
            .into_iter()
            .map(|p| {
                (
                    p.name().to_string(),
                    PresetValues {
                        integrated_loudness: Some(p.get_lufs_target()),
                        true_peak_ceiling: Some(p.get_true_peak_ceiling()),
                    },
                )
            })
            .collect();
        Self { presets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baked_in_table_matches_builtin() {
        let manager = PresetManager::new();
        for preset in OutputPreset::all_presets() {
            assert_eq!(manager.get_lufs_target(preset), preset.get_lufs_target());
            assert_eq!(
                manager.get_true_peak_ceiling(preset),
                preset.get_true_peak_ceiling()
            );
        }
    }

    #[test]
    fn test_malformed_json_falls_back() {
        assert!(PresetManager::from_json("{ not json").is_none());
        let fallback = PresetManager::default();
        assert_eq!(fallback.get_lufs_target(OutputPreset::Broadcast), -23.0);
    }

    #[test]
    fn test_from_name() {
        assert_eq!(OutputPreset::from_name("youtube"), Some(OutputPreset::YouTube));
        assert_eq!(
            OutputPreset::from_name("apple-music"),
            Some(OutputPreset::AppleMusic)
        );
        assert_eq!(
            OutputPreset::from_name("Apple Music"),
            Some(OutputPreset::AppleMusic)
        );
        assert_eq!(OutputPreset::from_name("tidal"), None);
    }

    #[test]
    fn test_apply_keeps_other_fields() {
        let spec = MixSpec {
            duck_depth_db: 9.0,
            ..MixSpec::default()
        };
        let applied = PresetManager::global().apply(OutputPreset::Broadcast, spec);
        assert_eq!(applied.target_lufs, -23.0);
        assert_eq!(applied.limiter_ceiling_db, -1.0);
        assert_eq!(applied.duck_depth_db, 9.0);
        assert!(applied.validate(48000).is_ok());
    }
}
