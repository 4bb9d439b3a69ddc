//! Raw property settings
//!
//! The sequencer accepts free-form `key=value` camera settings. Each key is
//! looked up in a per-role [`SettingTable`] and turned into a [`RawSetting`]
//! that the peer applies through [`crate::RawProperties`].

use serde::{Deserialize, Serialize};

use crate::error::{IndiError, IndiResult};

/// Standard camera property names
pub mod camera_properties {
    pub const CCD_MODE: &str = "CCD_MODE";
    pub const CCD_LOCAL_MODE: &str = "CCD_LOCAL_MODE";
    pub const CCD_LOCAL_MODE_PREFIX: &str = "PREFIX";
    pub const CCD_GAIN: &str = "CCD_GAIN";
    pub const CCD_OFFSET: &str = "CCD_OFFSET";
    pub const CCD_GAMMA: &str = "CCD_GAMMA";
    pub const CCD_TEMPERATURE: &str = "CCD_TEMPERATURE";
    pub const CCD_COOLER: &str = "CCD_COOLER";
    pub const CCD_FRAME_TYPE: &str = "CCD_FRAME_TYPE";
    pub const DSLR_APERTURE: &str = "DSLR_APERTURE";
    pub const DSLR_SHUTTER: &str = "DSLR_SHUTTER";
    pub const DSLR_ISO: &str = "DSLR_ISO";
}

/// A single property change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawSetting {
    NumericSet {
        property: String,
        item: String,
        value: f64,
    },
    SwitchSet {
        property: String,
        item: String,
    },
    TextSet {
        property: String,
        item: String,
        value: String,
    },
}

impl RawSetting {
    pub fn property(&self) -> &str {
        match self {
            RawSetting::NumericSet { property, .. }
            | RawSetting::SwitchSet { property, .. }
            | RawSetting::TextSet { property, .. } => property,
        }
    }
}

/// One option of a switch property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchOption {
    pub name: String,
    pub label: String,
}

impl SwitchOption {
    pub fn new(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
        }
    }

    /// Case-insensitive match against label or name
    pub fn matches(&self, value: &str) -> bool {
        self.label.eq_ignore_ascii_case(value) || self.name.eq_ignore_ascii_case(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Number,
    Switch,
    Text,
}

/// Where a sequencer key lands on the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingTarget {
    pub key: &'static str,
    pub property: &'static str,
    /// Item name, unused for switches where the option is chosen by value
    pub item: &'static str,
    pub kind: SettingKind,
}

impl SettingTarget {
    /// Build the property change for `value`.
    ///
    /// Switch values are matched against the peer's options; Ok(None) means
    /// no option matched and nothing should be sent.
    pub fn resolve(
        &self,
        value: &str,
        options: Option<&[SwitchOption]>,
    ) -> IndiResult<Option<RawSetting>> {
        match self.kind {
            SettingKind::Number => {
                let number = value.trim().parse::<f64>().map_err(|_| IndiError::InvalidValue {
                    device: String::new(),
                    property: self.property.to_string(),
                    value: value.to_string(),
                })?;
                Ok(Some(RawSetting::NumericSet {
                    property: self.property.to_string(),
                    item: self.item.to_string(),
                    value: number,
                }))
            }
            SettingKind::Text => Ok(Some(RawSetting::TextSet {
                property: self.property.to_string(),
                item: self.item.to_string(),
                value: value.to_string(),
            })),
            SettingKind::Switch => Ok(options
                .unwrap_or_default()
                .iter()
                .find(|option| option.matches(value))
                .map(|option| RawSetting::SwitchSet {
                    property: self.property.to_string(),
                    item: option.name.clone(),
                })),
        }
    }
}

/// Per-role mapping of sequencer keys to peer properties
#[derive(Debug, Clone)]
pub struct SettingTable {
    entries: Vec<SettingTarget>,
}

impl SettingTable {
    /// Camera controls reachable from a sequence
    pub fn camera() -> Self {
        use camera_properties::*;
        let entry = |key, property, item, kind| SettingTarget {
            key,
            property,
            item,
            kind,
        };
        Self {
            entries: vec![
                entry("mode", CCD_MODE, "", SettingKind::Switch),
                entry("name", CCD_LOCAL_MODE, CCD_LOCAL_MODE_PREFIX, SettingKind::Text),
                entry("gain", CCD_GAIN, "GAIN", SettingKind::Number),
                entry("offset", CCD_OFFSET, "OFFSET", SettingKind::Number),
                entry("gamma", CCD_GAMMA, "GAMMA", SettingKind::Number),
                entry("temperature", CCD_TEMPERATURE, "TEMPERATURE", SettingKind::Number),
                entry("cooler", CCD_COOLER, "", SettingKind::Switch),
                entry("frame", CCD_FRAME_TYPE, "", SettingKind::Switch),
                entry("aperture", DSLR_APERTURE, "", SettingKind::Switch),
                entry("shutter", DSLR_SHUTTER, "", SettingKind::Switch),
                entry("iso", DSLR_ISO, "", SettingKind::Switch),
            ],
        }
    }

    /// Case-insensitive key lookup
    pub fn lookup(&self, key: &str) -> Option<&SettingTarget> {
        self.entries
            .iter()
            .find(|entry| entry.key.eq_ignore_ascii_case(key))
    }

    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|entry| entry.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let table = SettingTable::camera();
        let target = table.lookup("GAIN").unwrap();
        assert_eq!(target.property, camera_properties::CCD_GAIN);
        assert!(table.lookup("focus").is_none());
    }

    #[test]
    fn test_resolve_number() {
        let table = SettingTable::camera();
        let setting = table.lookup("temperature").unwrap().resolve("-10.5", None).unwrap();
        assert_eq!(
            setting,
            Some(RawSetting::NumericSet {
                property: "CCD_TEMPERATURE".to_string(),
                item: "TEMPERATURE".to_string(),
                value: -10.5,
            })
        );
        assert!(table.lookup("gain").unwrap().resolve("high", None).is_err());
    }

    #[test]
    fn test_resolve_switch_by_label_or_name() {
        let table = SettingTable::camera();
        let options = vec![
            SwitchOption::new("LIGHT", "Light"),
            SwitchOption::new("DARK", "Dark"),
            SwitchOption::new("FLAT", "Flat field"),
        ];
        let frame = table.lookup("frame").unwrap();
        let by_label = frame.resolve("flat field", Some(&options)).unwrap();
        assert_eq!(
            by_label,
            Some(RawSetting::SwitchSet {
                property: "CCD_FRAME_TYPE".to_string(),
                item: "FLAT".to_string(),
            })
        );
        let by_name = frame.resolve("dark", Some(&options)).unwrap().unwrap();
        assert_eq!(by_name.property(), "CCD_FRAME_TYPE");
        assert_eq!(frame.resolve("bias", Some(&options)).unwrap(), None);
    }
}
