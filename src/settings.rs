use std::collections::HashMap;

use crate::config::NotificationDefaults;

/// Module name under which per-deployment overrides are stored.
pub const MODULE: &str = "gametables";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Registration,
    Cancellation,
    WaitingListPromotion,
}

impl Toggle {
    pub const ALL: [Toggle; 3] = [Toggle::Registration, Toggle::Cancellation, Toggle::WaitingListPromotion];

    pub fn name(&self) -> &'static str {
        match self {
            Toggle::Registration => "notify_on_registration",
            Toggle::Cancellation => "notify_on_cancellation",
            Toggle::WaitingListPromotion => "notify_waiting_list_promotion",
        }
    }

    /// Key inside the module settings, e.g. `notifications.notify_on_registration`.
    pub fn override_key(&self) -> String {
        format!("notifications.{}", self.name())
    }

    fn base_value(&self, base: &NotificationDefaults) -> Option<bool> {
        match self {
            Toggle::Registration => base.notify_on_registration,
            Toggle::Cancellation => base.notify_on_cancellation,
            Toggle::WaitingListPromotion => base.notify_waiting_list_promotion,
        }
    }
}

/// Returns the first defined value, or `default` when every source is unset.
pub fn first_defined<T: Copy>(sources: &[Option<T>], default: T) -> T {
    sources.iter().find_map(|value| *value).unwrap_or(default)
}

/// Per-deployment overrides, as stored in `module_settings` for [`MODULE`].
#[derive(Debug, Clone, Default)]
pub struct ModuleSettings {
    values: HashMap<String, String>,
}

impl ModuleSettings {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        let raw = self.values.get(key)?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => {
                log::warn!("ignoring module setting {}.{} with non-boolean value {:?}", MODULE, key, raw);
                None
            }
        }
    }
}

impl FromIterator<(String, String)> for ModuleSettings {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Resolves notification toggles: module override, then base config, then `true`.
#[derive(Debug, Clone, Default)]
pub struct SettingsReader {
    overrides: ModuleSettings,
    base: NotificationDefaults,
}

impl SettingsReader {
    pub fn new(overrides: ModuleSettings, base: NotificationDefaults) -> Self {
        Self { overrides, base }
    }

    /// Builds a reader from an override lookup that may have failed.
    /// A failed lookup leaves only the base config and defaults.
    pub fn with_fallback<E: std::fmt::Display>(overrides: Result<ModuleSettings, E>, base: NotificationDefaults) -> Self {
        let overrides = overrides.unwrap_or_else(|e| {
            log::warn!("module settings for {} unavailable, using base config: {}", MODULE, e);
            ModuleSettings::default()
        });
        Self::new(overrides, base)
    }

    pub fn is_enabled(&self, toggle: Toggle) -> bool {
        first_defined(
            &[self.overrides.get_bool(&toggle.override_key()), toggle.base_value(&self.base)],
            true,
        )
    }

    pub fn is_notify_on_registration_enabled(&self) -> bool {
        self.is_enabled(Toggle::Registration)
    }

    pub fn is_notify_on_cancellation_enabled(&self) -> bool {
        self.is_enabled(Toggle::Cancellation)
    }

    pub fn is_notify_waiting_list_promotion_enabled(&self) -> bool {
        self.is_enabled(Toggle::WaitingListPromotion)
    }
}
