// SettingsManager Service
// Loads and persists settings.json

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::models::Settings;

/// Manages application settings storage and retrieval
pub struct SettingsManager {
    settings_path: PathBuf,
    cache: RwLock<Option<Settings>>,
}

impl SettingsManager {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            settings_path: data_dir.join("settings.json"),
            cache: RwLock::new(None),
        }
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    /// Load settings from disk, writing defaults on first run.
    /// Fields added since the file was written are filled from defaults and saved back.
    pub fn load(&self) -> Result<Settings, String> {
        if let Ok(cache) = self.cache.read() {
            if let Some(settings) = cache.as_ref() {
                return Ok(settings.clone());
            }
        }

        let settings = if self.settings_path.exists() {
            let content = std::fs::read_to_string(&self.settings_path)
                .map_err(|e| format!("Failed to read settings: {e}"))?;
            let mut user_value: Value =
                serde_json::from_str(&content).map_err(|e| format!("Failed to parse settings: {e}"))?;

            let defaults_value = serde_json::to_value(Settings::default())
                .map_err(|e| format!("Failed to build default settings: {e}"))?;
            let changed = merge_missing_settings(&mut user_value, &defaults_value);

            let settings: Settings =
                serde_json::from_value(user_value).map_err(|e| format!("Failed to parse settings: {e}"))?;
            if changed {
                log::info!("Added missing settings fields to {}", self.settings_path.display());
                self.write(&settings)?;
            }
            settings
        } else {
            let defaults = Settings::default();
            self.write(&defaults)?;
            defaults
        };

        if let Ok(mut cache) = self.cache.write() {
            *cache = Some(settings.clone());
        }
        Ok(settings)
    }

    pub fn save(&self, settings: &Settings) -> Result<(), String> {
        self.write(settings)?;
        if let Ok(mut cache) = self.cache.write() {
            *cache = Some(settings.clone());
        }
        Ok(())
    }

    fn write(&self, settings: &Settings) -> Result<(), String> {
        if let Some(parent) = self.settings_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| format!("Failed to create settings directory: {e}"))?;
        }
        let content =
            serde_json::to_string_pretty(settings).map_err(|e| format!("Failed to serialize settings: {e}"))?;
        std::fs::write(&self.settings_path, content).map_err(|e| format!("Failed to write settings: {e}"))
    }
}

/// Recursively insert keys present in `defaults` but missing from `target`
fn merge_missing_settings(target: &mut Value, defaults: &Value) -> bool {
    match (target, defaults) {
        (Value::Object(target_map), Value::Object(defaults_map)) => {
            let mut changed = false;
            for (key, default_value) in defaults_map {
                match target_map.get_mut(key) {
                    Some(target_value) => {
                        if merge_missing_settings(target_value, default_value) {
                            changed = true;
                        }
                    }
                    None => {
                        target_map.insert(key.clone(), default_value.clone());
                        changed = true;
                    }
                }
            }
            changed
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_first_load_writes_defaults() {
        let temp = TempDir::new().unwrap();
        let manager = SettingsManager::new(temp.path());

        let settings = manager.load().unwrap();
        assert_eq!(settings.stop_grace_seconds, 10);
        assert!(manager.settings_path().exists());
    }

    #[test]
    fn test_missing_fields_are_merged_and_persisted() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("settings.json"),
            r#"{ "rtmpBaseUrl": "rtmp://localhost/live/" }"#,
        )
        .unwrap();

        let settings = SettingsManager::new(temp.path()).load().unwrap();
        assert_eq!(settings.rtmp_base_url, "rtmp://localhost/live/");
        assert_eq!(settings.backend_port, 8008);

        let on_disk: Value =
            serde_json::from_str(&std::fs::read_to_string(temp.path().join("settings.json")).unwrap()).unwrap();
        assert_eq!(on_disk["backendPort"], 8008);
    }

    #[test]
    fn test_save_updates_cache() {
        let temp = TempDir::new().unwrap();
        let manager = SettingsManager::new(temp.path());
        let mut settings = manager.load().unwrap();
        settings.stop_grace_seconds = 3;

        manager.save(&settings).unwrap();
        assert_eq!(manager.load().unwrap().stop_grace_seconds, 3);
    }

    #[test]
    fn test_merge_keeps_existing_values() {
        let mut target = json!({ "a": 1, "nested": { "x": true } });
        let defaults = json!({ "a": 0, "b": 2, "nested": { "x": false, "y": 1 } });

        assert!(merge_missing_settings(&mut target, &defaults));
        assert_eq!(target, json!({ "a": 1, "b": 2, "nested": { "x": true, "y": 1 } }));
        assert!(!merge_missing_settings(&mut target, &defaults));
    }
}
