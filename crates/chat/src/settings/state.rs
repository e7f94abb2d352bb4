use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use murmur_directive::{ExtractorPolicy, PacingPolicy};
use murmur_storage::DEFAULT_SAVE_DEBOUNCE;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::chat::{InteractionConfig, RenderConfig};

pub const SETTINGS_DIRECTORY_NAME: &str = "murmur";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SETTINGS_ENV_PREFIX: &str = "MURMUR_";
pub const DATABASE_FILE_NAME: &str = "chat.sqlite3";
pub const FALLBACK_DIRECTORY_NAME: &str = "snapshots";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    pub database_path: PathBuf,
    /// Directory of the JSON snapshot files used when sqlite cannot be written.
    pub fallback_dir: PathBuf,
    pub save_debounce_ms: u64,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            database_path: data_dir.join(DATABASE_FILE_NAME),
            fallback_dir: data_dir.join(FALLBACK_DIRECTORY_NAME),
            save_debounce_ms: DEFAULT_SAVE_DEBOUNCE.as_millis() as u64,
        }
    }
}

impl PersistenceSettings {
    /// Keeps every path under `root`. Used by tests and the replay binary.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            database_path: root.join(DATABASE_FILE_NAME),
            fallback_dir: root.join(FALLBACK_DIRECTORY_NAME),
            ..Self::default()
        }
    }

    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    pub render: RenderConfig,
    pub pacing: PacingPolicy,
    pub extractor: ExtractorPolicy,
    pub interaction: InteractionConfig,
    pub persistence: PersistenceSettings,
}

impl ChatSettings {
    pub fn normalized(mut self) -> Self {
        self.render.batch_size = self.render.batch_size.max(1);
        if !self.render.scroll_threshold_px.is_finite() || self.render.scroll_threshold_px < 0. {
            self.render.scroll_threshold_px = RenderConfig::default().scroll_threshold_px;
        }
        if !self.render.follow_tolerance_px.is_finite() || self.render.follow_tolerance_px < 0. {
            self.render.follow_tolerance_px = RenderConfig::default().follow_tolerance_px;
        }
        if !self.interaction.move_tolerance_px.is_finite() || self.interaction.move_tolerance_px < 0. {
            self.interaction.move_tolerance_px = InteractionConfig::default().move_tolerance_px;
        }
        if self.persistence.database_path.as_os_str().is_empty() {
            self.persistence.database_path = PersistenceSettings::default().database_path;
        }
        if self.persistence.fallback_dir.as_os_str().is_empty() {
            self.persistence.fallback_dir = PersistenceSettings::default().fallback_dir;
        }
        self
    }
}

/// Current settings plus their file on disk.
pub struct SettingsStore {
    settings: Arc<ArcSwap<ChatSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".murmur"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ChatSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> ChatSettings {
        let mut figment = Figment::from(Serialized::defaults(ChatSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }
        figment = figment.merge(Env::prefixed(SETTINGS_ENV_PREFIX).split("__"));

        match figment.extract::<ChatSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                ChatSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ChatSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".murmur"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SettingsStore::new(dir.path().join("settings.json"));
        let settings = store.settings();
        assert_eq!(settings.render.batch_size, 20);
        assert_eq!(settings.render.buffer_size, 15);
        assert_eq!(settings.pacing.paragraph_gap_ms, 800);
        assert_eq!(settings.interaction.long_press_ms, 500);
        assert!(settings.extractor.recover_unclosed_blocks);
        assert_eq!(settings.extractor.default_location_radius_m, None);
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{ "render": { "batch_size": 0 }, "pacing": { "line_gap_ms": 250 } }"#,
        )
        .expect("write settings");

        let settings = SettingsStore::new(path).settings();
        assert_eq!(settings.render.batch_size, 1);
        assert_eq!(settings.render.scroll_threshold_px, 150.);
        assert_eq!(settings.pacing.line_gap_ms, 250);
        assert_eq!(settings.pacing.paragraph_gap_ms, 800);
    }

    #[test]
    fn update_persists_and_reloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("settings.json");
        let store = SettingsStore::new(path.clone());

        let mut settings = (*store.settings()).clone();
        settings.extractor.default_location_radius_m = Some(300);
        settings.persistence = PersistenceSettings::rooted_at(dir.path());
        store.update(settings.clone()).expect("update");

        assert_eq!(*store.settings(), settings);
        assert!(!path.with_extension("json.tmp").exists());
        let reloaded = SettingsStore::new(path).settings();
        assert_eq!(*reloaded, settings);
    }
}
