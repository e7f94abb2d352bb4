pub mod state;

pub use state::{ChatSettings, PersistenceSettings, SettingsError, SettingsStore};
