#![deny(unsafe_code)]

/// Chat core of a companion client.
///
/// Model replies are interpreted into paced records, delivered on a timer into
/// the persisted history, and drawn through a windowed renderer.
pub mod chat;
/// Explicit wiring of store, collaborators and background tasks.
pub mod runtime;
/// Settings persistence.
pub mod settings;

pub use runtime::{ChatRuntime, RoundTicket, RuntimeError, RuntimeResult, ViewRegistry};
pub use settings::{ChatSettings, PersistenceSettings, SettingsError, SettingsStore};
