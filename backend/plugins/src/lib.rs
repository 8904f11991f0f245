pub mod builtin;
pub mod event_bus;
pub mod health;
pub mod lifecycle;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod registry;
pub mod repository;

pub use builtin::{echo_descriptor, register_builtins, EchoPlugin, ECHO_ENTRY};
pub use event_bus::EventBus;
pub use health::HealthOptions;
pub use loader::{LoadedPlugin, PluginFactory, PluginLoader};
pub use manager::{AutoloadFailure, ManagerOptions, PluginManager, PluginManagerBuilder, StartReport};
pub use manifest::{PluginManifest, MANIFEST_FILE_NAME};
pub use registry::{PluginRegistry, RepositoryFailure, SyncReport};
pub use repository::{InlineRepository, LocalRepository, PluginRepository};
