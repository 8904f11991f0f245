pub mod context;
pub mod error;
pub mod event;
pub mod limits;
pub mod traits;
pub mod types;

pub use context::{InvocationContext, InvocationGuard, Unrestricted};
pub use error::{LoadError, PluginError};
pub use event::{PluginEvent, PluginEventKind};
pub use limits::{Limit, ResourceLimits};
pub use traits::{CapabilityPlugin, Clock, HealthProbe, PluginInstance, SystemClock};
pub use types::{
    CapabilityDescriptor, DependencyKind, DependencySpec, HealthStatus, PluginDescriptor,
    PluginHealth, PluginId, PluginRecord, PluginStatus, ResourceKind, UsageStats,
};
