pub mod allowlist;
pub mod meter;
pub mod sandbox;

pub use allowlist::{ApiAllowlist, ApiRule, RuleLevel};
pub use meter::{InvocationMeter, QuotaSnapshot, QuotaUsage};
pub use sandbox::ResourceSandbox;
