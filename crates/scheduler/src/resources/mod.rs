//! Admission control and live resource accounting.

mod manager;
mod sampler;
mod types;

pub use manager::ResourceManager;
pub use sampler::{HostSample, HostSampler, StaticSampler, UsageSampler};
pub use types::{
    CapacityCheck, ReservedTotals, ResourceEvent, ResourceRequirement, ResourceUsage,
    ThresholdKind,
};
