//! Custom Resource Definitions for the hosted cluster operator

mod cluster;
mod providers;
mod types;

pub use cluster::{ManagedCluster, ManagedClusterSpec, ManagedClusterStatus};
pub use providers::{
    AksConfigSpec, AksNodePool, AliConfigSpec, AliNodePool, EksConfigSpec, EksNodeGroup,
    GkeConfigSpec, GkeNodePool, GkePrivateClusterConfig, ProviderConfig, ProviderKind,
};
pub use types::{Condition, ConditionStatus, ConditionType};
