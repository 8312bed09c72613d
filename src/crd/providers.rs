//! Hosted provider configuration carried on a ManagedCluster
//!
//! Each variant mirrors the spec of the provider's own config resource
//! (e.g. `AKSClusterConfig`). The serialized form of a variant is exactly what
//! gets written to, and compared against, that resource's `spec`.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Hosted Kubernetes providers reconciled by this operator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProviderKind {
    /// Azure Kubernetes Service
    Aks,
    /// Amazon Elastic Kubernetes Service
    Eks,
    /// Google Kubernetes Engine
    Gke,
    /// Alibaba Cloud Container Service for Kubernetes
    Alibaba,
}

impl ProviderKind {
    /// Every supported provider
    pub const ALL: [ProviderKind; 4] = [Self::Aks, Self::Eks, Self::Gke, Self::Alibaba];

    /// Driver identity recorded in `status.driver`
    pub fn driver_name(&self) -> &'static str {
        match self {
            Self::Aks => "AKS",
            Self::Eks => "EKS",
            Self::Gke => "GKE",
            Self::Alibaba => "Alibaba",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aks => write!(f, "aks"),
            Self::Eks => write!(f, "eks"),
            Self::Gke => write!(f, "gke"),
            Self::Alibaba => write!(f, "alibaba"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "aks" => Ok(Self::Aks),
            "eks" => Ok(Self::Eks),
            "gke" => Ok(Self::Gke),
            "alibaba" | "ali" => Ok(Self::Alibaba),
            _ => Err(format!("unknown provider: {}", s)),
        }
    }
}

/// Provider-specific cluster configuration; at most one per cluster
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ProviderConfig {
    /// AKS cluster configuration
    AksConfig(AksConfigSpec),
    /// EKS cluster configuration
    EksConfig(EksConfigSpec),
    /// GKE cluster configuration
    GkeConfig(GkeConfigSpec),
    /// Alibaba ACK cluster configuration
    AliConfig(AliConfigSpec),
}

impl ProviderConfig {
    /// Provider this configuration belongs to
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::AksConfig(_) => ProviderKind::Aks,
            Self::EksConfig(_) => ProviderKind::Eks,
            Self::GkeConfig(_) => ProviderKind::Gke,
            Self::AliConfig(_) => ProviderKind::Alibaba,
        }
    }

    /// Whether the cluster was imported rather than created by the provider operator
    pub fn imported(&self) -> bool {
        match self {
            Self::AksConfig(c) => c.imported,
            Self::EksConfig(c) => c.imported,
            Self::GkeConfig(c) => c.imported,
            Self::AliConfig(c) => c.imported,
        }
    }

    /// Provider credential secret reference (`namespace:name`)
    pub fn credential_secret(&self) -> &str {
        match self {
            Self::AksConfig(c) => &c.azure_credential_secret,
            Self::EksConfig(c) => &c.amazon_credential_secret,
            Self::GkeConfig(c) => &c.google_credential_secret,
            Self::AliConfig(c) => &c.alibaba_credential_secret,
        }
    }

    /// The inner spec as a JSON value, the shape stored in the config resource
    pub fn spec_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::AksConfig(c) => serde_json::to_value(c),
            Self::EksConfig(c) => serde_json::to_value(c),
            Self::GkeConfig(c) => serde_json::to_value(c),
            Self::AliConfig(c) => serde_json::to_value(c),
        }
    }

    /// Parse a config resource `spec` back into the variant for `kind`
    pub fn from_spec_value(
        kind: ProviderKind,
        spec: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            ProviderKind::Aks => Self::AksConfig(serde_json::from_value(spec)?),
            ProviderKind::Eks => Self::EksConfig(serde_json::from_value(spec)?),
            ProviderKind::Gke => Self::GkeConfig(serde_json::from_value(spec)?),
            ProviderKind::Alibaba => Self::AliConfig(serde_json::from_value(spec)?),
        })
    }
}

/// AKS cluster configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AksConfigSpec {
    /// Name of the cluster in Azure
    pub cluster_name: String,
    /// Azure resource group
    pub resource_group: String,
    /// Azure region
    pub resource_location: String,
    /// Imported rather than created
    #[serde(default)]
    pub imported: bool,
    /// Cloud credential reference
    pub azure_credential_secret: String,
    /// Kubernetes version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    /// API server reachable only from the virtual network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_cluster: Option<bool>,
    /// DNS prefix for the API server FQDN
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_prefix: Option<String>,
    /// Agent node pools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_pools: Option<Vec<AksNodePool>>,
    /// Azure resource tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
}

/// AKS agent pool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AksNodePool {
    /// Pool name
    pub name: String,
    /// Node count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,
    /// VM size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_size: Option<String>,
    /// System or User
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Kubernetes version of the pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator_version: Option<String>,
}

/// EKS cluster configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EksConfigSpec {
    /// Name of the cluster in AWS
    pub display_name: String,
    /// AWS region
    pub region: String,
    /// Imported rather than created
    #[serde(default)]
    pub imported: bool,
    /// Cloud credential reference
    pub amazon_credential_secret: String,
    /// Kubernetes version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    /// API server reachable from inside the VPC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_access: Option<bool>,
    /// API server reachable from the internet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_access: Option<bool>,
    /// VPC subnets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnets: Option<Vec<String>>,
    /// Managed node groups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_groups: Option<Vec<EksNodeGroup>>,
    /// AWS resource tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
}

/// EKS managed node group
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EksNodeGroup {
    /// Node group name
    pub nodegroup_name: String,
    /// Instance type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    /// Desired node count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_size: Option<i64>,
    /// Minimum node count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_size: Option<i64>,
    /// Maximum node count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<i64>,
}

/// GKE cluster configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GkeConfigSpec {
    /// Name of the cluster in GCP
    pub cluster_name: String,
    /// GCP project
    pub project_id: String,
    /// Region, exclusive with zone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Zone, exclusive with region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Imported rather than created
    #[serde(default)]
    pub imported: bool,
    /// Cloud credential reference
    pub google_credential_secret: String,
    /// Kubernetes version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    /// Private cluster settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_cluster_config: Option<GkePrivateClusterConfig>,
    /// Node pools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_pools: Option<Vec<GkeNodePool>>,
    /// GCP labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

/// GKE private cluster settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GkePrivateClusterConfig {
    /// Only the private endpoint is exposed
    #[serde(default)]
    pub enable_private_endpoint: bool,
    /// Nodes have internal IPs only
    #[serde(default)]
    pub enable_private_nodes: bool,
    /// CIDR for the control plane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_ipv4_cidr_block: Option<String>,
}

/// GKE node pool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GkeNodePool {
    /// Pool name
    pub name: String,
    /// Initial node count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_node_count: Option<i64>,
    /// Kubernetes version of the pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Alibaba ACK cluster configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AliConfigSpec {
    /// Name of the cluster in Alibaba Cloud
    pub cluster_name: String,
    /// Region
    pub region_id: String,
    /// Imported rather than created
    #[serde(default)]
    pub imported: bool,
    /// Cloud credential reference
    pub alibaba_credential_secret: String,
    /// Kubernetes version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    /// API server exposed through an EIP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_public_access: Option<bool>,
    /// VPC to place the cluster in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_id: Option<String>,
    /// Node pools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_pools: Option<Vec<AliNodePool>>,
}

/// Alibaba ACK node pool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AliNodePool {
    /// Pool name
    pub name: String,
    /// Instance types
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_types: Option<Vec<String>>,
    /// Desired node count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_size: Option<i64>,
}
