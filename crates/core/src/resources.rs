//! Wire types for the two kinds this controller handles.
//!
//! `TrafficSplit` follows SMI `split.smi-spec.io/v1alpha1` with integer weights.
//! `VirtualService` models only the subset of Istio's
//! `networking.istio.io/v1alpha3` schema needed to carry hosts and weights;
//! Istio owns that CRD, so no schema is generated for it here.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "split.smi-spec.io",
    version = "v1alpha1",
    kind = "TrafficSplit",
    plural = "trafficsplits",
    shortname = "ts",
    derive = "PartialEq",
    namespaced
)]
pub struct TrafficSplitSpec {
    /// Root service that clients address.
    #[serde(default)]
    pub service: String,
    /// Weighted backends, in the order they should appear in the route.
    #[serde(default)]
    pub backends: Vec<TrafficSplitBackend>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TrafficSplitBackend {
    pub service: String,
    /// Relative weight; totals are not normalized.
    #[serde(default)]
    pub weight: u32,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[kube(
    group = "networking.istio.io",
    version = "v1alpha3",
    kind = "VirtualService",
    plural = "virtualservices",
    schema = "disabled",
    derive = "PartialEq",
    namespaced
)]
pub struct VirtualServiceSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http: Vec<HttpRoute>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRoute {
    #[serde(default)]
    pub route: Vec<HttpRouteDestination>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRouteDestination {
    pub destination: Destination,
    #[serde(default)]
    pub weight: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub host: String,
}

/// Flattened `{host, weight}` view of a routing resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedDestination {
    pub host: String,
    pub weight: u32,
}

impl VirtualService {
    /// All weighted destinations across HTTP routes, in route order.
    pub fn weighted_destinations(&self) -> Vec<WeightedDestination> {
        self.spec
            .http
            .iter()
            .flat_map(|r| r.route.iter())
            .map(|d| WeightedDestination { host: d.destination.host.clone(), weight: d.weight })
            .collect()
    }
}
