//! Minimal `resource.k8s.io/v1` ResourceClaim model.
//!
//! Only the status fields needed to tell which pods hold an allocated NVIDIA
//! GPU claim are modelled; everything else in the object is ignored.

use std::borrow::Cow;

use k8s_openapi::NamespaceResourceScope;
use kube::api::ObjectMeta;
use serde::Deserialize;
use serde::Serialize;

/// Driver name reported in allocation results of the NVIDIA DRA driver.
pub const NVIDIA_DRA_DRIVER_NAME: &str = "gpu.nvidia.com";

/// Resource name of a pod in a claim's `reservedFor` list.
const PODS_RESOURCE: &str = "pods";

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceClaim {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResourceClaimStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceClaimStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<AllocationResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reserved_for: Vec<ResourceClaimConsumerReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResult {
    #[serde(default)]
    pub devices: DeviceAllocationResult,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAllocationResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<DeviceRequestAllocationResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequestAllocationResult {
    #[serde(default)]
    pub request: String,
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub device: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceClaimConsumerReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    pub resource: String,
    pub name: String,
    pub uid: String,
}

impl ResourceClaim {
    /// True when the allocation was satisfied by the NVIDIA GPU DRA driver.
    pub fn is_nvidia_gpu_claim(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|status| status.allocation.as_ref())
            .is_some_and(|allocation| {
                allocation
                    .devices
                    .results
                    .iter()
                    .any(|result| result.driver == NVIDIA_DRA_DRIVER_NAME)
            })
    }

    /// UIDs of the pods this claim is reserved for.
    pub fn reserved_pod_uids(&self) -> impl Iterator<Item = &str> {
        self.status
            .iter()
            .flat_map(|status| status.reserved_for.iter())
            .filter(|consumer| consumer.resource == PODS_RESOURCE)
            .map(|consumer| consumer.uid.as_str())
    }
}

impl kube::Resource for ResourceClaim {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn group(_dt: &()) -> Cow<'_, str> {
        "resource.k8s.io".into()
    }

    fn version(_dt: &()) -> Cow<'_, str> {
        "v1".into()
    }

    fn kind(_dt: &()) -> Cow<'_, str> {
        "ResourceClaim".into()
    }

    fn plural(_dt: &()) -> Cow<'_, str> {
        "resourceclaims".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A claim in `namespace/name`, allocated by `driver` and reserved for `pod_uids`.
    pub(crate) fn claim(name: &str, driver: &str, pod_uids: &[&str]) -> ResourceClaim {
        ResourceClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(format!("claim-{name}")),
                ..Default::default()
            },
            status: Some(ResourceClaimStatus {
                allocation: Some(AllocationResult {
                    devices: DeviceAllocationResult {
                        results: vec![DeviceRequestAllocationResult {
                            request: "gpu".to_string(),
                            driver: driver.to_string(),
                            pool: "node-a".to_string(),
                            device: "gpu-0".to_string(),
                        }],
                    },
                }),
                reserved_for: pod_uids
                    .iter()
                    .map(|uid| ResourceClaimConsumerReference {
                        api_group: None,
                        resource: "pods".to_string(),
                        name: format!("pod-{uid}"),
                        uid: uid.to_string(),
                    })
                    .collect(),
            }),
        }
    }
}
