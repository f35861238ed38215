//! Carrier (CMSNet) connections that reach into VPC subnets.
//!
//! Subnets can only be deleted once the carrier's activations and NATs for
//! them are gone. A request that is still being deployed blocks deletion.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use vnet_networking::Ipv4Cidr;

use crate::model::VpcKey;

#[derive(Debug, Error)]
pub enum CarrierError {
    #[error("a carrier NAT is currently pending for {inside_network}; wait for it to succeed or fail and try again")]
    PendingNat { inside_network: Ipv4Cidr },

    #[error("a carrier connection is currently pending for subnet {subnet_id}; wait for it to succeed or fail and try again")]
    PendingConnection { subnet_id: String },

    #[error("carrier request {request_id} not found")]
    NotFound { request_id: String },

    #[error("carrier API failed: {0}")]
    Api(String),
}

pub type CarrierResult<T> = Result<T, CarrierError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Requested,
    InProgress,
    Successful,
    Failed,
}

impl RequestStatus {
    pub fn blocks_deletion(&self) -> bool {
        matches!(self, Self::Requested | Self::InProgress)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub request_id: String,
    pub subnet_id: String,
    pub destination_cidr: Ipv4Cidr,
    pub vrf: String,
    pub status: RequestStatus,
}

/// A deployed connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activation {
    pub request_id: String,
    pub subnet_id: String,
    pub destination_cidr: Ipv4Cidr,
    pub vrf: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatRequest {
    pub request_id: String,
    pub inside_network: Ipv4Cidr,
    pub vrf: String,
    pub status: RequestStatus,
}

/// A deployed NAT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarrierNat {
    pub request_id: String,
    pub inside_network: Ipv4Cidr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outside_network: Option<Ipv4Cidr>,
    pub vrf: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionData {
    pub requests: Vec<ConnectionRequest>,
    pub activations: Vec<Activation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NatData {
    pub requests: Vec<NatRequest>,
    pub nats: Vec<CarrierNat>,
}

#[async_trait]
pub trait Carrier: Send + Sync {
    async fn connections(&self, account_id: &str, vpc: &VpcKey) -> CarrierResult<ConnectionData>;

    async fn nats(&self, account_id: &str, vpc: &VpcKey) -> CarrierResult<NatData>;

    async fn delete_activation(
        &self,
        account_id: &str,
        vpc: &VpcKey,
        request_id: &str,
    ) -> CarrierResult<()>;

    async fn delete_nat(
        &self,
        account_id: &str,
        vpc: &VpcKey,
        request_id: &str,
    ) -> CarrierResult<()>;
}

/// A subnet whose carrier configuration should be removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetRef {
    pub subnet_id: String,
    pub cidr: Ipv4Cidr,
}

/// Delete the carrier NATs and activations for `subnets`.
///
/// Fails before deleting anything of a kind when a matching request is still
/// pending. Returns the request IDs that were deleted.
pub async fn delete_carrier_configurations(
    carrier: &dyn Carrier,
    account_id: &str,
    vpc: &VpcKey,
    subnets: &[SubnetRef],
) -> CarrierResult<Vec<String>> {
    let mut deleted = Vec::new();
    let in_subnets = |network: &Ipv4Cidr| subnets.iter().any(|s| s.cidr.contains(network));

    let nat_data = carrier.nats(account_id, vpc).await?;
    if let Some(pending) = nat_data
        .requests
        .iter()
        .find(|r| in_subnets(&r.inside_network) && r.status.blocks_deletion())
    {
        return Err(CarrierError::PendingNat {
            inside_network: pending.inside_network,
        });
    }
    for nat in nat_data.nats.iter().filter(|n| in_subnets(&n.inside_network)) {
        carrier.delete_nat(account_id, vpc, &nat.request_id).await?;
        info!(vpc = %vpc, request_id = %nat.request_id, vrf = %nat.vrf, "Deleted carrier NAT");
        deleted.push(nat.request_id.clone());
    }

    let is_target = |subnet_id: &str| subnets.iter().any(|s| s.subnet_id == subnet_id);
    let connection_data = carrier.connections(account_id, vpc).await?;
    if let Some(pending) = connection_data
        .requests
        .iter()
        .find(|r| is_target(&r.subnet_id) && r.status.blocks_deletion())
    {
        return Err(CarrierError::PendingConnection {
            subnet_id: pending.subnet_id.clone(),
        });
    }
    for activation in connection_data
        .activations
        .iter()
        .filter(|a| is_target(&a.subnet_id))
    {
        carrier
            .delete_activation(account_id, vpc, &activation.request_id)
            .await?;
        info!(
            vpc = %vpc,
            request_id = %activation.request_id,
            vrf = %activation.vrf,
            "Deleted carrier activation"
        );
        deleted.push(activation.request_id.clone());
    }

    Ok(deleted)
}

// ===== In-memory carrier =====

#[derive(Debug, Default)]
struct CarrierState {
    connections: BTreeMap<VpcKey, ConnectionData>,
    nats: BTreeMap<VpcKey, NatData>,
}

/// Carrier backed by in-process maps. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryCarrier {
    state: Arc<Mutex<CarrierState>>,
}

impl MemoryCarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_connection_request(&self, vpc: &VpcKey, request: ConnectionRequest) {
        let mut state = self.state.lock().await;
        state.connections.entry(vpc.clone()).or_default().requests.push(request);
    }

    pub async fn add_activation(&self, vpc: &VpcKey, activation: Activation) {
        let mut state = self.state.lock().await;
        state.connections.entry(vpc.clone()).or_default().activations.push(activation);
    }

    pub async fn add_nat_request(&self, vpc: &VpcKey, request: NatRequest) {
        let mut state = self.state.lock().await;
        state.nats.entry(vpc.clone()).or_default().requests.push(request);
    }

    pub async fn add_nat(&self, vpc: &VpcKey, nat: CarrierNat) {
        let mut state = self.state.lock().await;
        state.nats.entry(vpc.clone()).or_default().nats.push(nat);
    }
}

#[async_trait]
impl Carrier for MemoryCarrier {
    async fn connections(&self, _account_id: &str, vpc: &VpcKey) -> CarrierResult<ConnectionData> {
        let state = self.state.lock().await;
        Ok(state.connections.get(vpc).cloned().unwrap_or_default())
    }

    async fn nats(&self, _account_id: &str, vpc: &VpcKey) -> CarrierResult<NatData> {
        let state = self.state.lock().await;
        Ok(state.nats.get(vpc).cloned().unwrap_or_default())
    }

    async fn delete_activation(
        &self,
        _account_id: &str,
        vpc: &VpcKey,
        request_id: &str,
    ) -> CarrierResult<()> {
        let mut state = self.state.lock().await;
        let data = state.connections.entry(vpc.clone()).or_default();
        let before = data.activations.len();
        data.activations.retain(|a| a.request_id != request_id);
        if data.activations.len() == before {
            return Err(CarrierError::NotFound {
                request_id: request_id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_nat(
        &self,
        _account_id: &str,
        vpc: &VpcKey,
        request_id: &str,
    ) -> CarrierResult<()> {
        let mut state = self.state.lock().await;
        let data = state.nats.entry(vpc.clone()).or_default();
        let before = data.nats.len();
        data.nats.retain(|n| n.request_id != request_id);
        if data.nats.len() == before {
            return Err(CarrierError::NotFound {
                request_id: request_id.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> Ipv4Cidr {
        s.parse().unwrap()
    }

    fn vpc() -> VpcKey {
        VpcKey::new("us-east-1", "vpc-1")
    }

    fn subnet() -> SubnetRef {
        SubnetRef {
            subnet_id: "subnet-a".into(),
            cidr: cidr("10.0.1.0/24"),
        }
    }

    #[tokio::test]
    async fn test_deletes_matching_configurations_only() {
        let carrier = MemoryCarrier::new();
        carrier
            .add_nat(&vpc(), CarrierNat {
                request_id: "nat-in".into(),
                inside_network: cidr("10.0.1.16/28"),
                outside_network: None,
                vrf: "vpn_app_unix_imp".into(),
            })
            .await;
        carrier
            .add_nat(&vpc(), CarrierNat {
                request_id: "nat-out".into(),
                inside_network: cidr("10.0.2.0/28"),
                outside_network: None,
                vrf: "vpn_app_unix_imp".into(),
            })
            .await;
        carrier
            .add_activation(&vpc(), Activation {
                request_id: "act-a".into(),
                subnet_id: "subnet-a".into(),
                destination_cidr: cidr("10.128.0.0/16"),
                vrf: "vpn_app_unix_imp".into(),
            })
            .await;

        let deleted = delete_carrier_configurations(&carrier, "111", &vpc(), &[subnet()])
            .await
            .unwrap();
        assert_eq!(deleted, vec!["nat-in".to_string(), "act-a".to_string()]);
        assert_eq!(carrier.nats("111", &vpc()).await.unwrap().nats.len(), 1);
    }

    #[tokio::test]
    async fn test_pending_request_blocks_deletion() {
        let carrier = MemoryCarrier::new();
        carrier
            .add_connection_request(&vpc(), ConnectionRequest {
                request_id: "req-1".into(),
                subnet_id: "subnet-a".into(),
                destination_cidr: cidr("10.128.0.0/16"),
                vrf: "vpn_data_unix".into(),
                status: RequestStatus::InProgress,
            })
            .await;

        let err = delete_carrier_configurations(&carrier, "111", &vpc(), &[subnet()])
            .await
            .unwrap_err();
        assert!(matches!(err, CarrierError::PendingConnection { .. }));
    }

    #[tokio::test]
    async fn test_pending_nat_blocks_before_anything_is_deleted() {
        let carrier = MemoryCarrier::new();
        carrier
            .add_nat(&vpc(), CarrierNat {
                request_id: "nat-done".into(),
                inside_network: cidr("10.0.1.0/28"),
                outside_network: Some(cidr("172.30.0.0/28")),
                vrf: "vpn_app_unix_imp".into(),
            })
            .await;
        carrier
            .add_nat_request(&vpc(), NatRequest {
                request_id: "nat-new".into(),
                inside_network: cidr("10.0.1.32/28"),
                vrf: "vpn_app_unix_imp".into(),
                status: RequestStatus::Requested,
            })
            .await;

        let err = delete_carrier_configurations(&carrier, "111", &vpc(), &[subnet()])
            .await
            .unwrap_err();
        assert!(matches!(err, CarrierError::PendingNat { .. }));
        assert_eq!(carrier.nats("111", &vpc()).await.unwrap().nats.len(), 1);
    }

    #[test]
    fn test_only_open_requests_block() {
        assert!(RequestStatus::Requested.blocks_deletion());
        assert!(RequestStatus::InProgress.blocks_deletion());
        assert!(!RequestStatus::Successful.blocks_deletion());
        assert!(!RequestStatus::Failed.blocks_deletion());
    }
}
