//! Route table, route and association primitives.
//!
//! Each primitive looks at the live resource first, decides with the pure
//! planners from `vnet-reconcile`, applies at most one cloud call and
//! persists the state change right away.

use vnet_networking::Ipv4Cidr;
use vnet_reconcile::{
    plan_association, plan_route, AssociationAction, Observed, ObservedAssociation, RouteAction,
};

use super::context::VpcSession;
use super::error::StepContext;
use super::names;
use super::{TaskError, TaskResult};
use crate::cloud::{AssociationTarget, CloudError, IgnoreNotFound, LiveRoute};
use crate::model::{EdgeGateway, RouteTableInfo, RouteTableRole, RouteTarget, SubnetType, VpcState};

/// A place in [`VpcState`] that holds a route table ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableSlot {
    SharedPublic,
    Firewall,
    InternetGatewayEdge,
    ZonePrivate(String),
    ZonePublic(String),
    Subnet {
        az: String,
        subnet_type: SubnetType,
        subnet_id: String,
        group_name: String,
    },
}

impl TableSlot {
    pub fn get(&self, state: &VpcState) -> Option<String> {
        match self {
            Self::SharedPublic => state.public_route_table_id.clone(),
            Self::Firewall => state.firewall_route_table_id.clone(),
            Self::InternetGatewayEdge => state.internet_gateway.route_table_id.clone(),
            Self::ZonePrivate(az) => state
                .availability_zones
                .get(az)
                .and_then(|infra| infra.private_route_table_id.clone()),
            Self::ZonePublic(az) => state
                .availability_zones
                .get(az)
                .and_then(|infra| infra.public_route_table_id.clone()),
            Self::Subnet { subnet_id, .. } => state
                .subnets()
                .find(|(_, _, s)| &s.subnet_id == subnet_id)
                .and_then(|(_, _, s)| s.custom_route_table_id.clone()),
        }
    }

    pub fn set(&self, state: &mut VpcState, id: Option<String>) {
        match self {
            Self::SharedPublic => state.public_route_table_id = id,
            Self::Firewall => state.firewall_route_table_id = id,
            Self::InternetGatewayEdge => state.internet_gateway.route_table_id = id,
            Self::ZonePrivate(az) => {
                state.availability_zones.entry(az.clone()).or_default().private_route_table_id = id
            }
            Self::ZonePublic(az) => {
                state.availability_zones.entry(az.clone()).or_default().public_route_table_id = id
            }
            Self::Subnet { subnet_id, .. } => {
                if let Some(subnet) = state.subnet_mut(subnet_id) {
                    subnet.custom_route_table_id = id;
                }
            }
        }
    }

    pub fn role(&self) -> RouteTableRole {
        match self {
            Self::SharedPublic | Self::ZonePublic(_) => RouteTableRole::Subnets(SubnetType::Public),
            Self::Firewall => RouteTableRole::Subnets(SubnetType::Firewall),
            Self::InternetGatewayEdge => {
                RouteTableRole::EdgeAssociation(EdgeGateway::InternetGateway)
            }
            Self::ZonePrivate(_) => RouteTableRole::Subnets(SubnetType::Private),
            Self::Subnet { subnet_type, .. } => RouteTableRole::Subnets(*subnet_type),
        }
    }

    pub fn name(&self, vpc_name: &str) -> String {
        match self {
            Self::SharedPublic => names::shared_public_route_table(vpc_name),
            Self::Firewall => names::firewall_route_table(vpc_name),
            Self::InternetGatewayEdge => names::igw_route_table(vpc_name),
            Self::ZonePrivate(az) => names::zonal_name(vpc_name, "private", az),
            Self::ZonePublic(az) => names::zonal_name(vpc_name, "public", az),
            Self::Subnet {
                az,
                subnet_type,
                group_name,
                ..
            } => names::zonal_name(vpc_name, &names::group_label(*subnet_type, group_name), az),
        }
    }
}

impl VpcSession<'_> {
    /// Return the slot's table, creating it if it was never created or has
    /// disappeared from the cloud.
    pub async fn ensure_route_table(&mut self, slot: &TableSlot) -> TaskResult<String> {
        if let Some(id) = slot.get(&self.state) {
            let live = self
                .cloud
                .describe_route_table(&id)
                .await
                .step(format!("Error describing route table {id}"))?;
            if live.is_some() {
                if !self.state.route_tables.contains_key(&id) {
                    self.state
                        .route_tables
                        .insert(id.clone(), RouteTableInfo::new(&id, slot.role()));
                    self.persist().await?;
                }
                return Ok(id);
            }
            self.log(format!("Route table {id} no longer exists; recreating it"))
                .await;
            self.state.route_tables.remove(&id);
            slot.set(&mut self.state, None);
            self.persist().await?;
        }

        let name = slot.name(&self.name);
        let id = self
            .cloud
            .create_route_table(self.vpc_id(), &names::automated_tags(&name))
            .await
            .step(format!("Error creating route table {name}"))?;
        self.mutated();
        self.log(format!("Created route table {id} ({name})")).await;
        self.state
            .route_tables
            .insert(id.clone(), RouteTableInfo::new(&id, slot.role()));
        slot.set(&mut self.state, Some(id.clone()));
        self.persist().await?;
        Ok(id)
    }

    /// Delete a table and forget it. A table already gone is fine.
    pub async fn delete_route_table(&mut self, route_table_id: &str) -> TaskResult<()> {
        self.cloud
            .delete_route_table(route_table_id)
            .await
            .ignore_not_found()
            .step(format!("Error deleting route table {route_table_id}"))?;
        self.mutated();
        self.log(format!("Deleted route table {route_table_id}")).await;
        self.state.route_tables.remove(route_table_id);
        self.persist().await
    }

    /// Converge one destination of one table to `desired`.
    ///
    /// A recorded route with no desired target is deleted (a route already
    /// gone live is fine). A live route the state does not know about is
    /// replaced rather than created, and only ever deleted once recorded.
    pub async fn set_route(
        &mut self,
        route_table_id: &str,
        destination: Ipv4Cidr,
        desired: Option<RouteTarget>,
    ) -> TaskResult<()> {
        let recorded = self
            .state
            .route_tables
            .get(route_table_id)
            .and_then(|t| t.route(&destination))
            .map(|r| r.target.clone());
        if recorded.is_none() && desired.is_none() {
            return Ok(());
        }

        let live = self
            .cloud
            .describe_route_table(route_table_id)
            .await
            .step(format!("Error describing route table {route_table_id}"))?
            .ok_or_else(|| CloudError::not_found(route_table_id))?;
        let observed = match live.route(&destination) {
            None => Observed::Absent,
            Some(LiveRoute { target: None, .. }) => Observed::Foreign,
            Some(LiveRoute {
                target: Some(target),
                ..
            }) => Observed::Present(target),
        };

        let action = plan_route(recorded.as_ref(), observed, desired.as_ref());
        match &action {
            RouteAction::Create(target) => {
                self.cloud
                    .create_route(route_table_id, &destination, target)
                    .await
                    .step(format!(
                        "Error creating route {destination} -> {target} in {route_table_id}"
                    ))?;
                self.log(format!(
                    "Created route {destination} -> {target} in {route_table_id}"
                ))
                .await;
            }
            RouteAction::Replace(target) => {
                self.cloud
                    .replace_route(route_table_id, &destination, target)
                    .await
                    .step(format!(
                        "Error replacing route {destination} -> {target} in {route_table_id}"
                    ))?;
                self.log(format!(
                    "Replaced route {destination} -> {target} in {route_table_id}"
                ))
                .await;
            }
            RouteAction::Delete => {
                self.cloud
                    .delete_route(route_table_id, &destination)
                    .await
                    .ignore_not_found()
                    .step(format!(
                        "Error deleting route {destination} from {route_table_id}"
                    ))?;
                self.log(format!("Deleted route {destination} from {route_table_id}"))
                    .await;
            }
            RouteAction::Record(_) | RouteAction::Forget | RouteAction::Unchanged => {}
        }
        if action.is_mutating() {
            self.mutated();
        }
        if action.changes_state() {
            let target = match action {
                RouteAction::Create(t) | RouteAction::Replace(t) | RouteAction::Record(t) => {
                    Some(t)
                }
                RouteAction::Delete | RouteAction::Forget | RouteAction::Unchanged => None,
            };
            if let Some(table) = self.state.route_tables.get_mut(route_table_id) {
                table.set_route(destination, target);
            }
            self.persist().await?;
        }
        Ok(())
    }

    /// Make `route_table_id` the only table associated with `target` and
    /// return the association ID. The caller records it.
    pub async fn ensure_association(
        &mut self,
        route_table_id: &str,
        target: &AssociationTarget,
    ) -> TaskResult<String> {
        let live = self
            .cloud
            .find_associations(target)
            .await
            .step(format!("Error describing associations of {target}"))?;
        let observed: Vec<ObservedAssociation<'_>> = live
            .iter()
            .map(|a| ObservedAssociation {
                association_id: &a.association_id,
                route_table_id: &a.route_table_id,
            })
            .collect();

        match plan_association(route_table_id, &observed) {
            AssociationAction::Keep { association_id } => Ok(association_id),
            AssociationAction::Replace { association_id } => {
                let new_id = self
                    .cloud
                    .replace_route_table_association(&association_id, route_table_id)
                    .await
                    .step(format!(
                        "Error replacing association {association_id} of {target}"
                    ))?;
                self.mutated();
                self.log(format!(
                    "Replaced route table association of {target} with {route_table_id}"
                ))
                .await;
                Ok(new_id)
            }
            AssociationAction::Associate => {
                let new_id = self
                    .cloud
                    .associate_route_table(route_table_id, target)
                    .await
                    .step(format!(
                        "Error associating {target} with route table {route_table_id}"
                    ))?;
                self.mutated();
                self.log(format!("Associated {target} with route table {route_table_id}"))
                    .await;
                Ok(new_id)
            }
            AssociationAction::Conflict { count } => Err(TaskError::Invariant(format!(
                "{target} has {count} route table associations"
            ))),
        }
    }

    /// Associate a recorded subnet and record the association.
    pub async fn associate_subnet(
        &mut self,
        route_table_id: &str,
        subnet_id: &str,
    ) -> TaskResult<()> {
        let association_id = self
            .ensure_association(route_table_id, &AssociationTarget::Subnet(subnet_id.to_string()))
            .await?;
        if let Some(subnet) = self.state.subnet_mut(subnet_id) {
            subnet.route_table_association_id = Some(association_id);
        }
        self.persist().await
    }

    /// Remove every live association of a subnet.
    pub async fn disassociate_subnet(&mut self, subnet_id: &str) -> TaskResult<()> {
        let live = self
            .cloud
            .find_associations(&AssociationTarget::Subnet(subnet_id.to_string()))
            .await
            .step(format!("Error describing associations of {subnet_id}"))?;
        for association in live {
            self.disassociate(&association.association_id).await?;
        }
        if let Some(subnet) = self.state.subnet_mut(subnet_id) {
            subnet.route_table_association_id = None;
        }
        self.persist().await
    }

    pub async fn disassociate(&mut self, association_id: &str) -> TaskResult<()> {
        self.cloud
            .disassociate_route_table(association_id)
            .await
            .ignore_not_found()
            .step(format!("Error disassociating {association_id}"))?;
        self.mutated();
        self.log(format!("Disassociated route table association {association_id}"))
            .await;
        Ok(())
    }

    /// Disassociate live subnet associations on managed tables whose subnet
    /// is no longer recorded.
    pub async fn sweep_orphan_associations(&mut self) -> TaskResult<()> {
        let live = self
            .cloud
            .describe_route_tables(self.vpc_id())
            .await
            .step("Error describing route tables")?;
        let orphans: Vec<(String, String, String)> = live
            .iter()
            .filter(|table| self.state.route_tables.contains_key(&table.route_table_id))
            .flat_map(|table| table.associations.iter())
            .filter_map(|a| match &a.target {
                AssociationTarget::Subnet(id) if !self.state.has_subnet(id) => Some((
                    a.association_id.clone(),
                    a.route_table_id.clone(),
                    id.clone(),
                )),
                _ => None,
            })
            .collect();

        for (association_id, route_table_id, subnet_id) in orphans {
            self.log(format!(
                "Subnet {subnet_id} is not managed but is associated with {route_table_id}"
            ))
            .await;
            self.disassociate(&association_id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SubnetInfo, VpcType};

    #[test]
    fn test_slots_read_and_write_their_fields() {
        let mut state = VpcState::new(VpcType::V1);
        state
            .availability_zones
            .entry("us-east-1a".into())
            .or_default()
            .subnets
            .entry(SubnetType::App)
            .or_default()
            .push(SubnetInfo::new("subnet-app", "app"));

        let slots = [
            TableSlot::SharedPublic,
            TableSlot::Firewall,
            TableSlot::InternetGatewayEdge,
            TableSlot::ZonePrivate("us-east-1a".into()),
            TableSlot::ZonePublic("us-east-1a".into()),
            TableSlot::Subnet {
                az: "us-east-1a".into(),
                subnet_type: SubnetType::App,
                subnet_id: "subnet-app".into(),
                group_name: "app".into(),
            },
        ];
        for (i, slot) in slots.iter().enumerate() {
            let id = format!("rtb-{i}");
            slot.set(&mut state, Some(id.clone()));
            assert_eq!(slot.get(&state), Some(id));
        }
        assert_eq!(state.referenced_route_table_ids().len(), slots.len());
    }

    #[test]
    fn test_slot_names() {
        assert_eq!(TableSlot::SharedPublic.name("v"), "v-public");
        assert_eq!(TableSlot::ZonePublic("us-east-1b".into()).name("v"), "v-public-b");
        assert_eq!(TableSlot::ZonePrivate("us-east-1b".into()).name("v"), "v-private-b");
        let slot = TableSlot::Subnet {
            az: "us-east-1c".into(),
            subnet_type: SubnetType::Data,
            subnet_id: "subnet-1".into(),
            group_name: "data".into(),
        };
        assert_eq!(slot.name("v"), "v-data-c");
        assert_eq!(slot.role(), RouteTableRole::Subnets(SubnetType::Data));
    }
}
