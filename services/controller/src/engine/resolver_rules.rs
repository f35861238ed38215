//! Resolver rule associations of a VPC.

use tracing::instrument;

use super::context::VpcSession;
use super::error::StepContext;
use super::{TaskError, TaskResult};
use crate::cloud::{CloudError, IgnoreNotFound};
use crate::model::{NetworkingConfig, ResolverRuleAssociation};

/// Disassociate recorded rules that are no longer configured, then
/// associate the configured ones that are missing.
#[instrument(skip(session, config), fields(vpc = %session.key))]
pub async fn converge_resolver_rules(
    session: &mut VpcSession<'_>,
    config: &NetworkingConfig,
) -> TaskResult<()> {
    let vpc_type = session.state.vpc_type;
    if !vpc_type.can_update_resolver_rules() {
        if !config.resolver_rule_ids.is_empty() {
            session
                .log(format!("Resolver rules of {vpc_type} VPCs are not managed; skipping them"))
                .await;
        }
        return Ok(());
    }

    let unconfigured: Vec<String> = session
        .state
        .resolver_rule_associations
        .iter()
        .filter(|a| !config.resolver_rule_ids.contains(&a.resolver_rule_id))
        .map(|a| a.resolver_rule_id.clone())
        .collect();
    for rule_id in unconfigured {
        session
            .cloud
            .disassociate_resolver_rule(&rule_id, session.vpc_id())
            .await
            .ignore_not_found()
            .step(format!("Error disassociating resolver rule {rule_id}"))?;
        session.mutated();
        session.log(format!("Disassociated resolver rule {rule_id}")).await;
        session
            .state
            .resolver_rule_associations
            .retain(|a| a.resolver_rule_id != rule_id);
        session.persist().await?;
    }

    for rule_id in &config.resolver_rule_ids {
        let associated = session
            .state
            .resolver_rule_associations
            .iter()
            .any(|a| &a.resolver_rule_id == rule_id);
        if associated {
            continue;
        }
        let rule = session
            .cloud
            .describe_resolver_rule(rule_id)
            .await
            .step(format!("Error describing resolver rule {rule_id}"))?
            .ok_or_else(|| CloudError::not_found(rule_id))?;
        if !rule.ready {
            return Err(TaskError::precondition(format!(
                "Resolver rule {rule_id} is not ready to be associated"
            )));
        }
        let association_id = session
            .cloud
            .associate_resolver_rule(rule_id, session.vpc_id(), &rule.name)
            .await
            .step(format!("Error associating resolver rule {rule_id}"))?;
        session.mutated();
        session
            .log(format!("Associated resolver rule {rule_id} ({})", rule.name))
            .await;
        session
            .state
            .resolver_rule_associations
            .push(ResolverRuleAssociation {
                resolver_rule_id: rule_id.clone(),
                association_id,
            });
        session.persist().await?;
    }
    Ok(())
}
