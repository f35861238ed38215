use tracing::{info, warn};
use vnet_networking::Ipv4Cidr;

use super::{Container, Ipam, IpamError, IpamResult};
use crate::locks::{LockManager, LockSet, LockTarget};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Created {
    Container(String),
    Block(Ipv4Cidr),
}

/// One task's view of IPAM.
///
/// Every write first checks that the task still holds `ipcontrol-write`.
/// Containers and blocks created through the context are tracked so a failed
/// run can delete them again with [`AllocationContext::rollback`].
pub struct AllocationContext<'a> {
    ipam: &'a dyn Ipam,
    lock_manager: &'a dyn LockManager,
    locks: &'a LockSet,
    created: Vec<Created>,
}

impl<'a> AllocationContext<'a> {
    pub fn new(ipam: &'a dyn Ipam, lock_manager: &'a dyn LockManager, locks: &'a LockSet) -> Self {
        Self {
            ipam,
            lock_manager,
            locks,
            created: Vec::new(),
        }
    }

    async fn check_write(&self) -> IpamResult<()> {
        let target = LockTarget::ipcontrol_write();
        if self.lock_manager.holds(self.locks, &target).await? {
            Ok(())
        } else {
            Err(IpamError::LockNotHeld)
        }
    }

    pub async fn container(&self, path: &str) -> IpamResult<Option<Container>> {
        self.ipam.get_container(path).await
    }

    pub async fn find_block_container(&self, cidr: &Ipv4Cidr) -> IpamResult<Option<String>> {
        self.ipam.find_block_container(cidr).await
    }

    pub async fn has_available_space(&self, container: &str, prefix_len: u8) -> IpamResult<bool> {
        self.ipam.has_available_space(container, prefix_len).await
    }

    /// Return `<parent>/<name>`, creating it if needed.
    pub async fn ensure_container(&mut self, parent: &str, name: &str) -> IpamResult<String> {
        let path = format!("{parent}/{name}");
        if self.ipam.get_container(&path).await?.is_some() {
            return Ok(path);
        }
        self.check_write().await?;
        let path = self.ipam.add_container(parent, name).await?;
        self.created.push(Created::Container(path.clone()));
        Ok(path)
    }

    /// Create `<parent>/<name>`, failing if it exists.
    pub async fn add_container(&mut self, parent: &str, name: &str) -> IpamResult<String> {
        self.check_write().await?;
        let path = self.ipam.add_container(parent, name).await?;
        self.created.push(Created::Container(path.clone()));
        Ok(path)
    }

    pub async fn allocate_block(
        &mut self,
        container: &str,
        prefix_len: u8,
        within: Option<Ipv4Cidr>,
    ) -> IpamResult<Ipv4Cidr> {
        self.check_write().await?;
        let block = self.ipam.allocate_block(container, prefix_len, within).await?;
        info!(container = %container, block = %block, "Allocated IPAM block");
        self.created.push(Created::Block(block));
        Ok(block)
    }

    pub async fn bind_cloud_id(&self, container: &str, cloud_id: &str) -> IpamResult<()> {
        self.check_write().await?;
        self.ipam.update_cloud_id(container, cloud_id).await
    }

    pub async fn delete_block(&self, cidr: &Ipv4Cidr) -> IpamResult<()> {
        self.check_write().await?;
        self.ipam.delete_block(cidr).await
    }

    pub async fn delete_container(&self, path: &str, with_blocks: bool) -> IpamResult<()> {
        self.check_write().await?;
        self.ipam.delete_container(path, with_blocks).await
    }

    /// Forget the tracked resources: the run succeeded.
    pub fn commit(mut self) {
        self.created.clear();
    }

    /// Delete what this run created, newest first: blocks before the
    /// containers that hold them. Failures are logged and skipped.
    pub async fn rollback(mut self) -> usize {
        let created = std::mem::take(&mut self.created);
        let mut failures = 0;
        for resource in created.iter().rev() {
            let result = match resource {
                Created::Block(cidr) => self.delete_block(cidr).await,
                Created::Container(path) => self.delete_container(path, true).await,
            };
            if let Err(e) = result {
                failures += 1;
                warn!(
                    resource = ?resource,
                    error = %e,
                    "Failed to delete IPAM resource during cleanup"
                );
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipam::MemoryIpam;
    use crate::memory::MemoryBackend;
    use vnet_id::ReservationId;

    const TOP: &str = "/Global/AWS/V4/Commercial/East/Production";

    fn cidr(s: &str) -> Ipv4Cidr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_writes_require_ipcontrol_lock() {
        let ipam = MemoryIpam::new();
        ipam.add_root_block(TOP, cidr("10.0.0.0/16")).await;
        let backend = MemoryBackend::new();
        let locks = backend
            .acquire_all(&ReservationId::new(), &[LockTarget::vpc("us-east-1", "vpc-1")])
            .await
            .unwrap();

        let mut ctx = AllocationContext::new(&ipam, &backend, &locks);
        assert!(matches!(
            ctx.add_container(TOP, "111-app").await,
            Err(IpamError::LockNotHeld)
        ));
        assert_eq!(ipam.write_count().await, 0);
    }

    #[tokio::test]
    async fn test_rollback_deletes_in_reverse() {
        let ipam = MemoryIpam::new();
        ipam.add_root_block(TOP, cidr("10.0.0.0/16")).await;
        let backend = MemoryBackend::new();
        let locks = backend
            .acquire_all(&ReservationId::new(), &[LockTarget::ipcontrol_write()])
            .await
            .unwrap();

        let mut ctx = AllocationContext::new(&ipam, &backend, &locks);
        let vpc = ctx.ensure_container(TOP, "111-app").await.unwrap();
        ctx.allocate_block(&vpc, 22, None).await.unwrap();
        let subnet = ctx.add_container(&vpc, "private-a").await.unwrap();
        ctx.allocate_block(&subnet, 24, None).await.unwrap();

        assert_eq!(ctx.rollback().await, 0);
        assert_eq!(ipam.container_paths().await, vec![TOP.to_string()]);
    }
}
