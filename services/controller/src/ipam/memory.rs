//! In-memory IPAM container tree.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use vnet_networking::{first_free_block, Ipv4Cidr};

use super::{parent_path, Container, Ipam, IpamError, IpamResult};

#[derive(Debug, Default, Clone)]
struct Node {
    blocks: Vec<Ipv4Cidr>,
    cloud_id: Option<String>,
}

#[derive(Debug, Default)]
struct Tree {
    containers: BTreeMap<String, Node>,
    writes: usize,
}

impl Tree {
    fn node(&self, path: &str) -> IpamResult<&Node> {
        self.containers.get(path).ok_or_else(|| IpamError::NotFound {
            path: path.to_string(),
        })
    }

    fn children(&self, path: &str) -> Vec<String> {
        self.containers
            .keys()
            .filter(|p| parent_path(p) == Some(path))
            .cloned()
            .collect()
    }

    /// Blocks already handed to children of `path`.
    fn used_by_children(&self, path: &str) -> Vec<Ipv4Cidr> {
        self.children(path)
            .iter()
            .filter_map(|c| self.containers.get(c))
            .flat_map(|n| n.blocks.iter().copied())
            .collect()
    }

    fn free_block(
        &self,
        parent: &str,
        prefix_len: u8,
        within: Option<Ipv4Cidr>,
    ) -> IpamResult<Option<Ipv4Cidr>> {
        let node = self.node(parent)?;
        let used = self.used_by_children(parent);
        Ok(node.blocks.iter().find_map(|block| {
            let range = match within {
                Some(w) if block.contains(&w) => w,
                Some(w) if w.contains(block) => *block,
                Some(_) => return None,
                None => *block,
            };
            first_free_block(&range, prefix_len, &used)
        }))
    }
}

/// IPAM backed by a shared in-process tree. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryIpam {
    tree: Arc<Mutex<Tree>>,
}

impl MemoryIpam {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a top-level container owning `cidr`.
    pub async fn add_root_block(&self, path: &str, cidr: Ipv4Cidr) {
        self.tree
            .lock()
            .await
            .containers
            .entry(path.to_string())
            .or_default()
            .blocks
            .push(cidr);
    }

    pub async fn container_paths(&self) -> Vec<String> {
        self.tree.lock().await.containers.keys().cloned().collect()
    }

    /// Number of write calls served so far.
    pub async fn write_count(&self) -> usize {
        self.tree.lock().await.writes
    }
}

#[async_trait]
impl Ipam for MemoryIpam {
    async fn get_container(&self, path: &str) -> IpamResult<Option<Container>> {
        let tree = self.tree.lock().await;
        Ok(tree.containers.get(path).map(|node| Container {
            path: path.to_string(),
            blocks: node.blocks.clone(),
            children: tree.children(path),
            cloud_id: node.cloud_id.clone(),
        }))
    }

    async fn add_container(&self, parent: &str, name: &str) -> IpamResult<String> {
        let mut tree = self.tree.lock().await;
        tree.node(parent)?;
        let path = format!("{parent}/{name}");
        if tree.containers.contains_key(&path) {
            return Err(IpamError::AlreadyExists { path });
        }
        tree.writes += 1;
        tree.containers.insert(path.clone(), Node::default());
        Ok(path)
    }

    async fn allocate_block(
        &self,
        container: &str,
        prefix_len: u8,
        within: Option<Ipv4Cidr>,
    ) -> IpamResult<Ipv4Cidr> {
        let mut tree = self.tree.lock().await;
        tree.node(container)?;
        let parent = parent_path(container).ok_or_else(|| IpamError::NotFound {
            path: format!("parent of {container}"),
        })?;
        let block = tree
            .free_block(parent, prefix_len, within)?
            .ok_or_else(|| IpamError::NoSpace {
                container: parent.to_string(),
                prefix_len,
            })?;
        tree.writes += 1;
        if let Some(node) = tree.containers.get_mut(container) {
            node.blocks.push(block);
        }
        Ok(block)
    }

    async fn has_available_space(&self, container: &str, prefix_len: u8) -> IpamResult<bool> {
        let tree = self.tree.lock().await;
        Ok(tree.free_block(container, prefix_len, None)?.is_some())
    }

    async fn delete_block(&self, cidr: &Ipv4Cidr) -> IpamResult<()> {
        let mut tree = self.tree.lock().await;
        let node = tree
            .containers
            .values_mut()
            .find(|n| n.blocks.contains(cidr))
            .ok_or(IpamError::BlockNotFound { cidr: *cidr })?;
        node.blocks.retain(|b| b != cidr);
        tree.writes += 1;
        Ok(())
    }

    async fn delete_container(&self, path: &str, with_blocks: bool) -> IpamResult<()> {
        let mut tree = self.tree.lock().await;
        let node = tree.node(path)?;
        if !tree.children(path).is_empty() || (!with_blocks && !node.blocks.is_empty()) {
            return Err(IpamError::NotEmpty {
                path: path.to_string(),
            });
        }
        tree.writes += 1;
        tree.containers.remove(path);
        Ok(())
    }

    async fn update_cloud_id(&self, path: &str, cloud_id: &str) -> IpamResult<()> {
        let mut tree = self.tree.lock().await;
        let node = tree
            .containers
            .get_mut(path)
            .ok_or_else(|| IpamError::NotFound {
                path: path.to_string(),
            })?;
        node.cloud_id = Some(cloud_id.to_string());
        tree.writes += 1;
        Ok(())
    }

    async fn find_block_container(&self, cidr: &Ipv4Cidr) -> IpamResult<Option<String>> {
        let tree = self.tree.lock().await;
        // A child's block can equal its parent's aggregate; the child holds it.
        Ok(tree
            .containers
            .iter()
            .filter(|(_, n)| n.blocks.contains(cidr))
            .max_by_key(|(path, _)| path.len())
            .map(|(path, _)| path.clone()))
    }
}
