use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use vmop_types::{VirtualMachine, VmPool};

/// Per-VM coordination record: the last observed definition plus the
/// spec generation that was last fully reconciled. There is exactly one
/// channel per observed, non-deleted VM.
#[derive(Clone)]
pub struct VmChannel {
    pub definition: Arc<VirtualMachine>,
    pub last_applied_generation: Option<i64>,
}

/// In-memory registry of VM channels and known pools. The registry owns
/// the channels; an observed DELETE is the sole destructor trigger.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, VmChannel>>,
    pools: RwLock<HashMap<String, VmPool>>,
}

fn key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

impl ChannelRegistry {
    pub async fn get(&self, namespace: &str, name: &str) -> Option<VmChannel> {
        self.channels.read().await.get(&key(namespace, name)).cloned()
    }

    pub async fn put(&self, namespace: &str, name: &str, channel: VmChannel) {
        self.channels
            .write()
            .await
            .insert(key(namespace, name), channel);
    }

    /// Updates the stored definition, creating the channel on first
    /// observation. Returns true when the definition's generation has
    /// advanced past the last applied one, i.e. the event carries a spec
    /// change that still needs reconciling.
    pub async fn associate(
        &self,
        namespace: &str,
        name: &str,
        definition: Arc<VirtualMachine>,
    ) -> bool {
        let mut channels = self.channels.write().await;
        let generation = definition.metadata.generation;
        match channels.get_mut(&key(namespace, name)) {
            Some(channel) => {
                channel.definition = definition;
                match (channel.last_applied_generation, generation) {
                    (Some(applied), Some(observed)) => observed > applied,
                    _ => true,
                }
            }
            None => {
                channels.insert(
                    key(namespace, name),
                    VmChannel {
                        definition,
                        last_applied_generation: None,
                    },
                );
                true
            }
        }
    }

    /// Records that `generation` has been fully applied to the cluster.
    pub async fn mark_applied(&self, namespace: &str, name: &str, generation: Option<i64>) {
        if let Some(channel) = self.channels.write().await.get_mut(&key(namespace, name)) {
            channel.last_applied_generation = generation;
        }
    }

    pub async fn remove(&self, namespace: &str, name: &str) {
        self.channels.write().await.remove(&key(namespace, name));
    }

    pub async fn values(&self) -> Vec<VmChannel> {
        self.channels.read().await.values().cloned().collect()
    }

    pub async fn put_pool(&self, namespace: &str, name: &str, pool: VmPool) {
        self.pools.write().await.insert(key(namespace, name), pool);
    }

    pub async fn get_pool(&self, namespace: &str, name: &str) -> Option<VmPool> {
        self.pools.read().await.get(&key(namespace, name)).cloned()
    }

    pub async fn remove_pool(&self, namespace: &str, name: &str) {
        self.pools.write().await.remove(&key(namespace, name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use vmop_types::VmSpec;

    fn vm(name: &str, generation: i64) -> Arc<VirtualMachine> {
        Arc::new(VirtualMachine {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("default".to_owned()),
                generation: Some(generation),
                ..Default::default()
            },
            spec: VmSpec::default(),
            status: None,
        })
    }

    #[tokio::test]
    async fn first_observation_creates_the_channel() {
        let registry = ChannelRegistry::default();
        assert!(registry.associate("default", "vm-a", vm("vm-a", 1)).await);
        assert!(registry.get("default", "vm-a").await.is_some());
    }

    #[tokio::test]
    async fn applied_generation_short_circuits_stale_events() {
        let registry = ChannelRegistry::default();
        registry.associate("default", "vm-a", vm("vm-a", 1)).await;
        registry.mark_applied("default", "vm-a", Some(1)).await;

        // A status-only refresh carries the same generation.
        assert!(!registry.associate("default", "vm-a", vm("vm-a", 1)).await);
        // A spec edit advances it.
        assert!(registry.associate("default", "vm-a", vm("vm-a", 2)).await);
    }

    #[tokio::test]
    async fn remove_destroys_the_channel() {
        let registry = ChannelRegistry::default();
        registry.associate("default", "vm-a", vm("vm-a", 1)).await;
        registry.remove("default", "vm-a").await;
        assert!(registry.get("default", "vm-a").await.is_none());
        assert!(registry.values().await.is_empty());
    }

    #[tokio::test]
    async fn channels_are_scoped_by_namespace() {
        let registry = ChannelRegistry::default();
        registry.associate("a", "vm", vm("vm", 1)).await;
        registry.associate("b", "vm", vm("vm", 1)).await;
        assert_eq!(registry.values().await.len(), 2);
        registry.remove("a", "vm").await;
        assert!(registry.get("b", "vm").await.is_some());
    }
}
