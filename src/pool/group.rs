use std::time::Instant;

use log::debug;

use super::*;

/// One pooled transport plus the bookkeeping the sweep reads.
pub(crate) struct PooledMember {
    client: Arc<TransportClient>,
    created_at: Instant,
    last_used: Instant,
}

/// All transports sharing one reuse key. A member belongs to exactly one
/// group; eviction decisions are made here, group by group.
#[derive(Default)]
pub(crate) struct ClientGroup {
    members: Vec<PooledMember>,
}

impl ClientGroup {
    pub(crate) fn insert(&mut self, client: Arc<TransportClient>) {
        let now = Instant::now();
        self.members.push(PooledMember {
            client,
            created_at: now,
            last_used: now,
        });
    }

    /// Least-externally-referenced live member, or `None` when the group
    /// holds nothing usable. Ties go to the earliest-inserted member.
    pub(crate) fn fetch(&mut self) -> Option<Arc<TransportClient>> {
        let member = self
            .members
            .iter_mut()
            .filter(|m| m.client.is_connected())
            .min_by_key(|m| m.client.ref_count())?;
        member.last_used = Instant::now();
        Some(member.client.clone())
    }

    /// Drop every member that is dead or holds no references, returning the
    /// dropped clients so the caller can close them off the actor loop.
    pub(crate) fn recycle(&mut self) -> Vec<Arc<TransportClient>> {
        let mut evicted = Vec::new();
        self.members.retain(|m| {
            let keep = m.client.is_connected()
                && (m.client.ref_count() > 0 || m.client.self_ref_count() > 0);
            if !keep {
                debug!(
                    "evicting {} after {}s in pool, idle {}s",
                    m.client.identity(),
                    m.created_at.elapsed().as_secs(),
                    m.last_used.elapsed().as_secs()
                );
                evicted.push(m.client.clone());
            }
            keep
        });
        evicted
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AuthCredential, TargetEndpoint, TerminalOptions};

    fn stub(host: &str) -> Arc<TransportClient> {
        TransportClient::stub(
            TargetEndpoint::new(host, 22, "ops"),
            &AuthCredential::Password("pw".into()),
        )
    }

    #[tokio::test]
    async fn fetch_prefers_the_least_loaded_member() {
        let busy = stub("10.0.0.1");
        let idle = stub("10.0.0.2");
        let _session = busy.open_session(&TerminalOptions::default()).await.unwrap();

        let mut group = ClientGroup::default();
        group.insert(busy.clone());
        group.insert(idle.clone());

        let picked = group.fetch().unwrap();
        assert!(Arc::ptr_eq(&picked, &idle));
    }

    #[tokio::test]
    async fn recycle_keeps_referenced_members() {
        let held = stub("10.0.0.1");
        held.acquire_self();
        let loose = stub("10.0.0.2");

        let mut group = ClientGroup::default();
        group.insert(held);
        group.insert(loose.clone());

        let evicted = group.recycle();
        assert_eq!(evicted.len(), 1);
        assert!(Arc::ptr_eq(&evicted[0], &loose));
        assert_eq!(group.len(), 1);
    }

    #[tokio::test]
    async fn recycle_drops_dead_members_even_when_referenced() {
        let dead = stub("10.0.0.1");
        dead.acquire_self();
        dead.close().await;

        let mut group = ClientGroup::default();
        group.insert(dead);
        assert_eq!(group.recycle().len(), 1);
        assert!(group.is_empty());
    }
}
