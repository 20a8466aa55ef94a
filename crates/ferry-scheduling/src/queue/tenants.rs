use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use twox_hash::XxHash64;

/// A cursor into the round-robin tenant slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantIndex(isize);

impl TenantIndex {
    /// The cursor of a querier that has not dequeued anything yet.
    pub fn first() -> Self {
        Self(-1)
    }

    /// Moves the cursor back one slot so that the same tenant is tried again.
    pub fn reuse_last_tenant(self) -> Self {
        if self.0 >= 0 {
            Self(self.0 - 1)
        } else {
            self
        }
    }
}

pub(super) struct TenantQueue<T> {
    pub(super) requests: VecDeque<T>,
    max_queriers: usize,
    /// The queriers that can serve the tenant, or `None` if every querier can.
    queriers: Option<HashSet<String>>,
    seed: u64,
}

#[derive(Debug, Default)]
struct QuerierConnections {
    connections: usize,
    shutting_down: bool,
    disconnected_at: Option<Instant>,
}

/// The per-tenant queues and the querier connections used for shuffle sharding.
pub(super) struct TenantQueues<T> {
    queues: HashMap<String, TenantQueue<T>>,
    /// Tenant slots for round-robin selection. A removed tenant leaves a hole.
    tenants: Vec<Option<String>>,
    queriers: HashMap<String, QuerierConnections>,
    sorted_queriers: Vec<String>,
    forget_delay: Duration,
}

impl<T> TenantQueues<T> {
    pub(super) fn new(forget_delay: Duration) -> Self {
        Self {
            queues: HashMap::new(),
            tenants: vec![],
            queriers: HashMap::new(),
            sorted_queriers: vec![],
            forget_delay,
        }
    }

    pub(super) fn len(&self) -> usize {
        self.queues.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub(super) fn request_count(&self) -> usize {
        self.queues.values().map(|q| q.requests.len()).sum()
    }

    pub(super) fn get_or_add_queue(
        &mut self,
        tenant: &str,
        max_queriers: usize,
    ) -> Option<&mut TenantQueue<T>> {
        if tenant.is_empty() {
            return None;
        }
        if !self.queues.contains_key(tenant) {
            match self.tenants.iter_mut().find(|slot| slot.is_none()) {
                Some(slot) => *slot = Some(tenant.to_string()),
                None => self.tenants.push(Some(tenant.to_string())),
            }
            let queue = TenantQueue {
                requests: VecDeque::new(),
                max_queriers: 0,
                queriers: None,
                seed: XxHash64::oneshot(0, tenant.as_bytes()),
            };
            self.queues.insert(tenant.to_string(), queue);
        }
        let sorted_queriers = &self.sorted_queriers;
        let queue = self.queues.get_mut(tenant)?;
        if queue.max_queriers != max_queriers {
            queue.max_queriers = max_queriers;
            queue.queriers = shuffle_queriers_for_tenant(queue.seed, max_queriers, sorted_queriers);
        }
        Some(queue)
    }

    /// Finds the next tenant after the cursor whose queue can be served by the querier.
    /// Returns the tenant and its slot, or the unchanged cursor if there is none.
    pub(super) fn next_tenant_for_querier(
        &self,
        last: TenantIndex,
        querier_id: &str,
    ) -> Result<(String, TenantIndex), TenantIndex> {
        let count = self.tenants.len() as isize;
        let mut index = last.0;
        for _ in 0..count {
            index += 1;
            if index >= count {
                index = 0;
            }
            let Some(tenant) = &self.tenants[index as usize] else {
                continue;
            };
            let Some(queue) = self.queues.get(tenant) else {
                continue;
            };
            if let Some(queriers) = &queue.queriers {
                if !queriers.contains(querier_id) {
                    continue;
                }
            }
            return Ok((tenant.clone(), TenantIndex(index)));
        }
        Err(TenantIndex(index))
    }

    pub(super) fn queue_mut(&mut self, tenant: &str) -> Option<&mut TenantQueue<T>> {
        self.queues.get_mut(tenant)
    }

    pub(super) fn delete_queue(&mut self, tenant: &str) {
        if self.queues.remove(tenant).is_none() {
            return;
        }
        if let Some(slot) = self
            .tenants
            .iter_mut()
            .find(|slot| slot.as_deref() == Some(tenant))
        {
            *slot = None;
        }
        while matches!(self.tenants.last(), Some(None)) {
            self.tenants.pop();
        }
    }

    pub(super) fn add_querier_connection(&mut self, querier_id: &str) {
        if let Some(info) = self.queriers.get_mut(querier_id) {
            info.connections += 1;
            // The querier reconnected within the forget delay.
            info.shutting_down = false;
            info.disconnected_at = None;
            return;
        }
        self.queriers.insert(
            querier_id.to_string(),
            QuerierConnections {
                connections: 1,
                ..Default::default()
            },
        );
        if let Err(index) = self.sorted_queriers.binary_search_by(|x| x.as_str().cmp(querier_id)) {
            self.sorted_queriers.insert(index, querier_id.to_string());
        }
        self.recompute_tenant_queriers();
    }

    pub(super) fn remove_querier_connection(&mut self, querier_id: &str, now: Instant) {
        let Some(info) = self.queriers.get_mut(querier_id) else {
            return;
        };
        info.connections = info.connections.saturating_sub(1);
        if info.connections > 0 {
            return;
        }
        if info.shutting_down || self.forget_delay.is_zero() {
            self.remove_querier(querier_id);
        } else {
            info.disconnected_at = Some(now);
        }
    }

    pub(super) fn notify_querier_shutdown(&mut self, querier_id: &str) {
        let Some(info) = self.queriers.get_mut(querier_id) else {
            return;
        };
        if info.connections == 0 {
            self.remove_querier(querier_id);
        } else {
            info.shutting_down = true;
        }
    }

    /// Removes the disconnected queriers whose forget delay has elapsed.
    pub(super) fn forget_disconnected_queriers(&mut self, now: Instant) -> usize {
        if self.forget_delay.is_zero() {
            return 0;
        }
        let forgotten = self
            .queriers
            .iter()
            .filter(|(_, info)| {
                info.connections == 0
                    && info
                        .disconnected_at
                        .is_some_and(|t| now.saturating_duration_since(t) >= self.forget_delay)
            })
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        for querier_id in &forgotten {
            self.remove_querier(querier_id);
        }
        forgotten.len()
    }

    #[cfg(test)]
    fn querier_count(&self) -> usize {
        self.queriers.len()
    }

    fn remove_querier(&mut self, querier_id: &str) {
        self.queriers.remove(querier_id);
        if let Ok(index) = self.sorted_queriers.binary_search_by(|x| x.as_str().cmp(querier_id)) {
            self.sorted_queriers.remove(index);
        }
        self.recompute_tenant_queriers();
    }

    fn recompute_tenant_queriers(&mut self) {
        for queue in self.queues.values_mut() {
            queue.queriers =
                shuffle_queriers_for_tenant(queue.seed, queue.max_queriers, &self.sorted_queriers);
        }
    }

    #[cfg(test)]
    pub(super) fn queriers_for_tenant(&self, tenant: &str) -> Option<Option<&HashSet<String>>> {
        self.queues.get(tenant).map(|q| q.queriers.as_ref())
    }
}

/// Selects a deterministic subset of the queriers for the tenant.
/// Returns `None` when the tenant can use every querier.
fn shuffle_queriers_for_tenant(
    seed: u64,
    count: usize,
    sorted_queriers: &[String],
) -> Option<HashSet<String>> {
    if count == 0 || sorted_queriers.len() <= count {
        return None;
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut candidates = sorted_queriers.to_vec();
    let mut result = HashSet::with_capacity(count);
    let mut last = candidates.len() - 1;
    for _ in 0..count {
        let index = rng.random_range(0..=last);
        result.insert(candidates[index].clone());
        candidates.swap(index, last);
        last = last.saturating_sub(1);
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queues() -> TenantQueues<u64> {
        TenantQueues::new(Duration::ZERO)
    }

    #[test]
    fn test_tenant_slots_reuse_holes() {
        let mut q = queues();
        for tenant in ["a", "b", "c"] {
            assert!(q.get_or_add_queue(tenant, 0).is_some());
        }
        q.delete_queue("b");
        assert_eq!(q.tenants, vec![Some("a".to_string()), None, Some("c".to_string())]);
        assert!(q.get_or_add_queue("d", 0).is_some());
        assert_eq!(q.tenants[1].as_deref(), Some("d"));
        q.delete_queue("c");
        q.delete_queue("d");
        assert_eq!(q.tenants, vec![Some("a".to_string())]);
        assert!(q.get_or_add_queue("", 0).is_none());
    }

    #[test]
    fn test_next_tenant_round_robin() {
        let mut q = queues();
        q.add_querier_connection("querier-1");
        for tenant in ["a", "b", "c"] {
            q.get_or_add_queue(tenant, 0);
        }
        let mut last = TenantIndex::first();
        let mut seen = vec![];
        for _ in 0..4 {
            let (tenant, index) = q.next_tenant_for_querier(last, "querier-1").unwrap();
            seen.push(tenant);
            last = index;
        }
        assert_eq!(seen, vec!["a", "b", "c", "a"]);

        let (tenant, _) = q
            .next_tenant_for_querier(last.reuse_last_tenant(), "querier-1")
            .unwrap();
        assert_eq!(tenant, "a");
    }

    #[test]
    fn test_shuffle_sharding() {
        let mut q = queues();
        for i in 0..10 {
            q.add_querier_connection(&format!("querier-{i}"));
        }
        q.get_or_add_queue("a", 3);
        let selected = q.queriers_for_tenant("a").flatten().cloned().unwrap();
        assert_eq!(selected.len(), 3);

        // The selection is stable for the same set of queriers.
        q.get_or_add_queue("a", 0);
        q.get_or_add_queue("a", 3);
        assert_eq!(q.queriers_for_tenant("a").flatten(), Some(&selected));

        let allowed = selected.iter().next().unwrap().clone();
        let denied = (0..10)
            .map(|i| format!("querier-{i}"))
            .find(|x| !selected.contains(x))
            .unwrap();
        assert!(q.next_tenant_for_querier(TenantIndex::first(), &allowed).is_ok());
        assert!(q.next_tenant_for_querier(TenantIndex::first(), &denied).is_err());

        // Sharding is disabled when there are not enough queriers.
        q.get_or_add_queue("b", 10);
        assert_eq!(q.queriers_for_tenant("b"), Some(None));
    }

    #[test]
    fn test_forget_delay() {
        let mut q = TenantQueues::<u64>::new(Duration::from_secs(60));
        let now = Instant::now();
        q.add_querier_connection("querier-1");
        q.add_querier_connection("querier-2");
        q.remove_querier_connection("querier-1", now);
        assert_eq!(q.querier_count(), 2);
        assert_eq!(q.forget_disconnected_queriers(now + Duration::from_secs(30)), 0);
        assert_eq!(q.forget_disconnected_queriers(now + Duration::from_secs(61)), 1);
        assert_eq!(q.querier_count(), 1);

        // Reconnecting within the delay clears the disconnection mark.
        q.remove_querier_connection("querier-2", now);
        q.add_querier_connection("querier-2");
        assert_eq!(q.forget_disconnected_queriers(now + Duration::from_secs(61)), 0);
        assert_eq!(q.querier_count(), 1);
    }

    #[test]
    fn test_notify_querier_shutdown() {
        let mut q = TenantQueues::<u64>::new(Duration::from_secs(60));
        q.add_querier_connection("querier-1");
        q.notify_querier_shutdown("querier-1");
        assert_eq!(q.querier_count(), 1);
        q.remove_querier_connection("querier-1", Instant::now());
        assert_eq!(q.querier_count(), 0);

        q.add_querier_connection("querier-2");
        q.remove_querier_connection("querier-2", Instant::now());
        assert_eq!(q.querier_count(), 1);
        q.notify_querier_shutdown("querier-2");
        assert_eq!(q.querier_count(), 0);
    }
}
