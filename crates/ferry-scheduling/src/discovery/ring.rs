use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info};
use tokio_util::sync::CancellationToken;

use crate::discovery::{notify_changes, Instance, Notifications};
use crate::error::SchedulingResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Pending,
    Joining,
    Active,
    Leaving,
}

#[derive(Debug, Clone)]
pub struct RingMember {
    pub id: String,
    pub address: String,
    pub state: MemberState,
    pub heartbeat: Instant,
}

/// A membership ring shared by the schedulers.
/// Implementations backed by an external store plug in through this trait.
#[tonic::async_trait]
pub trait Ring: Send + Sync {
    /// Returns the active members whose heartbeat has not timed out.
    async fn healthy_members(&self) -> SchedulingResult<Vec<RingMember>>;

    /// Adds or updates the member and refreshes its heartbeat.
    async fn heartbeat(&self, member: RingMember) -> SchedulingResult<()>;

    async fn remove(&self, id: &str) -> SchedulingResult<()>;
}

/// A ring kept in process memory.
#[derive(Debug)]
pub struct InMemoryRing {
    members: Mutex<HashMap<String, RingMember>>,
    heartbeat_timeout: Duration,
}

impl InMemoryRing {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            members: Mutex::new(HashMap::new()),
            heartbeat_timeout,
        }
    }
}

#[tonic::async_trait]
impl Ring for InMemoryRing {
    async fn healthy_members(&self) -> SchedulingResult<Vec<RingMember>> {
        let now = Instant::now();
        let members = self.members.lock()?;
        Ok(members
            .values()
            .filter(|m| {
                m.state == MemberState::Active
                    && (self.heartbeat_timeout.is_zero()
                        || now.saturating_duration_since(m.heartbeat) <= self.heartbeat_timeout)
            })
            .cloned()
            .collect())
    }

    async fn heartbeat(&self, member: RingMember) -> SchedulingResult<()> {
        let mut members = self.members.lock()?;
        members.insert(member.id.clone(), member);
        Ok(())
    }

    async fn remove(&self, id: &str) -> SchedulingResult<()> {
        let mut members = self.members.lock()?;
        members.remove(id);
        Ok(())
    }
}

/// Returns the addresses to mark as in use.
/// Every address is in use without a limit, otherwise the first addresses in sorted order.
pub fn select_in_use_instances(mut addresses: Vec<String>, max_used_instances: usize) -> Vec<String> {
    if max_used_instances == 0 || addresses.len() <= max_used_instances {
        return addresses;
    }
    addresses.sort();
    addresses.truncate(max_used_instances);
    addresses
}

fn ring_instances(members: Vec<RingMember>, max_used_instances: usize) -> HashMap<String, Instance> {
    let addresses = members.into_iter().map(|m| m.address).collect::<Vec<_>>();
    let in_use = select_in_use_instances(addresses.clone(), max_used_instances);
    addresses
        .into_iter()
        .map(|address| {
            let instance = Instance::new(address.clone(), in_use.contains(&address));
            (address, instance)
        })
        .collect()
}

/// Polls the ring and notifies the receiver about the changes of the healthy members.
pub struct RingServiceDiscovery {
    ring: Arc<dyn Ring>,
    max_used_instances: usize,
    check_period: Duration,
    receiver: Arc<dyn Notifications>,
    instances: HashMap<String, Instance>,
}

impl RingServiceDiscovery {
    pub fn new(
        ring: Arc<dyn Ring>,
        max_used_instances: usize,
        check_period: Duration,
        receiver: Arc<dyn Notifications>,
    ) -> Self {
        Self {
            ring,
            max_used_instances,
            check_period,
            receiver,
            instances: HashMap::new(),
        }
    }

    pub async fn run(mut self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.check_period);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.check().await {
                        error!("failed to check the ring: {e}");
                    }
                }
            }
        }
        debug!("ring service discovery stopped");
    }

    async fn check(&mut self) -> SchedulingResult<()> {
        let members = self.ring.healthy_members().await?;
        let instances = ring_instances(members, self.max_used_instances);
        notify_changes(self.receiver.as_ref(), &self.instances, &instances).await;
        self.instances = instances;
        Ok(())
    }
}

/// Keeps a member registered in the ring while it runs.
pub struct RingLifecycler {
    ring: Arc<dyn Ring>,
    id: String,
    address: String,
    heartbeat_period: Duration,
}

impl RingLifecycler {
    pub fn new(
        ring: Arc<dyn Ring>,
        id: impl Into<String>,
        address: impl Into<String>,
        heartbeat_period: Duration,
    ) -> Self {
        Self {
            ring,
            id: id.into(),
            address: address.into(),
            heartbeat_period,
        }
    }

    fn member(&self, state: MemberState) -> RingMember {
        RingMember {
            id: self.id.clone(),
            address: self.address.clone(),
            state,
            heartbeat: Instant::now(),
        }
    }

    /// Registers the member as active.
    pub async fn join(&self) -> SchedulingResult<()> {
        self.ring.heartbeat(self.member(MemberState::Active)).await?;
        info!("joined the ring as {} ({})", self.id, self.address);
        Ok(())
    }

    /// Sends heartbeats until the token is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.heartbeat_period);
        // The first tick completes immediately and the member has just joined.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.ring.heartbeat(self.member(MemberState::Active)).await {
                        error!("failed to send ring heartbeat: {e}");
                    }
                }
            }
        }
    }

    /// Marks the member as leaving and removes it from the ring.
    pub async fn leave(&self) -> SchedulingResult<()> {
        self.ring.heartbeat(self.member(MemberState::Leaving)).await?;
        self.ring.remove(&self.id).await?;
        info!("left the ring as {}", self.id);
        Ok(())
    }
}
