use std::fmt;

use tokio::sync::watch;

/// The lifecycle of a long-running component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::New => "New",
            ServiceState::Starting => "Starting",
            ServiceState::Running => "Running",
            ServiceState::Stopping => "Stopping",
            ServiceState::Terminated => "Terminated",
            ServiceState::Failed => "Failed",
        };
        write!(f, "{name}")
    }
}

/// A shared service state that can be observed by any number of tasks.
#[derive(Debug)]
pub struct ServiceStateCell {
    sender: watch::Sender<ServiceState>,
}

impl Default for ServiceStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceStateCell {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(ServiceState::New);
        Self { sender }
    }

    pub fn get(&self) -> ServiceState {
        *self.sender.borrow()
    }

    pub fn set(&self, state: ServiceState) {
        self.sender.send_replace(state);
    }

    /// Moves to the target state only if the current state is `from`.
    pub fn transition(&self, from: ServiceState, to: ServiceState) -> bool {
        self.sender.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Waits until the state satisfies the predicate and returns that state.
    pub async fn wait_for<F>(&self, predicate: F) -> ServiceState
    where
        F: Fn(ServiceState) -> bool,
    {
        let mut receiver = self.sender.subscribe();
        // The sender lives in `self`, so the receiver cannot observe a closed channel here.
        let state = match receiver.wait_for(|x| predicate(*x)).await {
            Ok(state) => *state,
            Err(_) => self.get(),
        };
        state
    }
}
