#![forbid(unsafe_code)]

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reachability {
    Online,
    Offline,
}

/// Edge detector over reachability reports with a flap cooldown.
///
/// A transition that follows the previous accepted one within the cooldown is not acted on;
/// it is remembered and settled by [`ConnectivityMonitor::poll`] once the window has passed.
#[derive(Clone, Debug)]
pub struct ConnectivityMonitor {
    state: Reachability,
    cooldown_ms: i64,
    last_transition_ms: Option<i64>,
    pending: Option<Reachability>,
}

impl ConnectivityMonitor {
    pub fn new(initial: Reachability, cooldown_ms: u64) -> Self {
        Self {
            state: initial,
            cooldown_ms: i64::try_from(cooldown_ms).unwrap_or(i64::MAX),
            last_transition_ms: None,
            pending: None,
        }
    }

    pub fn state(&self) -> Reachability {
        self.state
    }

    pub fn is_online(&self) -> bool {
        self.state == Reachability::Online
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Returns true when this report is an accepted offline→online edge.
    pub fn observe(&mut self, reachability: Reachability, now_ms: i64) -> bool {
        if reachability == self.state {
            self.pending = None;
            return false;
        }
        let in_cooldown = self
            .last_transition_ms
            .is_some_and(|last| now_ms.saturating_sub(last) < self.cooldown_ms);
        if in_cooldown {
            self.pending = Some(reachability);
            tracing::debug!(to = ?reachability, "connectivity flap ignored");
            return false;
        }

        self.state = reachability;
        self.last_transition_ms = Some(now_ms);
        self.pending = None;
        tracing::info!(state = ?reachability, "connectivity changed");
        reachability == Reachability::Online
    }

    /// Settles a transition ignored during the cooldown. Same return as `observe`.
    pub fn poll(&mut self, now_ms: i64) -> bool {
        let Some(pending) = self.pending else {
            return false;
        };
        match self.last_transition_ms {
            Some(last) if now_ms.saturating_sub(last) < self.cooldown_ms => false,
            _ => self.observe(pending, now_ms),
        }
    }
}
