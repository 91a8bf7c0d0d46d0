//! Per-peer bookkeeping: fault accounting and idle tracking.

use std::collections::{BTreeMap, VecDeque};

use sync_shared::ecs::PeerId;

/// What a rejected frame counts as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Unknown kind or poisoned stream.
    Malformed,
    /// Failed validation or sent in the wrong direction.
    Invalid,
    /// Tried to drive an entity the peer does not own.
    Unauthorized,
}

/// Rolling window of fault ticks.
#[derive(Debug, Clone)]
pub struct FaultWindow {
    history: VecDeque<u64>,
    max_faults: u32,
    window_ticks: u64,
}

impl FaultWindow {
    pub fn new(max_faults: u32, window_ticks: u64) -> Self {
        Self {
            history: VecDeque::new(),
            max_faults,
            window_ticks,
        }
    }

    fn prune(&mut self, tick: u64) {
        let cutoff = tick.saturating_sub(self.window_ticks);
        while let Some(&front) = self.history.front() {
            if front < cutoff {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Records a fault. Returns true once the window holds more than `max_faults`.
    pub fn record(&mut self, tick: u64) -> bool {
        self.prune(tick);
        self.history.push_back(tick);
        self.history.len() as u32 > self.max_faults
    }

    /// Faults currently inside the window.
    pub fn count(&mut self, tick: u64) -> u32 {
        self.prune(tick);
        self.history.len() as u32
    }
}

#[derive(Debug, Clone)]
pub struct PeerState {
    pub id: PeerId,
    pub connected_tick: u64,
    pub last_input_tick: u64,
    pub idle: bool,
    pub malformed: u32,
    pub invalid: u32,
    pub unauthorized: u32,
    faults: FaultWindow,
}

impl PeerState {
    /// Counts a fault. Returns true when the peer should be disconnected.
    pub fn record_fault(&mut self, kind: FaultKind, tick: u64) -> bool {
        match kind {
            FaultKind::Malformed => self.malformed += 1,
            FaultKind::Invalid => self.invalid += 1,
            FaultKind::Unauthorized => self.unauthorized += 1,
        }
        self.faults.record(tick)
    }

    pub fn recent_faults(&mut self, tick: u64) -> u32 {
        self.faults.count(tick)
    }
}

/// Connected peers in id order.
#[derive(Debug)]
pub struct PeerTable {
    peers: BTreeMap<PeerId, PeerState>,
    max_faults: u32,
    fault_window_ticks: u64,
}

impl PeerTable {
    pub fn new(max_faults: u32, fault_window_ticks: u64) -> Self {
        Self {
            peers: BTreeMap::new(),
            max_faults,
            fault_window_ticks,
        }
    }

    /// Adds a peer. Returns false if it was already connected.
    pub fn insert(&mut self, id: PeerId, tick: u64) -> bool {
        if self.peers.contains_key(&id) {
            return false;
        }
        self.peers.insert(
            id,
            PeerState {
                id,
                connected_tick: tick,
                last_input_tick: tick,
                idle: false,
                malformed: 0,
                invalid: 0,
                unauthorized: 0,
                faults: FaultWindow::new(self.max_faults, self.fault_window_ticks),
            },
        );
        true
    }

    pub fn remove(&mut self, id: PeerId) -> Option<PeerState> {
        self.peers.remove(&id)
    }

    pub fn is_connected(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn is_idle(&self, id: PeerId) -> bool {
        self.peers.get(&id).is_some_and(|p| p.idle)
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerState> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut PeerState> {
        self.peers.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerState> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Notes a valid input; clears the idle mark.
    pub fn mark_input(&mut self, id: PeerId, tick: u64) {
        if let Some(p) = self.peers.get_mut(&id) {
            p.last_input_tick = tick;
            p.idle = false;
        }
    }

    /// Flags peers whose last input is older than `idle_ticks`. Returns the
    /// peers that became idle on this call.
    pub fn update_idle(&mut self, tick: u64, idle_ticks: u64) -> Vec<PeerId> {
        let mut newly_idle = Vec::new();
        for p in self.peers.values_mut() {
            if !p.idle && tick.saturating_sub(p.last_input_tick) > idle_ticks {
                p.idle = true;
                newly_idle.push(p.id);
            }
        }
        newly_idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_trips_after_max_faults() {
        let mut w = FaultWindow::new(2, 10);
        assert!(!w.record(0));
        assert!(!w.record(1));
        assert!(w.record(2));
    }

    #[test]
    fn old_faults_roll_out() {
        let mut w = FaultWindow::new(2, 10);
        w.record(0);
        w.record(1);
        assert!(!w.record(20), "faults older than the window no longer count");
        assert_eq!(w.count(20), 1);
    }

    #[test]
    fn counters_split_by_kind() {
        let mut table = PeerTable::new(8, 100);
        let p = PeerId(1);
        table.insert(p, 0);
        let state = table.get_mut(p).unwrap();
        state.record_fault(FaultKind::Malformed, 0);
        state.record_fault(FaultKind::Unauthorized, 0);
        state.record_fault(FaultKind::Unauthorized, 1);
        assert_eq!((state.malformed, state.invalid, state.unauthorized), (1, 0, 2));
        assert_eq!(state.recent_faults(1), 3);
    }

    #[test]
    fn idle_after_quiet_period_and_cleared_by_input() {
        let mut table = PeerTable::new(8, 100);
        let p = PeerId(1);
        table.insert(p, 0);
        assert!(table.update_idle(5, 5).is_empty());
        assert_eq!(table.update_idle(6, 5), vec![p]);
        assert!(table.is_idle(p));
        assert!(table.update_idle(7, 5).is_empty(), "only reported once");
        table.mark_input(p, 7);
        assert!(!table.is_idle(p));
    }

    #[test]
    fn duplicate_insert_is_refused() {
        let mut table = PeerTable::new(8, 100);
        assert!(table.insert(PeerId(3), 0));
        assert!(!table.insert(PeerId(3), 1));
        assert_eq!(table.len(), 1);
    }
}
