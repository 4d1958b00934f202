//! Group configuration view: the committed peer set, the optional joint
//! (old + new) set during a membership change, and the quorum math over
//! both halves.


use std::collections::BTreeMap;
use std::collections::HashSet;

use rand::seq::IteratorRandom;

use crate::utils::cluster::is_majority;

use crate::protocol::ConfPayload;
use crate::protocol::LogIndex;
use crate::protocol::PeerId;
use crate::protocol::RaftPeer;

/// The configuration this peer currently operates under.
///
/// `log_entry_index` is the index of the configuration entry this view was
/// folded from; 0 for the bootstrap configuration. The view counts as
/// committed once that index is at or below the commit index.
#[derive(Clone, Debug)]
pub struct RaftConfiguration {
    log_entry_index: LogIndex,
    conf: BTreeMap<PeerId, RaftPeer>,
    /// Non-empty only while a joint configuration is pending.
    old_conf: BTreeMap<PeerId, RaftPeer>,
}

impl RaftConfiguration {
    /// Bootstrap configuration, not backed by a log entry.
    pub fn new(peers: Vec<RaftPeer>) -> Self {
        Self {
            log_entry_index: 0,
            conf: Self::index_peers(peers),
            old_conf: BTreeMap::new(),
        }
    }

    /// Fold a configuration entry into a new view.
    pub fn from_entry(log_entry_index: LogIndex, payload: &ConfPayload) -> Self {
        Self {
            log_entry_index,
            conf: Self::index_peers(payload.peers.clone()),
            old_conf: Self::index_peers(payload.old_peers.clone()),
        }
    }

    fn index_peers(peers: Vec<RaftPeer>) -> BTreeMap<PeerId, RaftPeer> {
        peers.into_iter().map(|p| (p.id.clone(), p)).collect()
    }

    pub fn log_entry_index(&self) -> LogIndex {
        self.log_entry_index
    }

    /// True iff no joint configuration is pending.
    pub fn is_stable(&self) -> bool {
        self.old_conf.is_empty()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.conf.contains_key(id)
    }

    pub fn contains_in_old(&self, id: &PeerId) -> bool {
        self.old_conf.contains_key(id)
    }

    pub fn get_peer(&self, id: &PeerId) -> Option<&RaftPeer> {
        self.conf.get(id).or_else(|| self.old_conf.get(id))
    }

    /// Peers of the current configuration only.
    pub fn conf_peers(&self) -> Vec<RaftPeer> {
        self.conf.values().cloned().collect()
    }

    /// Union of current and old peers, deduplicated.
    pub fn all_peers(&self) -> Vec<RaftPeer> {
        let mut peers = self.conf.clone();
        for (id, peer) in &self.old_conf {
            peers.entry(id.clone()).or_insert_with(|| peer.clone());
        }
        peers.into_values().collect()
    }

    /// Everyone this peer must talk to, excluding itself.
    pub fn other_peers(&self, self_id: &PeerId) -> Vec<RaftPeer> {
        self.all_peers().into_iter().filter(|p| &p.id != self_id).collect()
    }

    /// A strict majority in the current conf, and in the old conf as well
    /// while a joint configuration is pending.
    pub fn has_majority(&self, acks: &HashSet<PeerId>) -> bool {
        Self::majority_of(&self.conf, acks) && (self.old_conf.is_empty() || Self::majority_of(&self.old_conf, acks))
    }

    fn majority_of(half: &BTreeMap<PeerId, RaftPeer>, acks: &HashSet<PeerId>) -> bool {
        if half.is_empty() {
            return true;
        }
        let granted = half.keys().filter(|id| acks.contains(*id)).count();
        is_majority(granted, half.len())
    }

    /// Highest index replicated to a majority of the current conf (and of
    /// the old conf while joint). `index_of` maps every peer to the index
    /// known replicated on it.
    pub fn majority_replicated_index(&self, index_of: impl Fn(&PeerId) -> LogIndex) -> LogIndex {
        let new_half = Self::half_majority_index(&self.conf, &index_of);
        if self.old_conf.is_empty() {
            new_half
        } else {
            new_half.min(Self::half_majority_index(&self.old_conf, &index_of))
        }
    }

    fn half_majority_index(
        half: &BTreeMap<PeerId, RaftPeer>,
        index_of: &impl Fn(&PeerId) -> LogIndex,
    ) -> LogIndex {
        if half.is_empty() {
            return u64::MAX;
        }
        let mut indices: Vec<LogIndex> = half.keys().map(index_of).collect();
        indices.sort_unstable();
        // With n peers, the entry at (n-1)/2 (0-based, ascending) is
        // replicated on a strict majority.
        indices[(indices.len() - 1) / 2]
    }

    /// Suggests a peer other than `exclude`, for NotLeader hints.
    pub fn random_peer(&self, exclude: &PeerId) -> Option<RaftPeer> {
        let mut rng = rand::thread_rng();
        self.conf
            .values()
            .filter(|p| &p.id != exclude)
            .choose(&mut rng)
            .cloned()
    }

    /// True when `new_peers` equals the current stable peer set.
    pub fn has_no_change(&self, new_peers: &[RaftPeer]) -> bool {
        if !self.is_stable() || self.conf.len() != new_peers.len() {
            return false;
        }
        new_peers
            .iter()
            .all(|p| self.conf.get(&p.id).map(|cur| cur == p).unwrap_or(false))
    }

    pub fn to_payload(&self) -> ConfPayload {
        ConfPayload {
            peers: self.conf.values().cloned().collect(),
            old_peers: self.old_conf.values().cloned().collect(),
        }
    }
}
