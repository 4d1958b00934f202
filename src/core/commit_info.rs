//! Per-peer last-known committed index, folded from AppendEntries
//! piggybacks and appender replies. Values only ever advance.

use dashmap::DashMap;

use crate::protocol::CommitInfo;
use crate::protocol::LogIndex;
use crate::protocol::PeerId;

#[derive(Default)]
pub struct CommitInfoCache {
    cache: DashMap<PeerId, LogIndex>,
}

impl CommitInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `committed_index` for `peer`, keeping the maximum seen, and
    /// returns the resulting info.
    pub fn update(&self, peer: PeerId, committed_index: LogIndex) -> CommitInfo {
        let mut current = self.cache.entry(peer.clone()).or_insert(0);
        if committed_index > *current {
            *current = committed_index;
        }
        CommitInfo {
            peer,
            committed_index: *current,
        }
    }

    pub fn fold(&self, infos: &[CommitInfo]) {
        for info in infos {
            self.update(info.peer.clone(), info.committed_index);
        }
    }

    pub fn get(&self, peer: &PeerId) -> Option<CommitInfo> {
        self.cache.get(peer).map(|i| CommitInfo {
            peer: peer.clone(),
            committed_index: *i,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_is_monotonic() {
        let cache = CommitInfoCache::new();
        let peer = PeerId::from("n1");

        assert_eq!(cache.update(peer.clone(), 5).committed_index, 5);
        assert_eq!(cache.update(peer.clone(), 3).committed_index, 5);
        assert_eq!(cache.update(peer.clone(), 9).committed_index, 9);
        assert_eq!(cache.get(&peer).unwrap().committed_index, 9);
    }

    #[test]
    fn test_unknown_peer() {
        let cache = CommitInfoCache::new();
        assert!(cache.get(&PeerId::from("nope")).is_none());
    }
}
