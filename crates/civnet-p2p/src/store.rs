use civnet_core::types::PeerId;
use civnet_core::PeerRecord;

/// What `PeerStore::upsert` learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// Never seen before.
    New,
    /// Known peer, this many new addresses.
    Updated(usize),
    Unchanged,
}

impl Upsert {
    /// Whether the sighting told us anything new.
    pub fn is_fresh(self) -> bool {
        !matches!(self, Upsert::Unchanged)
    }
}

/// Address book of discovered peers, in discovery order.
///
/// Records are keyed by peer id. A record without an id matches another
/// id-less record sharing any of its addresses.
#[derive(Debug, Default)]
pub struct PeerStore {
    records: Vec<PeerRecord>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn position(&self, record: &PeerRecord) -> Option<usize> {
        self.records.iter().position(|known| match (known.peer_id, record.peer_id) {
            (Some(a), Some(b)) => a == b,
            (None, None) => known.addrs.iter().any(|a| record.addrs.contains(a)),
            _ => false,
        })
    }

    /// Merge a sighting into the store. Returns the outcome together with
    /// the merged record.
    pub fn upsert(&mut self, record: PeerRecord) -> (Upsert, PeerRecord) {
        match self.position(&record) {
            Some(i) => {
                let known = &mut self.records[i];
                let added = known.merge(&record);
                let outcome = if added > 0 { Upsert::Updated(added) } else { Upsert::Unchanged };
                (outcome, known.clone())
            }
            None => {
                self.records.push(record.clone());
                (Upsert::New, record)
            }
        }
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerRecord> {
        self.records.iter().find(|r| r.peer_id.as_ref() == Some(peer))
    }

    /// Drop everything known about `peer`. Returns whether it was known.
    pub fn forget(&mut self, peer: &PeerId) -> bool {
        let before = self.records.len();
        self.records.retain(|r| r.peer_id.as_ref() != Some(peer));
        self.records.len() != before
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Dial candidates, oldest first.
    pub fn candidates(&self) -> Vec<PeerRecord> {
        self.records.clone()
    }
}
