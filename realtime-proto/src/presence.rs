use std::collections::BTreeMap;

use tracing::trace;

use crate::protocol::{PresenceAction, PresenceMessage};

/// Members of one channel, reconciled through the paged SYNC exchange
///
/// While a sync is running, updates accumulate in a staging map; `members` keeps exposing the
/// result of the previous completed sync until the last page arrives.
#[derive(Debug, Default)]
pub(crate) struct PresenceMap {
    members: BTreeMap<String, PresenceMessage>,
    staging: Option<BTreeMap<String, PresenceMessage>>,
    sync_complete: bool,
}

impl PresenceMap {
    pub(crate) fn sync_complete(&self) -> bool {
        self.sync_complete
    }

    /// Members as of the last completed sync, ordered by member key
    pub(crate) fn members(&self) -> impl Iterator<Item = &PresenceMessage> {
        self.members.values()
    }

    pub(crate) fn start_sync(&mut self) {
        trace!("presence sync started");
        self.staging = Some(BTreeMap::new());
        self.sync_complete = false;
    }

    /// Apply a live presence event; returns whether it should be emitted now
    ///
    /// During a sync the event is only staged and reported by `end_sync`.
    pub(crate) fn apply(&mut self, msg: &PresenceMessage) -> bool {
        let syncing = self.staging.is_some();
        let map = self.staging.as_mut().unwrap_or(&mut self.members);
        let key = msg.member_key();
        if let Some(existing) = map.get(&key) {
            if !msg.is_newer_than(existing) {
                trace!(member = %key, "stale presence event ignored");
                return false;
            }
        }
        match msg.action {
            // Recorded during a sync so an older SYNC entry cannot resurrect the member
            PresenceAction::Leave | PresenceAction::Absent if syncing => {
                map.insert(key, msg.clone());
            }
            PresenceAction::Leave | PresenceAction::Absent => {
                map.remove(&key);
            }
            _ if syncing => {
                map.insert(key, msg.clone());
            }
            _ => {
                let mut member = msg.clone();
                member.action = PresenceAction::Present;
                map.insert(key, member);
            }
        }
        !syncing
    }

    /// Apply one SYNC page; returns the resulting events once the final page has been applied
    ///
    /// `channel_serial` has the form `<sequence>:<cursor>`; an empty or missing cursor marks the
    /// last page.
    pub(crate) fn apply_sync_page(
        &mut self,
        channel_serial: Option<&str>,
        page: &[PresenceMessage],
    ) -> Option<Vec<PresenceMessage>> {
        if self.staging.is_none() {
            self.start_sync();
        }
        for msg in page {
            self.apply(msg);
        }
        let more = channel_serial
            .and_then(|s| s.split_once(':'))
            .is_some_and(|(_, cursor)| !cursor.is_empty());
        match more {
            true => None,
            false => Some(self.end_sync()),
        }
    }

    /// Complete the running sync and publish the staged member set
    ///
    /// Returns one event per member that is new or changed, carrying the staged action, and one
    /// `Leave` per previous member missing from the new set. A live leave staged during the sync
    /// is reported as received; otherwise the leave is synthesized.
    pub(crate) fn end_sync(&mut self) -> Vec<PresenceMessage> {
        let staged = self.staging.take().unwrap_or_default();
        let mut events = Vec::new();
        let mut next = BTreeMap::new();
        let mut departed = BTreeMap::new();
        for (key, mut member) in staged {
            if let PresenceAction::Leave | PresenceAction::Absent = member.action {
                departed.insert(key, member);
                continue;
            }
            let event = member.clone();
            member.action = PresenceAction::Present;
            if self.members.get(&key) != Some(&member) {
                events.push(event);
            }
            next.insert(key, member);
        }
        let previous = std::mem::replace(&mut self.members, next);
        for (key, mut member) in previous {
            if self.members.contains_key(&key) {
                continue;
            }
            match departed.remove(&key) {
                Some(mut leave) => {
                    leave.action = PresenceAction::Leave;
                    events.push(leave);
                }
                None => {
                    member.action = PresenceAction::Leave;
                    member.id = None;
                    events.push(member);
                }
            }
        }
        self.sync_complete = true;
        trace!(members = self.members.len(), "presence sync complete");
        events
    }

    /// Attached without presence: the channel has no members
    pub(crate) fn end_sync_empty(&mut self) -> Vec<PresenceMessage> {
        self.staging = Some(BTreeMap::new());
        self.end_sync()
    }

    /// Mark the current member set as authoritative without a sync
    pub(crate) fn keep(&mut self) {
        self.staging = None;
        self.sync_complete = true;
    }

    pub(crate) fn clear(&mut self) {
        self.members.clear();
        self.staging = None;
        self.sync_complete = false;
    }
}
