//! Outbound job correlation for one connection.

use crate::event::NetMessage;
use cm_common::types::JOBID_NONE;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Maps allocated source job ids to their response channels.
///
/// Ids are allocated by pre-incrementing a counter that starts at zero, so
/// the first job of every connection is 1. [`JOBID_NONE`] is reserved by the
/// protocol and is never allocated or looked up.
#[derive(Debug, Default)]
pub(crate) struct JobRegistry {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<NetMessage>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh source job id and registers the response channel.
    pub fn alloc(&mut self, tx: oneshot::Sender<NetMessage>) -> u64 {
        self.next_id += 1;
        self.pending.insert(self.next_id, tx);
        self.next_id
    }

    /// Removes and returns the channel registered under `id`, if any.
    pub fn take(&mut self, id: u64) -> Option<oneshot::Sender<NetMessage>> {
        if id == JOBID_NONE {
            return None;
        }
        self.pending.remove(&id)
    }

    /// Drops all pending channels without invoking them. Receivers observe
    /// the drop as a recv error.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_common::Header;

    fn channel() -> (
        oneshot::Sender<NetMessage>,
        oneshot::Receiver<NetMessage>,
    ) {
        oneshot::channel()
    }

    #[test]
    fn ids_are_monotonic_from_one() {
        let mut jobs = JobRegistry::new();
        assert_eq!(jobs.alloc(channel().0), 1);
        assert_eq!(jobs.alloc(channel().0), 2);
        assert_eq!(jobs.alloc(channel().0), 3);
    }

    #[test]
    fn take_removes_the_entry() {
        let mut jobs = JobRegistry::new();
        let id = jobs.alloc(channel().0);
        assert!(jobs.take(id).is_some());
        assert!(jobs.take(id).is_none());
    }

    #[test]
    fn the_sentinel_is_never_looked_up() {
        let mut jobs = JobRegistry::new();
        jobs.alloc(channel().0);
        assert!(jobs.take(JOBID_NONE).is_none());
    }

    #[tokio::test]
    async fn clear_wakes_waiting_receivers_with_an_error() {
        let mut jobs = JobRegistry::new();
        let (tx, rx) = channel();
        jobs.alloc(tx);
        jobs.clear();
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn taken_channel_delivers_the_message() {
        let mut jobs = JobRegistry::new();
        let (tx, rx) = channel();
        let id = jobs.alloc(tx);
        let sender = jobs.take(id).unwrap();
        sender
            .send(NetMessage {
                header: Header::proto(cm_common::EMsg::Other(5000)),
                body: vec![1, 2, 3],
                reply: None,
            })
            .unwrap();
        let msg = rx.await.unwrap();
        assert_eq!(msg.body, [1, 2, 3]);
    }
}
