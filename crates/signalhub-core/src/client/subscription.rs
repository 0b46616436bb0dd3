//! Per-channel subscription state and the recovery algorithm (spec §4.5):
//! merging what a resubscribing client says it last saw against the
//! channel's retained history, and detecting when that history no longer
//! covers the gap.

use signalhub_messages::{Publication, StreamPosition};

use crate::engine::HistoryManager;
use crate::error::HistoryError;

/// One channel a session is subscribed to.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub recoverable: bool,
    pub presence: bool,
    pub join_leave: bool,
    /// The most recent position this session has been told about, whether
    /// via an initial recovery or ongoing delivery.
    pub position: StreamPosition,
    /// Set between [`Subscription::begin_recovery`] and
    /// [`Subscription::finish_recovery`]: while true, live publications the
    /// hub fans out for this channel must be diverted into
    /// `recovery_buffer` instead of the normal delivery path, since they
    /// race the history snapshot `recover()` is awaiting.
    recovering: bool,
    recovery_buffer: Vec<Publication>,
}

impl Subscription {
    pub fn new(presence: bool, join_leave: bool) -> Self {
        Self {
            recoverable: false,
            presence,
            join_leave,
            position: StreamPosition::ZERO,
            recovering: false,
            recovery_buffer: Vec::new(),
        }
    }

    pub fn advance(&mut self, position: StreamPosition) {
        self.position = position;
        self.recoverable = position.offset > 0;
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    /// Start buffering live publications instead of delivering them,
    /// covering the window between registering as a live subscriber and the
    /// history recovery snapshot actually landing.
    pub fn begin_recovery(&mut self) {
        self.recovering = true;
        self.recovery_buffer.clear();
    }

    /// Stop buffering and merge whatever arrived live against `catch_up`
    /// (the publications `recover()` returned), deduplicating by offset and
    /// keeping the lower-indexed copy, sorted ascending by offset.
    pub fn finish_recovery(&mut self, catch_up: Vec<Publication>) -> Vec<Publication> {
        self.recovering = false;
        let buffered = std::mem::take(&mut self.recovery_buffer);
        if buffered.is_empty() {
            return catch_up;
        }

        let mut by_offset: std::collections::BTreeMap<u64, Publication> = std::collections::BTreeMap::new();
        for publication in catch_up.into_iter().chain(buffered) {
            by_offset.entry(publication.offset).or_insert(publication);
        }
        by_offset.into_values().collect()
    }

    /// Buffer `publication` while recovery is in progress, returning `None`.
    /// Returns `Some(publication)` unchanged once recovery has finished (or
    /// never started), meaning the caller should deliver it normally.
    pub fn buffer_if_recovering(&mut self, publication: Publication) -> Option<Publication> {
        if self.recovering {
            self.recovery_buffer.push(publication);
            None
        } else {
            Some(publication)
        }
    }
}

/// Outcome of attempting to recover missed publications on (re)subscribe.
pub struct RecoveryResult {
    pub publications: Vec<Publication>,
    pub position: StreamPosition,
    /// True only if every publication between `since` and the channel's
    /// current position was recoverable from retained history. False means
    /// either the epoch changed (history was reset) or the retained window
    /// no longer reaches back far enough; the caller should treat this the
    /// same as "first subscribe" and not claim completeness to the client.
    pub recovered: bool,
}

/// Implements spec §4.5's merge/dedup-by-offset and epoch-mismatch rule.
/// `since` is what the client last saw; `max_publications` bounds how much
/// history a single recovery attempt is allowed to replay.
pub async fn recover(
    history: &dyn HistoryManager,
    channel: &signalhub_messages::Channel,
    since: StreamPosition,
    max_publications: u32,
) -> Result<RecoveryResult, HistoryError> {
    let (publications, position) = history
        .get(channel, Some(since), Some(max_publications), false)
        .await?;

    // `since.epoch == 0` means the client has never seen a real epoch (its
    // first recovery attempt); only a *known* epoch that no longer matches
    // signals a history reset.
    if since.epoch != 0 && !since.same_epoch(&position) {
        return Ok(RecoveryResult {
            publications,
            position,
            recovered: false,
        });
    }

    // Same epoch: recovery is complete only if the retained window actually
    // reaches back to `since.offset` with no gap, i.e. the oldest returned
    // publication picks up exactly where the client left off, or there was
    // nothing to recover at all.
    let recovered = match publications.first() {
        Some(first) => first.offset == since.offset + 1,
        None => since.offset == position.offset,
    };

    Ok(RecoveryResult {
        publications,
        position,
        recovered,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryHistoryManager;
    use bytes::Bytes;
    use signalhub_messages::Channel;
    use std::time::Duration;

    #[tokio::test]
    async fn recover_from_zero_replays_everything_retained() {
        let history = MemoryHistoryManager::new(10, Duration::from_secs(60), 100);
        let ch = Channel::new("room").unwrap();
        history.add(&ch, Bytes::from_static(b"a"), None, None).await.unwrap();
        history.add(&ch, Bytes::from_static(b"b"), None, None).await.unwrap();

        let result = recover(history.as_ref(), &ch, StreamPosition::ZERO, 100).await.unwrap();
        assert_eq!(result.publications.len(), 2);
        assert!(result.recovered);
    }

    #[tokio::test]
    async fn recover_with_no_gap_is_marked_complete() {
        let history = MemoryHistoryManager::new(10, Duration::from_secs(60), 100);
        let ch = Channel::new("room").unwrap();
        let p1 = history.add(&ch, Bytes::from_static(b"a"), None, None).await.unwrap();
        history.add(&ch, Bytes::from_static(b"b"), None, None).await.unwrap();

        let result = recover(history.as_ref(), &ch, p1.position(), 100).await.unwrap();
        assert_eq!(result.publications.len(), 1);
        assert!(result.recovered);
    }

    #[tokio::test]
    async fn recover_past_eviction_window_is_marked_incomplete() {
        let history = MemoryHistoryManager::new(1, Duration::from_secs(60), 100);
        let ch = Channel::new("room").unwrap();
        let p1 = history.add(&ch, Bytes::from_static(b"a"), None, None).await.unwrap();
        history.add(&ch, Bytes::from_static(b"b"), None, None).await.unwrap();
        history.add(&ch, Bytes::from_static(b"c"), None, None).await.unwrap();

        // only "c" survives the size-1 ring; recovering from p1 can't be complete
        let result = recover(history.as_ref(), &ch, p1.position(), 100).await.unwrap();
        assert!(!result.recovered);
    }

    #[tokio::test]
    async fn recover_after_epoch_change_is_marked_incomplete() {
        let history = MemoryHistoryManager::new(10, Duration::from_secs(60), 100);
        let ch = Channel::new("room").unwrap();
        let p1 = history.add(&ch, Bytes::from_static(b"a"), None, None).await.unwrap();
        history.remove_channel(&ch).await.unwrap();
        history.add(&ch, Bytes::from_static(b"b"), None, None).await.unwrap();

        let result = recover(history.as_ref(), &ch, p1.position(), 100).await.unwrap();
        assert!(!result.recovered);
    }

    fn pub_at(offset: u64) -> Publication {
        let mut p = Publication::transient(offset.to_string());
        p.offset = offset;
        p
    }

    #[test]
    fn finish_recovery_merges_live_and_catch_up_sorted_by_offset() {
        let mut sub = Subscription::new(false, false);
        sub.begin_recovery();
        assert!(sub.buffer_if_recovering(pub_at(3)).is_none());
        assert!(sub.buffer_if_recovering(pub_at(2)).is_none());

        let merged = sub.finish_recovery(vec![pub_at(1), pub_at(2)]);
        let offsets: Vec<u64> = merged.iter().map(|p| p.offset).collect();
        assert_eq!(offsets, vec![1, 2, 3]);
        assert!(!sub.is_recovering());
    }

    #[test]
    fn buffer_if_recovering_is_false_once_recovery_finished() {
        let mut sub = Subscription::new(false, false);
        sub.begin_recovery();
        sub.finish_recovery(vec![]);
        assert!(sub.buffer_if_recovering(pub_at(1)).is_some());
    }
}
