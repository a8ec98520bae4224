//! Reassembly of out-of-order synthesis output into segment order.
//!
//! Synthesis tasks finish in any order. Their chunks and completion markers
//! are drained from the intake channel into this queue, which releases audio
//! strictly in segment order:
//!
//! ```text
//! active order:  [ s3 | s4 | s5 ]      cursor = s3 (head)
//! pending:       { s3: 2, s5: 1 }      s4 already done
//! buffer:        [ s5#0, s3#0, s3#1 ]  arrival order
//!
//! release -> s3#0, s3#1, then waits: s3 still owes its done marker
//! ```
//!
//! - The cursor is always the head of the active order list.
//! - The cursor moves on only after its segment's done marker arrived and
//!   every buffered chunk of it was released. A done marker with zero chunks
//!   marks the segment failed and removes it at once.
//! - Chunks whose segment is no longer active are stale and discarded.
//! - A forced release drops ordering and flushes the buffer in arrival order.
//!
//! The queue is owned by a single task; synthesis workers only ever push
//! messages into the intake channel.

use std::collections::{HashMap, VecDeque};

use super::segment::{
    AudioChunk, Segment, SegmentId, SegmentStatus, SynthesisEvent, SynthesisMessage,
};

/// Errors raised when registering segments out of contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    #[error("segment {0} is already registered")]
    DuplicateSegment(SegmentId),
    #[error("order index {index} does not follow {last}")]
    OrderRegression { index: u64, last: u64 },
}

/// What one intake pass observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntakeReport {
    /// Chunks appended to the reorder buffer.
    pub chunks: usize,
    /// Segments whose done marker arrived after at least one chunk.
    pub completed: Vec<(SegmentId, usize)>,
    /// Segments whose done marker arrived with no chunk.
    pub failed: Vec<SegmentId>,
}

impl IntakeReport {
    pub fn is_empty(&self) -> bool {
        self.chunks == 0 && self.completed.is_empty() && self.failed.is_empty()
    }
}

/// Ordering state for one streamed response.
#[derive(Debug, Default)]
pub struct ReassemblyQueue {
    /// Chunks produced so far, per segment still owing its done marker.
    pending: HashMap<SegmentId, usize>,
    /// Segments not yet fully released, in generation order.
    active: VecDeque<SegmentId>,
    /// Arrival-ordered audio awaiting release.
    buffer: VecDeque<AudioChunk>,
    status: HashMap<SegmentId, SegmentStatus>,
    last_order_index: Option<u64>,
    released: usize,
    discarded: usize,
}

impl ReassemblyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a segment before its synthesis task starts.
    ///
    /// Creates its pending entry at zero and appends it to the order list, so
    /// a fast done marker can never arrive for an unknown segment.
    pub fn register(&mut self, segment: &Segment) -> Result<(), ReassemblyError> {
        if self.status.contains_key(&segment.id) {
            return Err(ReassemblyError::DuplicateSegment(segment.id));
        }
        if let Some(last) = self.last_order_index {
            if segment.order_index <= last {
                return Err(ReassemblyError::OrderRegression {
                    index: segment.order_index,
                    last,
                });
            }
        }

        self.last_order_index = Some(segment.order_index);
        self.pending.insert(segment.id, 0);
        self.active.push_back(segment.id);
        self.status.insert(segment.id, SegmentStatus::Pending);
        Ok(())
    }

    /// Fold a batch of intake messages into the queue.
    pub fn intake<I>(&mut self, messages: I) -> IntakeReport
    where
        I: IntoIterator<Item = SynthesisMessage>,
    {
        let mut report = IntakeReport::default();
        let mut arrived = Vec::new();

        for SynthesisMessage { segment_id, event } in messages {
            match event {
                SynthesisEvent::Chunk(block) => {
                    if let Some(count) = self.pending.get_mut(&segment_id) {
                        *count += 1;
                        self.status.insert(segment_id, SegmentStatus::Streaming);
                    }
                    arrived.push(AudioChunk { segment_id, block });
                }
                SynthesisEvent::Done => match self.pending.remove(&segment_id) {
                    Some(0) => {
                        self.status.insert(segment_id, SegmentStatus::Failed);
                        report.failed.push(segment_id);
                    }
                    Some(count) => {
                        self.status.insert(segment_id, SegmentStatus::Complete);
                        report.completed.push((segment_id, count));
                    }
                    None => {
                        tracing::debug!(
                            segment_id = %segment_id,
                            "Done marker for unknown segment"
                        );
                    }
                },
            }
        }

        for failed in &report.failed {
            self.active.retain(|id| id != failed);
            tracing::warn!(
                segment_id = %failed,
                "Synthesis finished without audio, skipping segment"
            );
        }

        if !report.completed.is_empty() {
            tracing::debug!(
                completed = report.completed.len(),
                pending = self.pending.len(),
                "Synthesis completed"
            );
        }

        if !arrived.is_empty() {
            // Stable sort keeps per-segment arrival order intact.
            let position: HashMap<SegmentId, usize> = self
                .active
                .iter()
                .enumerate()
                .map(|(i, id)| (*id, i))
                .collect();
            arrived.sort_by_key(|chunk| {
                position
                    .get(&chunk.segment_id)
                    .copied()
                    .unwrap_or(usize::MAX)
            });
            report.chunks = arrived.len();
            self.buffer.extend(arrived);
        }

        report
    }

    /// Release audio that is ready for the transport.
    ///
    /// With `force_all` every buffered chunk comes out in arrival order;
    /// otherwise only the cursor segment's chunks do,
    /// advancing the cursor as segments are exhausted.
    pub fn release(&mut self, force_all: bool) -> Release<'_> {
        if !force_all {
            self.purge_stale();
        }
        Release {
            queue: self,
            force_all,
        }
    }

    /// Segment currently eligible for release.
    pub fn cursor(&self) -> Option<SegmentId> {
        self.active.front().copied()
    }

    /// Whether any segment still owes its done marker.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_ids(&self) -> Vec<SegmentId> {
        self.active
            .iter()
            .filter(|id| self.pending.contains_key(id))
            .copied()
            .collect()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn status(&self, id: SegmentId) -> Option<SegmentStatus> {
        self.status.get(&id).copied()
    }

    /// Total chunks released so far.
    pub fn released(&self) -> usize {
        self.released
    }

    /// Total stale chunks dropped so far.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    pub fn failed_count(&self) -> usize {
        self.status
            .values()
            .filter(|s| **s == SegmentStatus::Failed)
            .count()
    }

    /// Drop buffered chunks whose segment already left the order list.
    fn purge_stale(&mut self) {
        let before = self.buffer.len();
        let active = &self.active;
        self.buffer.retain(|chunk| {
            let keep = active.contains(&chunk.segment_id);
            if !keep {
                tracing::warn!(segment_id = %chunk.segment_id, "Discarding stale audio chunk");
            }
            keep
        });
        self.discarded += before - self.buffer.len();
    }

    fn next_ordered(&mut self) -> Option<AudioChunk> {
        loop {
            let cursor = self.cursor()?;

            if let Some(pos) = self.buffer.iter().position(|c| c.segment_id == cursor) {
                return self.buffer.remove(pos);
            }
            if self.pending.contains_key(&cursor) {
                // Still synthesizing: later audio waits.
                return None;
            }

            self.active.pop_front();
            if let Some(next) = self.cursor() {
                tracing::debug!(from = %cursor, to = %next, "Advancing output cursor");
            }
        }
    }

}

/// Lazy release of ready chunks; see [`ReassemblyQueue::release`].
pub struct Release<'a> {
    queue: &'a mut ReassemblyQueue,
    force_all: bool,
}

impl Iterator for Release<'_> {
    type Item = AudioChunk;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = if self.force_all {
            self.queue.buffer.pop_front()
        } else {
            self.queue.next_ordered()
        }?;
        self.queue.released += 1;
        Some(chunk)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::segment::AudioBlock;

    fn segments(n: usize) -> (ReassemblyQueue, Vec<Segment>) {
        let mut queue = ReassemblyQueue::new();
        let segs: Vec<Segment> = (0..n)
            .map(|i| Segment::new(i as u64, format!("segment {i}")))
            .collect();
        for seg in &segs {
            queue.register(seg).unwrap();
        }
        (queue, segs)
    }

    /// A chunk whose single sample encodes `segment * 10 + chunk`.
    fn chunk(seg: &Segment, n: usize) -> SynthesisMessage {
        let tag = (seg.order_index as usize * 10 + n) as f32;
        SynthesisMessage::chunk(seg.id, AudioBlock::new(16_000, vec![tag]))
    }

    fn done(seg: &Segment) -> SynthesisMessage {
        SynthesisMessage::done(seg.id)
    }

    fn tags(released: impl IntoIterator<Item = AudioChunk>) -> Vec<f32> {
        released.into_iter().map(|c| c.block.samples[0]).collect()
    }

    #[test]
    fn releases_in_order_when_arrival_is_in_order() {
        let (mut q, s) = segments(2);
        q.intake([chunk(&s[0], 0), chunk(&s[0], 1), done(&s[0])]);
        q.intake([chunk(&s[1], 0), done(&s[1])]);
        assert_eq!(tags(q.release(false)), vec![0.0, 1.0, 10.0]);
        assert!(!q.has_pending());
        assert_eq!(q.released(), 3);
    }

    #[test]
    fn later_segment_waits_for_earlier_one() {
        let (mut q, s) = segments(2);
        q.intake([chunk(&s[1], 0), chunk(&s[1], 1), done(&s[1])]);
        assert!(tags(q.release(false)).is_empty());
        assert_eq!(q.cursor(), Some(s[0].id));
        assert_eq!(q.buffered_len(), 2);

        q.intake([chunk(&s[0], 0)]);
        assert_eq!(tags(q.release(false)), vec![0.0]);
        // Segment 0 has not finished: segment 1 must keep waiting.
        assert!(tags(q.release(false)).is_empty());

        q.intake([chunk(&s[0], 1), done(&s[0])]);
        assert_eq!(tags(q.release(false)), vec![1.0, 10.0, 11.0]);
        assert_eq!(q.cursor(), None);
    }

    #[test]
    fn ordering_holds_for_every_completion_order() {
        // All permutations of three segments finishing, two chunks each.
        let orders = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let (mut q, s) = segments(3);
            let mut out = Vec::new();
            for i in order {
                q.intake([chunk(&s[i], 0)]);
                out.extend(tags(q.release(false)));
                q.intake([chunk(&s[i], 1), done(&s[i])]);
                out.extend(tags(q.release(false)));
            }
            assert_eq!(out, vec![0.0, 1.0, 10.0, 11.0, 20.0, 21.0], "order {order:?}");
        }
    }

    #[test]
    fn failed_segment_is_skipped_immediately() {
        let (mut q, s) = segments(3);
        q.intake([chunk(&s[1], 0), done(&s[1])]);
        assert!(tags(q.release(false)).is_empty());

        let report = q.intake([done(&s[0])]);
        assert_eq!(report.failed, vec![s[0].id]);
        assert_eq!(q.status(s[0].id), Some(SegmentStatus::Failed));
        assert_eq!(tags(q.release(false)), vec![10.0]);
        assert_eq!(q.cursor(), Some(s[2].id));
        assert_eq!(q.failed_count(), 1);
    }

    #[test]
    fn failure_in_the_middle_does_not_move_cursor() {
        let (mut q, s) = segments(3);
        q.intake([done(&s[1])]);
        assert_eq!(q.cursor(), Some(s[0].id));
        q.intake([chunk(&s[2], 0), done(&s[2]), chunk(&s[0], 0), done(&s[0])]);
        assert_eq!(tags(q.release(false)), vec![0.0, 20.0]);
    }

    #[test]
    fn batch_is_sorted_by_segment_order() {
        let (mut q, s) = segments(2);
        let report = q.intake([chunk(&s[1], 0), chunk(&s[0], 0), chunk(&s[1], 1)]);
        assert_eq!(report.chunks, 3);
        // Forced release exposes raw buffer order.
        assert_eq!(tags(q.release(true)), vec![0.0, 10.0, 11.0]);
    }

    #[test]
    fn stale_chunks_are_discarded() {
        let (mut q, s) = segments(2);
        q.intake([chunk(&s[0], 0), done(&s[0])]);
        assert_eq!(tags(q.release(false)), vec![0.0]);

        // Segment 0 is fully released and gone; a late chunk for it is stale.
        q.intake([chunk(&s[0], 7), chunk(&s[1], 0)]);
        assert_eq!(tags(q.release(false)), vec![10.0]);
        assert_eq!(q.discarded(), 1);
    }

    #[test]
    fn repeated_release_without_new_data_is_a_no_op() {
        let (mut q, s) = segments(2);
        q.intake([chunk(&s[0], 0), chunk(&s[1], 0)]);
        assert_eq!(tags(q.release(false)), vec![0.0]);

        for _ in 0..5 {
            let report = q.intake(Vec::<SynthesisMessage>::new());
            assert!(report.is_empty());
            assert!(tags(q.release(false)).is_empty());
        }
        assert_eq!(q.released(), 1);
        assert_eq!(q.buffered_len(), 1);
        assert_eq!(q.pending_len(), 2);
    }

    #[test]
    fn forced_release_flushes_everything_once() {
        let (mut q, s) = segments(3);
        q.intake([chunk(&s[2], 0), chunk(&s[1], 0), chunk(&s[2], 1)]);
        assert!(tags(q.release(false)).is_empty());

        let flushed = tags(q.release(true));
        assert_eq!(flushed.len(), 3);
        assert!(tags(q.release(true)).is_empty());
        assert_eq!(q.buffered_len(), 0);
    }

    #[test]
    fn forced_release_keeps_audio_of_segment_cut_short() {
        // Synthesis broke after one chunk: the segment still completes.
        let (mut q, s) = segments(2);
        q.intake([chunk(&s[1], 0), chunk(&s[0], 0), done(&s[0])]);
        assert_eq!(q.status(s[0].id), Some(SegmentStatus::Complete));
        assert_eq!(tags(q.release(true)), vec![0.0, 10.0]);
        assert_eq!(q.discarded(), 0);
        assert_eq!(q.released(), 2);
    }

    #[test]
    fn status_tracks_lifecycle() {
        let (mut q, s) = segments(1);
        assert_eq!(q.status(s[0].id), Some(SegmentStatus::Pending));
        q.intake([chunk(&s[0], 0)]);
        assert_eq!(q.status(s[0].id), Some(SegmentStatus::Streaming));
        let report = q.intake([done(&s[0])]);
        assert_eq!(report.completed, vec![(s[0].id, 1)]);
        assert_eq!(q.status(s[0].id), Some(SegmentStatus::Complete));
    }

    #[test]
    fn duplicate_done_marker_is_ignored() {
        let (mut q, s) = segments(1);
        q.intake([chunk(&s[0], 0), done(&s[0])]);
        let report = q.intake([done(&s[0])]);
        assert!(report.is_empty());
        assert_eq!(q.status(s[0].id), Some(SegmentStatus::Complete));
    }

    #[test]
    fn register_rejects_duplicates_and_regressions() {
        let mut q = ReassemblyQueue::new();
        let first = Segment::new(3, "a");
        q.register(&first).unwrap();
        assert_eq!(
            q.register(&first),
            Err(ReassemblyError::DuplicateSegment(first.id))
        );
        assert_eq!(
            q.register(&Segment::new(3, "b")),
            Err(ReassemblyError::OrderRegression { index: 3, last: 3 })
        );
        assert!(q.register(&Segment::new(4, "c")).is_ok());
    }

    #[test]
    fn pending_ids_follow_generation_order() {
        let (mut q, s) = segments(3);
        q.intake([chunk(&s[1], 0), done(&s[1])]);
        assert_eq!(q.pending_ids(), vec![s[0].id, s[2].id]);
    }
}
