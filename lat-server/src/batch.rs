//! Batch Assembler (C3) — groups an ordered stream of readings into per-tag
//! measurement rounds, dropping stale rounds rather than queueing behind
//! real time (§4.2, §5).

use std::collections::HashMap;

use lat_types::Reading;

/// A completed round for one tag: every (anchor, distance) pair observed
/// before the boundary reading arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedRound {
    pub tag_id: u32,
    pub distances: HashMap<u32, f64>,
    pub timestamp: f64,
}

/// Which direction "newest round" scans in the burst-boundary rule. The
/// source's own comments disagree with each other about tag-id ordering
/// (§9 Open Questions); this implementation makes the direction an explicit
/// parameter instead of hard-coding one reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagOrder {
    /// A new round begins when the incoming tag_id is *not greater* than the
    /// previous one (readings arrive in descending tag_id order).
    Descending,
    /// A new round begins when the incoming tag_id is *not less* than the
    /// previous one (readings arrive in ascending tag_id order).
    Ascending,
}

impl Default for TagOrder {
    fn default() -> Self {
        TagOrder::Descending
    }
}

/// Accumulates readings for a single tag until a round boundary is crossed.
#[derive(Debug, Default)]
struct PendingRound {
    distances: HashMap<u32, f64>,
    last_anchor_id: Option<u32>,
    last_timestamp: f64,
}

impl PendingRound {
    fn push(&mut self, reading: &Reading) {
        self.distances.insert(reading.anchor_id, reading.distance);
        self.last_anchor_id = Some(reading.anchor_id);
        self.last_timestamp = reading.timestamp;
    }

    fn take_completed(&mut self, tag_id: u32) -> CompletedRound {
        let distances = std::mem::take(&mut self.distances);
        let timestamp = self.last_timestamp;
        self.last_anchor_id = None;
        CompletedRound {
            tag_id,
            distances,
            timestamp,
        }
    }
}

/// Groups a live stream of readings into completed rounds, one call to
/// `push` at a time. Each tag's anchors are tracked independently, so the
/// cross-tag ordering direction (`TagOrder`) only matters to the burst
/// back-scan in `most_recent`, not to this per-tag accumulation.
#[derive(Default)]
pub struct BatchAssembler {
    pending: HashMap<u32, PendingRound>,
}

impl BatchAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one reading. Readings with a non-zero error code must already
    /// have been filtered out by the caller (§3); this stage only assembles
    /// rounds. Returns a completed round if this reading closed one out.
    pub fn push(&mut self, reading: Reading) -> Option<CompletedRound> {
        let pending = self.pending.entry(reading.tag_id).or_default();
        let new_anchor_round = match pending.last_anchor_id {
            Some(last_anchor) => reading.anchor_id <= last_anchor,
            None => false,
        };

        if new_anchor_round && !pending.distances.is_empty() {
            let completed = pending.take_completed(reading.tag_id);
            let pending = self.pending.get_mut(&reading.tag_id).unwrap();
            pending.push(&reading);
            return Some(completed);
        }

        pending.push(&reading);
        None
    }

    /// Drain any rounds still accumulating (used at shutdown, or between
    /// replay bursts, to flush partial state). Does not apply the back
    /// pressure rule — every tag's current accumulation is returned as-is.
    pub fn flush(&mut self) -> Vec<CompletedRound> {
        let tag_ids: Vec<u32> = self.pending.keys().copied().collect();
        tag_ids
            .into_iter()
            .filter_map(|tag_id| {
                let pending = self.pending.get_mut(&tag_id).unwrap();
                if pending.distances.is_empty() {
                    None
                } else {
                    Some(pending.take_completed(tag_id))
                }
            })
            .collect()
    }
}

/// Back-pressure policy (§4.2, §5): given a burst of readings that may span
/// more than one round per tag, keep only the newest round's worth per tag
/// and report how many older readings were dropped.
///
/// Forward-scans `readings` marking the start of every round: a round
/// starts at the first reading, and thereafter whenever a reading's
/// anchor_id fails to continue the current tag's increasing run (`anchor_id
/// <= ` the previous reading's, the same boundary `BatchAssembler::push`
/// uses) or the tag_id fails to continue in `tag_order`'s expected
/// direction. Everything from the *second-to-last* round boundary onward is
/// kept — the newest complete round plus whatever partial round follows it
/// — and everything before that boundary is reported dropped. A burst that
/// never completes more than one round is left untouched.
pub fn most_recent(readings: &[Reading], tag_order: TagOrder) -> (Vec<Reading>, usize) {
    if readings.is_empty() {
        return (Vec::new(), 0);
    }

    let mut boundaries = vec![0usize];
    let mut last_tag = readings[0].tag_id;
    let mut last_anchor = readings[0].anchor_id;

    for (i, reading) in readings.iter().enumerate().skip(1) {
        let new_round = if reading.tag_id == last_tag {
            reading.anchor_id <= last_anchor
        } else {
            match tag_order {
                TagOrder::Ascending => reading.tag_id < last_tag,
                TagOrder::Descending => reading.tag_id > last_tag,
            }
        };
        if new_round {
            boundaries.push(i);
        }
        last_tag = reading.tag_id;
        last_anchor = reading.anchor_id;
    }

    let cutoff = if boundaries.len() >= 2 {
        boundaries[boundaries.len() - 2]
    } else {
        0
    };

    (readings[cutoff..].to_vec(), cutoff)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(tag_id: u32, anchor_id: u32, distance: f64) -> Reading {
        Reading {
            tag_id,
            anchor_id,
            distance,
            error_code: 0,
            timestamp: 0.0,
        }
    }

    #[test]
    fn single_round_produces_no_completion_until_boundary() {
        let mut assembler = BatchAssembler::new();
        assert!(assembler.push(reading(1, 1, 1.0)).is_none());
        assert!(assembler.push(reading(1, 2, 2.0)).is_none());
        assert!(assembler.push(reading(1, 3, 3.0)).is_none());
        // anchor_id 1 <= last (3) closes the round.
        let completed = assembler.push(reading(1, 1, 9.0)).unwrap();
        assert_eq!(completed.tag_id, 1);
        assert_eq!(completed.distances.len(), 3);
        assert_eq!(completed.distances[&1], 1.0);
    }

    #[test]
    fn scenario_4_interleaved_sequence_emits_exactly_one_round() {
        // {(t=1,a=1), (t=1,a=2), (t=1,a=3), (t=1,a=1), (t=1,a=2)}
        let mut assembler = BatchAssembler::new();
        let mut completions = Vec::new();
        for r in [
            reading(1, 1, 1.0),
            reading(1, 2, 1.0),
            reading(1, 3, 1.0),
            reading(1, 1, 1.0),
            reading(1, 2, 1.0),
        ] {
            if let Some(c) = assembler.push(r) {
                completions.push(c);
            }
        }
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].distances.len(), 3);

        let remaining = assembler.flush();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].distances.len(), 2);
    }

    #[test]
    fn most_recent_keeps_only_newest_burst() {
        // Two full rounds for tag 5 (anchors 1,2,3) then a partial third.
        let readings = vec![
            reading(5, 1, 1.0),
            reading(5, 2, 1.0),
            reading(5, 3, 1.0),
            reading(5, 1, 2.0),
            reading(5, 2, 2.0),
            reading(5, 3, 2.0),
            reading(5, 1, 3.0),
        ];
        let (kept, dropped) = most_recent(&readings, TagOrder::Ascending);
        assert_eq!(dropped, 3);
        assert_eq!(kept.len(), 4);
        assert_eq!(kept[0].distance, 2.0);
    }

    #[test]
    fn most_recent_is_noop_for_single_round() {
        let readings = vec![reading(1, 1, 1.0), reading(1, 2, 2.0)];
        let (kept, dropped) = most_recent(&readings, TagOrder::Ascending);
        assert_eq!(dropped, 0);
        assert_eq!(kept, readings);
    }
}
