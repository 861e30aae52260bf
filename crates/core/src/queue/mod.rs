//! Time-indexed instruction buckets.

use serde::{Deserialize, Serialize};

use crate::clock::BeatSnapshot;
use crate::effect::EffectActivation;

/// A deferred scheduling decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Instruction {
    /// Switch a device to another timeline level.
    Device { level: usize },
    /// Activate a named overlay.
    Effect {
        name: String,
        activation: EffectActivation,
    },
}

/// Ring of `length` buckets indexed by quarter.
///
/// Buckets keep their contents between visits, so a loaded schedule repeats
/// every time the clock wraps around the ring. Only [`InstructionQueue::clear`]
/// removes instructions.
#[derive(Debug, Clone)]
pub struct InstructionQueue<T = Instruction> {
    buckets: Vec<Vec<T>>,
    freshly_cleared: bool,
}

impl<T: Clone> InstructionQueue<T> {
    pub fn new(length: usize) -> Self {
        Self {
            buckets: vec![Vec::new(); length],
            freshly_cleared: true,
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }

    /// Total number of instructions across all buckets.
    pub fn pending(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    /// Appends `instruction` to the bucket at `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is outside the ring.
    pub fn add(&mut self, instruction: T, slot: usize) {
        let length = self.buckets.len();
        match self.buckets.get_mut(slot) {
            Some(bucket) => bucket.push(instruction),
            None => panic!("instruction slot {slot} outside queue of length {length}"),
        }
    }

    /// Empties every bucket. The next drain catches up on everything due up
    /// to the current position.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.freshly_cleared = true;
    }

    /// Returns the instructions due for `snapshot`.
    ///
    /// The first drain after a clear returns every bucket from slot 0 through
    /// the current quarter, in slot order. Afterwards only the bucket of a
    /// newly entered quarter is returned.
    pub fn drain(&mut self, snapshot: &BeatSnapshot) -> Vec<T> {
        if self.freshly_cleared {
            self.freshly_cleared = false;
            let until = snapshot.quarter_index.min(self.buckets.len().saturating_sub(1));
            return self.buckets[..=until].iter().flatten().cloned().collect();
        }

        if snapshot.is_new_quarter {
            return self
                .buckets
                .get(snapshot.quarter_index)
                .cloned()
                .unwrap_or_default();
        }

        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Fingerprint;

    fn at(quarter_index: usize, is_new_quarter: bool) -> BeatSnapshot {
        BeatSnapshot {
            quarter_index,
            is_new_quarter,
            beat_progress: 0.0,
            fingerprint: Fingerprint::default(),
        }
    }

    fn level(level: usize) -> Instruction {
        Instruction::Device { level }
    }

    #[test]
    fn delivers_instruction_once_on_its_slot() {
        let mut queue = InstructionQueue::new(16);
        queue.add(level(2), 3);
        assert!(queue.drain(&at(0, false)).is_empty());

        let mut delivered = Vec::new();
        for quarter in 1..16 {
            let due = queue.drain(&at(quarter, true));
            delivered.extend(due.into_iter().map(|ins| (quarter, ins)));
            // later frames of the same quarter carry no edge
            assert!(queue.drain(&at(quarter, false)).is_empty());
        }
        assert_eq!(delivered, vec![(3, level(2))]);
    }

    #[test]
    fn catch_up_returns_all_buckets_up_to_current_slot() {
        let mut queue = InstructionQueue::new(16);
        queue.add(level(0), 0);
        queue.add(level(2), 2);
        queue.add(level(5), 5);
        queue.add(level(9), 9);

        let first = queue.drain(&at(5, false));
        assert_eq!(first, vec![level(0), level(2), level(5)]);
        assert!(queue.drain(&at(6, true)).is_empty());
        assert_eq!(queue.drain(&at(9, true)), vec![level(9)]);
    }

    #[test]
    fn clear_discards_undelivered_instructions() {
        let mut queue = InstructionQueue::new(8);
        queue.add(level(1), 4);
        assert_eq!(queue.pending(), 1);

        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.drain(&at(4, true)).is_empty());
        assert!(queue.drain(&at(4, true)).is_empty());
    }

    #[test]
    fn bucket_order_is_preserved() {
        let mut queue = InstructionQueue::new(4);
        queue.drain(&at(0, false));
        queue.add(level(3), 1);
        queue.add(level(1), 1);
        assert_eq!(queue.drain(&at(1, true)), vec![level(3), level(1)]);
    }

    #[test]
    #[should_panic(expected = "outside queue")]
    fn adding_out_of_range_panics() {
        let mut queue: InstructionQueue = InstructionQueue::new(4);
        queue.add(level(1), 4);
    }

    #[test]
    fn instructions_deserialize_from_json() {
        let json = r#"{
            "kind": "effect",
            "name": "strobe",
            "activation": {"mode": "frames", "limit": 10}
        }"#;
        let instruction: Instruction = serde_json::from_str(json).unwrap();
        match instruction {
            Instruction::Effect { name, .. } => assert_eq!(name, "strobe"),
            other => panic!("unexpected instruction {other:?}"),
        }
    }
}
