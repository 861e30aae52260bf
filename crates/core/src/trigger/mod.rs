//! Declarative "fire on these beats" rules.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::clock::{BeatSnapshot, Fingerprint, QUARTERS_PER_BEAT};
use crate::{LightsError, Result};

/// Serializable description of a [`TriggerPattern`], used by timelines and
/// control messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSpec {
    /// Beat offsets inside the loop that may fire.
    pub beats: Vec<usize>,
    /// Quarter letters (`A`-`D`) inside a beat that may fire.
    pub quarters: String,
    pub loop_length: usize,
    pub probability: f64,
}

impl Default for TriggerSpec {
    fn default() -> Self {
        Self {
            beats: vec![0],
            quarters: "A".to_string(),
            loop_length: 4,
            probability: 1.0,
        }
    }
}

/// Matches beat snapshots against a set of active `(beat, quarter)` pairs.
///
/// A shared fire counter implements trigger skipping: only every Nth
/// deterministic match fires. The probability gate draws one random number on
/// every call, whether or not the deterministic part matched, so the amount of
/// randomness consumed does not depend on the match rate.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerPattern {
    spec: TriggerSpec,
    beat_active: Vec<bool>,
    quarter_active: [bool; QUARTERS_PER_BEAT],
    fire_counter: i64,
    last_fired: Option<Fingerprint>,
}

impl Default for TriggerPattern {
    fn default() -> Self {
        Self::from_spec(TriggerSpec::default()).expect("default trigger spec is valid")
    }
}

impl TriggerPattern {
    pub fn new(
        beats: &[usize],
        quarters: &str,
        loop_length: usize,
        probability: f64,
    ) -> Result<Self> {
        Self::from_spec(TriggerSpec {
            beats: beats.to_vec(),
            quarters: quarters.to_string(),
            loop_length,
            probability,
        })
    }

    pub fn from_spec(spec: TriggerSpec) -> Result<Self> {
        let (beat_active, quarter_active) = compile(&spec)?;
        Ok(Self {
            spec,
            beat_active,
            quarter_active,
            fire_counter: -1,
            last_fired: None,
        })
    }

    pub fn spec(&self) -> &TriggerSpec {
        &self.spec
    }

    pub fn loop_length(&self) -> usize {
        self.spec.loop_length
    }

    pub fn probability(&self) -> f64 {
        self.spec.probability
    }

    pub fn fire_counter(&self) -> i64 {
        self.fire_counter
    }

    /// Replaces the rule while keeping the rate-limiting counter.
    pub fn update(&mut self, spec: TriggerSpec) -> Result<()> {
        let (beat_active, quarter_active) = compile(&spec)?;
        self.spec = spec;
        self.beat_active = beat_active;
        self.quarter_active = quarter_active;
        Ok(())
    }

    /// Pure position test: does this quarter map onto an active pair?
    pub fn covers(&self, quarter_index: usize) -> bool {
        let position = quarter_index % (self.spec.loop_length * QUARTERS_PER_BEAT);
        let beat = position / QUARTERS_PER_BEAT;
        let quarter = position % QUARTERS_PER_BEAT;
        self.beat_active[beat] && self.quarter_active[quarter]
    }

    /// Decides whether the pattern fires for `snapshot`.
    ///
    /// `skip` is the effective trigger skip (the larger of the global and the
    /// per-target value, see [`effective_skip`]). Calling this several times
    /// with the same snapshot advances the fire counter only once.
    pub fn is_match<R: Rng>(&mut self, snapshot: &BeatSnapshot, skip: u32, rng: &mut R) -> bool {
        let mut triggered = snapshot.is_new_quarter && self.covers(snapshot.quarter_index);

        if triggered {
            if self.last_fired != Some(snapshot.fingerprint) {
                self.fire_counter += 1;
                self.last_fired = Some(snapshot.fingerprint);
            }
            triggered = self.fire_counter % i64::from(skip.max(1)) == 0;
        }

        let passes_gate = rng.random::<f64>() < self.spec.probability;
        triggered && passes_gate
    }
}

/// Combines the global trigger skip with an optional per-target skip.
pub fn effective_skip(global: u32, target: Option<u32>) -> u32 {
    global.max(target.unwrap_or(1)).max(1)
}

/// Parses quarter letters such as `"AC"` into a per-quarter bitset.
pub fn parse_quarters(quarters: &str) -> Result<[bool; QUARTERS_PER_BEAT]> {
    let mut active = [false; QUARTERS_PER_BEAT];
    for letter in quarters.chars() {
        let index = quarter_letter_index(letter)
            .ok_or_else(|| LightsError::config(format!("invalid quarter letter `{letter}`")))?;
        active[index] = true;
    }
    Ok(active)
}

pub(crate) fn quarter_letter_index(letter: char) -> Option<usize> {
    match letter.to_ascii_uppercase() {
        'A' => Some(0),
        'B' => Some(1),
        'C' => Some(2),
        'D' => Some(3),
        _ => None,
    }
}

fn compile(spec: &TriggerSpec) -> Result<(Vec<bool>, [bool; QUARTERS_PER_BEAT])> {
    if spec.loop_length == 0 {
        return Err(LightsError::config("trigger loop length must be at least one beat"));
    }
    if !(0.0..=1.0).contains(&spec.probability) {
        return Err(LightsError::config(format!(
            "trigger probability {} outside [0, 1]",
            spec.probability
        )));
    }

    let mut beat_active = vec![false; spec.loop_length];
    for &beat in &spec.beats {
        let slot = beat_active.get_mut(beat).ok_or_else(|| {
            LightsError::config(format!(
                "beat offset {beat} outside loop of {} beats",
                spec.loop_length
            ))
        })?;
        *slot = true;
    }

    Ok((beat_active, parse_quarters(&spec.quarters)?))
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn snapshot(quarter_index: usize, fingerprint: u64) -> BeatSnapshot {
        BeatSnapshot {
            quarter_index,
            is_new_quarter: true,
            beat_progress: 0.0,
            fingerprint: Fingerprint::new(fingerprint),
        }
    }

    #[test]
    fn covers_exactly_the_active_pairs() {
        let cases: [(&[usize], &str, usize); 4] = [
            (&[0], "A", 4),
            (&[0, 3], "AC", 8),
            (&[1, 2], "BD", 3),
            (&[0], "ABCD", 1),
        ];

        for (beats, quarters, loop_length) in cases {
            let pattern = TriggerPattern::new(beats, quarters, loop_length, 1.0).unwrap();
            let letters = parse_quarters(quarters).unwrap();
            for quarter_index in 0..256 {
                let position = quarter_index % (loop_length * 4);
                let expected = beats.contains(&(position / 4)) && letters[position % 4];
                assert_eq!(
                    pattern.covers(quarter_index),
                    expected,
                    "{beats:?} {quarters} {quarter_index}"
                );
            }
        }
    }

    #[test]
    fn matches_only_on_new_quarters() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut pattern = TriggerPattern::default();
        let mut snap = snapshot(0, 1);
        snap.is_new_quarter = false;
        assert!(!pattern.is_match(&snap, 1, &mut rng));
        assert!(pattern.is_match(&snapshot(16, 2), 1, &mut rng));
        assert!(!pattern.is_match(&snapshot(17, 3), 1, &mut rng));
    }

    #[test]
    fn skip_fires_every_nth_match() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut pattern = TriggerPattern::new(&[0], "ABCD", 1, 1.0).unwrap();

        let fired: Vec<bool> = (0..12)
            .map(|frame| pattern.is_match(&snapshot(frame, frame as u64 + 1), 3, &mut rng))
            .collect();

        let expected: Vec<bool> = (0..12).map(|i| i % 3 == 0).collect();
        assert_eq!(fired, expected);
        assert_eq!(fired.iter().filter(|fired| **fired).count(), 4);
    }

    #[test]
    fn skip_counts_matches_not_frames() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut pattern = TriggerPattern::new(&[0], "A", 1, 1.0).unwrap();
        let mut fires = Vec::new();

        // Every quarter is a frame with an edge, but only A quarters match.
        for quarter in 0..32 {
            if pattern.is_match(&snapshot(quarter, quarter as u64 + 1), 2, &mut rng) {
                fires.push(quarter);
            }
        }
        assert_eq!(fires, vec![0, 8, 16, 24]);
    }

    #[test]
    fn repeated_checks_in_one_frame_count_once() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut pattern = TriggerPattern::default();
        let snap = snapshot(0, 42);

        assert!(pattern.is_match(&snap, 2, &mut rng));
        assert!(pattern.is_match(&snap, 2, &mut rng));
        assert_eq!(pattern.fire_counter(), 0);
    }

    #[test]
    fn probability_gate_draws_even_without_match() {
        let mut gated = StdRng::seed_from_u64(9);
        let mut reference = StdRng::seed_from_u64(9);
        let mut pattern = TriggerPattern::new(&[0], "A", 4, 0.5).unwrap();

        let mut snap = snapshot(1, 1);
        snap.is_new_quarter = false;
        for _ in 0..5 {
            assert!(!pattern.is_match(&snap, 1, &mut gated));
            let _: f64 = reference.random();
        }
        assert_eq!(gated.random::<u64>(), reference.random::<u64>());
    }

    #[test]
    fn zero_probability_never_fires() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut pattern = TriggerPattern::new(&[0], "ABCD", 1, 0.0).unwrap();
        assert!((0..64).all(|q| !pattern.is_match(&snapshot(q, q as u64 + 1), 1, &mut rng)));
    }

    #[test]
    fn rejects_malformed_patterns() {
        assert!(TriggerPattern::new(&[0], "E", 4, 1.0).is_err());
        assert!(TriggerPattern::new(&[4], "A", 4, 1.0).is_err());
        assert!(TriggerPattern::new(&[0], "A", 0, 1.0).is_err());
        assert!(TriggerPattern::new(&[0], "A", 4, 1.5).is_err());
    }

    #[test]
    fn update_keeps_counter() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut pattern = TriggerPattern::default();
        pattern.is_match(&snapshot(0, 1), 1, &mut rng);
        pattern
            .update(TriggerSpec {
                beats: vec![1],
                quarters: "C".to_string(),
                loop_length: 2,
                probability: 1.0,
            })
            .unwrap();
        assert_eq!(pattern.fire_counter(), 0);
        assert!(pattern.covers(6));
        assert!(!pattern.covers(0));
    }

    #[test]
    fn effective_skip_takes_the_larger_value() {
        assert_eq!(effective_skip(1, None), 1);
        assert_eq!(effective_skip(2, Some(4)), 4);
        assert_eq!(effective_skip(3, Some(1)), 3);
        assert_eq!(effective_skip(0, None), 1);
    }
}
