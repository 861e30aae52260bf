//! Musical time keeping.
//!
//! [`BeatClock`] turns monotonic wall time (seconds) into a quantized position
//! inside a repeating loop of quarter beats. Each frame gets exactly one
//! [`BeatSnapshot`]; asking again within the same frame returns the cached
//! value so "new quarter" edges are never counted twice.

use serde::{Deserialize, Serialize};

use crate::{LightsError, Result};

pub const QUARTERS_PER_BEAT: usize = 4;

const QUARTER_LETTERS: [char; QUARTERS_PER_BEAT] = ['A', 'B', 'C', 'D'];

/// Current musical speed. The effective tempo is `bpm_base * bpm_multiplier`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TempoConfig {
    pub bpm_base: f64,
    pub bpm_multiplier: f64,
}

impl Default for TempoConfig {
    fn default() -> Self {
        Self {
            bpm_base: 140.0,
            bpm_multiplier: 1.0,
        }
    }
}

impl TempoConfig {
    pub fn new(bpm_base: f64, bpm_multiplier: f64) -> Result<Self> {
        let tempo = Self {
            bpm_base,
            bpm_multiplier,
        };
        tempo.validate()?;
        Ok(tempo)
    }

    pub fn validate(&self) -> Result<()> {
        let bpm = self.bpm();
        if bpm.is_finite() && bpm > 0.0 {
            Ok(())
        } else {
            Err(LightsError::InvalidTempo(bpm))
        }
    }

    pub fn bpm(&self) -> f64 {
        self.bpm_base * self.bpm_multiplier
    }

    /// Length of one beat in seconds.
    pub fn beat_time(&self) -> f64 {
        60.0 / self.bpm()
    }

    /// Length of one quarter beat in seconds.
    pub fn quarter_time(&self) -> f64 {
        self.beat_time() / QUARTERS_PER_BEAT as f64
    }
}

/// Identifies the computation that produced a snapshot. Two snapshots with the
/// same fingerprint belong to the same frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// Musical position of a single frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatSnapshot {
    /// Quarter counter modulo the queue length.
    pub quarter_index: usize,
    /// True on the first frame of a quarter.
    pub is_new_quarter: bool,
    /// Progress through the current beat in `[0, 1)`.
    pub beat_progress: f64,
    pub fingerprint: Fingerprint,
}

impl BeatSnapshot {
    pub fn is_beat(&self) -> bool {
        self.is_new_quarter && self.quarter_index % QUARTERS_PER_BEAT == 0
    }

    pub fn beat_index(&self) -> usize {
        self.quarter_index / QUARTERS_PER_BEAT
    }

    pub fn quarter_in_beat(&self) -> usize {
        self.quarter_index % QUARTERS_PER_BEAT
    }

    pub fn quarter_letter(&self) -> char {
        QUARTER_LETTERS[self.quarter_in_beat()]
    }

    /// Progress through a window of `n_beats` beats, in `[0, 1)`.
    pub fn beat_progress_n(&self, n_beats: usize) -> f64 {
        let n_beats = n_beats.max(1);
        ((self.beat_index() % n_beats) as f64 + self.beat_progress) / n_beats as f64
    }
}

impl std::fmt::Display for BeatSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "beats: {}", self.beat_index())?;
        if self.is_new_quarter {
            write!(f, " | {}", self.quarter_letter())?;
        }
        Ok(())
    }
}

/// Converts elapsed time since a sync epoch into a [`BeatSnapshot`].
#[derive(Debug, Clone)]
pub struct BeatClock {
    tempo: TempoConfig,
    queue_length: usize,
    sync_epoch: f64,
    previous_quarter: usize,
    last_sample: Option<f64>,
    generation: u64,
    cached: BeatSnapshot,
}

impl BeatClock {
    /// Creates a clock whose beat zero is `now`.
    pub fn new(tempo: TempoConfig, queue_length: usize, now: f64) -> Result<Self> {
        tempo.validate()?;
        if queue_length == 0 {
            return Err(LightsError::config("queue length must be at least one quarter"));
        }

        Ok(Self {
            tempo,
            queue_length,
            sync_epoch: now,
            previous_quarter: 0,
            last_sample: None,
            generation: 0,
            cached: BeatSnapshot {
                quarter_index: 0,
                is_new_quarter: false,
                beat_progress: 0.0,
                fingerprint: Fingerprint::default(),
            },
        })
    }

    pub fn tempo(&self) -> TempoConfig {
        self.tempo
    }

    pub fn queue_length(&self) -> usize {
        self.queue_length
    }

    pub fn quarter_time(&self) -> f64 {
        self.tempo.quarter_time()
    }

    pub fn sync_epoch(&self) -> f64 {
        self.sync_epoch
    }

    pub fn set_tempo(&mut self, tempo: TempoConfig) -> Result<()> {
        tempo.validate()?;
        self.tempo = tempo;
        self.last_sample = None;
        Ok(())
    }

    pub fn set_bpm_multiplier(&mut self, multiplier: f64) -> Result<()> {
        self.set_tempo(TempoConfig {
            bpm_multiplier: multiplier,
            ..self.tempo
        })
    }

    /// Rebases beat zero onto `now`.
    pub fn resync(&mut self, now: f64) {
        self.sync_epoch = now;
        self.last_sample = None;
    }

    /// Nudges the phase by `delta` seconds without a full resync.
    pub fn shift_epoch(&mut self, delta: f64) {
        self.sync_epoch += delta;
        self.last_sample = None;
    }

    /// Most recently computed snapshot.
    pub fn current(&self) -> BeatSnapshot {
        self.cached
    }

    /// Returns the snapshot for the frame sampled at `now`.
    ///
    /// The position is only recomputed once `now` moves past the last sample;
    /// repeated calls within a frame return the cached snapshot.
    pub fn snapshot(&mut self, now: f64) -> BeatSnapshot {
        if let Some(last) = self.last_sample {
            if now <= last {
                return self.cached;
            }
        }

        let quarter_time = self.tempo.quarter_time();
        let elapsed = now - self.sync_epoch;
        let quarters_elapsed = (elapsed / quarter_time).floor() as i64;
        let quarter_index = quarters_elapsed.rem_euclid(self.queue_length as i64) as usize;
        let fractional = elapsed.rem_euclid(quarter_time) / quarter_time;
        let beat_progress = ((quarter_index % QUARTERS_PER_BEAT) as f64 + fractional) * 0.25;

        self.generation += 1;
        self.cached = BeatSnapshot {
            quarter_index,
            is_new_quarter: quarter_index != self.previous_quarter,
            beat_progress,
            fingerprint: Fingerprint(self.generation),
        };
        self.previous_quarter = quarter_index;
        self.last_sample = Some(now);
        self.cached
    }
}
