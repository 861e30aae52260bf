//! Frame pacing.
//!
//! ```text
//! <------- frame time ------->
//! | render |      sleep      |
//! ```
//!
//! [`FramePacer`] measures the render step, sleeps for the remainder of the
//! frame and feeds the observed overshoot back into a slowly growing
//! correction term so the long-run frame time converges on the target even
//! when the OS oversleeps.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::{LightsError, Result};

/// Number of frames kept in the rolling statistics windows.
pub const WINDOW: usize = 20;
/// Gain of the integral correction term.
pub const CORRECTION_TUNING: f64 = 0.02;
const MIN_SAMPLES: usize = 5;

/// Time source used by the pacer. Seconds are measured from an arbitrary,
/// monotonic origin.
pub trait Timer {
    fn now(&self) -> f64;
    fn sleep(&self, seconds: f64);
}

/// Monotonic wall clock backed by [`Instant`].
#[derive(Debug, Clone)]
pub struct SystemTimer {
    origin: Instant,
}

impl Default for SystemTimer {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Timer for SystemTimer {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn sleep(&self, seconds: f64) {
        if seconds > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(seconds));
        }
    }
}

/// Averaged pacing statistics, all derived from the rolling windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PacingStats {
    pub avg_frame_time: f64,
    /// Observed frames per second.
    pub avg_frame_time_inv: f64,
    pub avg_render_time: f64,
    pub avg_render_time_inv: f64,
    pub sleep_time: f64,
    pub delayed_frames: u64,
}

impl PacingStats {
    /// Flattens the statistics into a name → value map rounded to
    /// `precision` decimals, the shape polled by reporting collaborators.
    pub fn to_map(&self, precision: i32) -> BTreeMap<String, f64> {
        let factor = 10f64.powi(precision);
        let round = |value: f64| (value * factor).round() / factor;
        BTreeMap::from([
            ("avg_frame_time".to_string(), round(self.avg_frame_time)),
            ("avg_frame_time_inv".to_string(), round(self.avg_frame_time_inv)),
            ("avg_render_time".to_string(), round(self.avg_render_time)),
            ("avg_render_time_inv".to_string(), round(self.avg_render_time_inv)),
            ("sleep_time".to_string(), round(self.sleep_time)),
            ("delayed_frames".to_string(), self.delayed_frames as f64),
        ])
    }
}

#[derive(Debug)]
pub struct FramePacer<T: Timer = SystemTimer> {
    timer: T,
    target_frame_time: f64,
    frame_starts: VecDeque<f64>,
    render_times: VecDeque<f64>,
    t0: f64,
    t1: f64,
    t2: f64,
    sleep_time: f64,
    correction: f64,
    delayed_frames: u64,
}

impl FramePacer<SystemTimer> {
    pub fn new(fps: f64) -> Result<Self> {
        Self::with_timer(SystemTimer::default(), fps)
    }
}

impl<T: Timer> FramePacer<T> {
    pub fn with_timer(timer: T, fps: f64) -> Result<Self> {
        let now = timer.now();
        Ok(Self {
            target_frame_time: frame_time(fps)?,
            timer,
            frame_starts: VecDeque::with_capacity(WINDOW),
            render_times: VecDeque::with_capacity(WINDOW),
            t0: now,
            t1: now,
            t2: now,
            sleep_time: 0.0,
            correction: 0.0,
            delayed_frames: 0,
        })
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    pub fn now(&self) -> f64 {
        self.timer.now()
    }

    pub fn target_frame_time(&self) -> f64 {
        self.target_frame_time
    }

    pub fn set_fps(&mut self, fps: f64) -> Result<()> {
        self.target_frame_time = frame_time(fps)?;
        Ok(())
    }

    pub fn correction(&self) -> f64 {
        self.correction
    }

    pub fn delayed_frames(&self) -> u64 {
        self.delayed_frames
    }

    /// Start time of the current frame.
    pub fn frame_start(&self) -> f64 {
        self.t0
    }

    /// Records the start of a render cycle and returns its timestamp.
    pub fn mark_start(&mut self) -> f64 {
        self.t0 = self.timer.now();
        push_bounded(&mut self.frame_starts, self.t0);
        self.t0
    }

    pub fn mark_render_done(&mut self) {
        self.t1 = self.timer.now();
        push_bounded(&mut self.render_times, self.t1 - self.t0);
    }

    /// Sleeps for the rest of the frame. A frame whose render already ate the
    /// whole budget is counted as delayed instead.
    pub fn sleep_to_target(&mut self) {
        let render_time = self.t1 - self.t0;
        self.sleep_time = self.target_frame_time - render_time - self.correction;
        if self.sleep_time > 0.0 {
            self.timer.sleep(self.sleep_time);
        } else {
            self.delayed_frames += 1;
        }
    }

    pub fn mark_cycle_done(&mut self) {
        self.t2 = self.timer.now();
        let excess = (self.t2 - self.t0) - self.target_frame_time;
        self.correction += excess * CORRECTION_TUNING;
    }

    /// Runs everything that follows the render step.
    pub fn finish_frame(&mut self) {
        self.mark_render_done();
        self.sleep_to_target();
        self.mark_cycle_done();
    }

    pub fn stats(&self) -> PacingStats {
        let mut stats = PacingStats {
            sleep_time: self.sleep_time,
            delayed_frames: self.delayed_frames,
            ..PacingStats::default()
        };

        if self.render_times.len() >= MIN_SAMPLES {
            if let (Some(first), Some(last)) =
                (self.frame_starts.front(), self.frame_starts.back())
            {
                stats.avg_frame_time = (last - first) / (self.frame_starts.len() - 1) as f64;
                stats.avg_frame_time_inv = inverse(stats.avg_frame_time);
            }
            stats.avg_render_time =
                self.render_times.iter().sum::<f64>() / self.render_times.len() as f64;
            stats.avg_render_time_inv = inverse(stats.avg_render_time);
        }

        stats
    }
}

/// Periodically logs pacing statistics and warns about delayed frames.
#[derive(Debug, Clone)]
pub struct StatsReporter {
    interval: f64,
    last_log: f64,
    last_delayed: u64,
}

impl StatsReporter {
    pub fn new(interval: f64, now: f64) -> Self {
        Self {
            interval,
            last_log: now,
            last_delayed: 0,
        }
    }

    /// Logs once per interval. Returns the number of frames delayed during the
    /// interval that was just reported, if a report was made.
    pub fn notify(&mut self, now: f64, stats: &PacingStats) -> Option<u64> {
        if now - self.last_log < self.interval {
            return None;
        }

        tracing::debug!(?stats, "pacing statistics");
        let delayed = stats.delayed_frames.saturating_sub(self.last_delayed);
        if delayed > 0 {
            tracing::warn!(
                delayed,
                interval = self.interval,
                "frames delayed in the last interval"
            );
        }

        self.last_log = now;
        self.last_delayed = stats.delayed_frames;
        Some(delayed)
    }
}

fn frame_time(fps: f64) -> Result<f64> {
    if fps.is_finite() && fps > 0.0 {
        Ok(1.0 / fps)
    } else {
        Err(LightsError::config(format!("fps must be positive, got {fps}")))
    }
}

fn inverse(value: f64) -> f64 {
    if value > 0.0 {
        1.0 / value
    } else {
        0.0
    }
}

fn push_bounded(window: &mut VecDeque<f64>, value: f64) {
    if window.len() == WINDOW {
        window.pop_front();
    }
    window.push_back(value);
}
