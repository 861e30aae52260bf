use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

/// What the audio analysis collaborator reports for one analysed block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioEvent {
    /// A beat or hit was detected.
    pub is_beat: bool,
    /// Detection time, in the render loop's timer seconds.
    pub timestamp: f64,
    /// Overall loudness in `[0, 1]`.
    pub level: f32,
}

/// Creates the one-directional channel between an audio analysis task and
/// the render loop.
pub fn audio_channel() -> (AudioFeed, AudioLink) {
    let (sender, receiver) = crossbeam_channel::unbounded();
    (AudioFeed { sender }, AudioLink { receiver })
}

/// Producer half, owned by the analysis task.
#[derive(Debug, Clone)]
pub struct AudioFeed {
    sender: Sender<AudioEvent>,
}

impl AudioFeed {
    /// Publishes an event. Returns `false` once the render loop is gone.
    pub fn publish(&self, event: AudioEvent) -> bool {
        !matches!(self.sender.try_send(event), Err(TrySendError::Disconnected(_)))
    }
}

/// Consumer half, polled by the render loop once per frame.
#[derive(Debug)]
pub struct AudioLink {
    receiver: Receiver<AudioEvent>,
}

impl AudioLink {
    /// Takes everything pending without blocking. The newest event wins,
    /// except that `is_beat` is set if any of the drained events saw a beat.
    /// Returns `None` when nothing arrived since the last poll.
    pub fn poll(&mut self) -> Option<AudioEvent> {
        self.receiver.try_iter().reduce(|merged, next| AudioEvent {
            is_beat: merged.is_beat || next.is_beat,
            ..next
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(is_beat: bool, timestamp: f64) -> AudioEvent {
        AudioEvent {
            is_beat,
            timestamp,
            level: timestamp as f32,
        }
    }

    #[test]
    fn poll_keeps_newest_and_ors_beats() {
        let (feed, mut link) = audio_channel();
        feed.publish(event(true, 1.0));
        feed.publish(event(false, 2.0));
        feed.publish(event(false, 3.0));

        let merged = link.poll().unwrap();
        assert!(merged.is_beat);
        assert_eq!(merged.timestamp, 3.0);
        assert_eq!(merged.level, 3.0);
    }

    #[test]
    fn empty_poll_means_no_event() {
        let (feed, mut link) = audio_channel();
        assert_eq!(link.poll(), None);

        feed.publish(event(false, 1.0));
        assert!(!link.poll().unwrap().is_beat);
        assert_eq!(link.poll(), None);
    }

    #[test]
    fn publishing_after_consumer_drop_reports_disconnect() {
        let (feed, link) = audio_channel();
        drop(link);
        assert!(!feed.publish(event(true, 0.0)));
    }
}
