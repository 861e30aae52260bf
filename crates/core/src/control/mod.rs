//! Requests from control surfaces.
//!
//! Messages may arrive from any thread at any time. They are only buffered
//! here; the engine applies them together at the start of the next cycle.

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::{effect::EffectActivation, trigger::TriggerSpec};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Make "now" beat zero.
    SetSync,
    /// Shift the beat phase by `value` seconds.
    AdjustSync { value: f64 },
    SetBpm { bpm: f64 },
    SetBpmMultiplier { multiplier: f64 },
    SetFps { fps: f64 },
    SetTriggerskip { skip: u32 },
    SetDeviceTriggerskip { device: usize, skip: Option<u32> },
    SetEffectsEnabled { enabled: bool },
    SetBrightness { brightness: f32 },
    /// Force a timeline level, on one device or on all of them.
    SetLevel { device: Option<usize>, level: usize },
    /// Replace the trigger rule of the generator on `level`.
    RenewDeviceTrigger {
        device: Option<usize>,
        level: usize,
        trigger: TriggerSpec,
    },
    /// Switch the active generators to their alternate look.
    AlternateDevice { device: Option<usize> },
    LoadEffect { name: String, activation: EffectActivation },
    RemoveEffect { name: String },
    RenewEffectTrigger { name: String },
    AlternateEffect { name: String },
    SwitchTimeline { index: usize },
}

pub fn control_channel() -> (ControlHandle, ControlQueue) {
    let (sender, receiver) = crossbeam_channel::unbounded();
    (ControlHandle { sender }, ControlQueue { receiver })
}

/// Cloneable sending side handed to control surfaces.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    sender: Sender<ControlMessage>,
}

impl ControlHandle {
    /// Queues a message. Returns `false` if the engine has shut down.
    pub fn send(&self, message: ControlMessage) -> bool {
        self.sender.send(message).is_ok()
    }
}

#[derive(Debug)]
pub struct ControlQueue {
    receiver: Receiver<ControlMessage>,
}

impl ControlQueue {
    /// Everything queued since the last call, in arrival order.
    pub fn drain(&self) -> Vec<ControlMessage> {
        self.receiver.try_iter().collect()
    }
}
