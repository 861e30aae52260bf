use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    effect::{EffectActivation, EffectHandler},
    queue::Instruction,
    render::{GeneratorRegistry, LevelTable, RenderGraph, MAX_LEVEL},
    LightsError, Result,
};

/// A generator bound to one timeline level on every device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub level: usize,
    pub generator: String,
}

/// An instruction scheduled at one or more queue slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub instruction: Instruction,
    pub slots: Vec<usize>,
    /// Chance that the placement is kept when the timeline loads.
    #[serde(default = "default_probability")]
    pub probability: f64,
}

fn default_probability() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub name: String,
    #[serde(default)]
    pub selections: Vec<Selection>,
    #[serde(default)]
    pub placements: Vec<Placement>,
}

impl Timeline {
    /// Checks slots, levels and probabilities against a queue of
    /// `queue_length` slots.
    pub fn validate(&self, queue_length: usize) -> Result<()> {
        for selection in &self.selections {
            if selection.level == 0 || selection.level > MAX_LEVEL {
                return Err(LightsError::config(format!(
                    "timeline '{}' selects on level {}",
                    self.name, selection.level
                )));
            }
        }
        for placement in &self.placements {
            if !(0.0..=1.0).contains(&placement.probability) {
                return Err(LightsError::config(format!(
                    "timeline '{}' has placement probability {}",
                    self.name, placement.probability
                )));
            }
            if let Some(slot) = placement.slots.iter().find(|slot| **slot >= queue_length) {
                return Err(LightsError::config(format!(
                    "timeline '{}' places at slot {slot} outside queue of length {queue_length}",
                    self.name
                )));
            }
            if let Instruction::Device { level } = placement.instruction {
                if level > MAX_LEVEL {
                    return Err(LightsError::config(format!(
                        "timeline '{}' switches to level {level}",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Checks that every generator and effect named here is registered.
    pub fn check_names(&self, registry: &GeneratorRegistry, effects: &EffectHandler) -> Result<()> {
        if let Some(selection) = self
            .selections
            .iter()
            .find(|selection| !registry.contains(&selection.generator))
        {
            return Err(LightsError::UnknownGenerator(selection.generator.clone()));
        }
        for placement in &self.placements {
            if let Instruction::Effect { name, .. } = &placement.instruction {
                if !effects.contains(name) {
                    return Err(LightsError::UnknownEffect(name.clone()));
                }
            }
        }
        Ok(())
    }

    /// A solid pulse that hands over to a chase halfway through the loop,
    /// with a strobe burst before the turn.
    pub fn demo(queue_length: usize) -> Self {
        let half = queue_length / 2;
        Self {
            name: "demo".to_string(),
            selections: vec![
                Selection {
                    level: 1,
                    generator: "p_solid".to_string(),
                },
                Selection {
                    level: 2,
                    generator: "p_chase".to_string(),
                },
            ],
            placements: vec![
                Placement {
                    instruction: Instruction::Device { level: 1 },
                    slots: vec![0],
                    probability: 1.0,
                },
                Placement {
                    instruction: Instruction::Device { level: 2 },
                    slots: vec![half],
                    probability: 1.0,
                },
                Placement {
                    instruction: Instruction::Effect {
                        name: "e_strobe".to_string(),
                        activation: EffectActivation::Quarters {
                            quarters: 4,
                            multi: 1,
                            pattern: Default::default(),
                        },
                    },
                    slots: vec![half.saturating_sub(4)],
                    probability: 0.5,
                },
            ],
        }
    }
}

/// Holds every configured timeline and installs one at a time.
#[derive(Debug)]
pub struct Scheduler {
    timelines: Vec<Timeline>,
    active: Option<usize>,
}

impl Scheduler {
    /// Validates every timeline against the queue length and the registered
    /// generators and effects.
    pub fn new(
        timelines: Vec<Timeline>,
        queue_length: usize,
        registry: &GeneratorRegistry,
        effects: &EffectHandler,
    ) -> Result<Self> {
        for timeline in &timelines {
            timeline.validate(queue_length)?;
            timeline.check_names(registry, effects)?;
        }
        Ok(Self {
            timelines,
            active: None,
        })
    }

    pub fn timelines(&self) -> &[Timeline] {
        &self.timelines
    }

    pub fn active(&self) -> Option<usize> {
        self.active
    }

    /// Installs timeline `index`: every queue is cleared, generators are
    /// selected, and each placement is rolled once against its
    /// probability before being written to the queues. On error nothing
    /// has been changed.
    pub fn load<R: Rng>(
        &mut self,
        index: usize,
        graph: &mut RenderGraph,
        effects: &mut EffectHandler,
        registry: &GeneratorRegistry,
        rng: &mut R,
    ) -> Result<()> {
        let timeline = self.timelines.get(index).ok_or_else(|| {
            LightsError::config(format!(
                "no timeline {index}, {} configured",
                self.timelines.len()
            ))
        })?;

        let tables = graph
            .devices()
            .iter()
            .map(|_| {
                LevelTable::resolve(
                    registry,
                    timeline
                        .selections
                        .iter()
                        .map(|selection| (selection.level, selection.generator.as_str())),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        for (device, table) in graph.devices_mut().iter_mut().zip(tables) {
            device.queue_mut().clear();
            device.install_levels(table);
        }
        effects.queue_mut().clear();

        let mut placed = 0;
        for placement in &timeline.placements {
            if rng.random::<f64>() >= placement.probability {
                continue;
            }
            placed += 1;
            for &slot in &placement.slots {
                match &placement.instruction {
                    Instruction::Device { .. } => {
                        for device in graph.devices_mut() {
                            device.queue_mut().add(placement.instruction.clone(), slot);
                        }
                    }
                    Instruction::Effect { .. } => {
                        effects.queue_mut().add(placement.instruction.clone(), slot);
                    }
                }
            }
        }

        tracing::info!(
            timeline = %timeline.name,
            placed,
            total = timeline.placements.len(),
            "timeline loaded"
        );
        self.active = Some(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::{
        clock::{BeatSnapshot, Fingerprint},
        render::Device,
    };

    fn setup() -> (RenderGraph, EffectHandler, GeneratorRegistry) {
        let mut graph = RenderGraph::new();
        graph.register_device(Device::new(0, 4, 1, 16));
        graph.register_device(Device::new(1, 4, 1, 16));
        (graph, EffectHandler::with_builtins(2, 16), GeneratorRegistry::with_builtins())
    }

    fn at(quarter_index: usize, fingerprint: u64) -> BeatSnapshot {
        BeatSnapshot {
            quarter_index,
            is_new_quarter: true,
            beat_progress: 0.0,
            fingerprint: Fingerprint::new(fingerprint),
        }
    }

    fn level_switch(level: usize, slots: Vec<usize>, probability: f64) -> Placement {
        Placement {
            instruction: Instruction::Device { level },
            slots,
            probability,
        }
    }

    #[test]
    fn load_selects_generators_and_places_instructions() {
        let (mut graph, mut effects, registry) = setup();
        let timeline = Timeline {
            name: "t".to_string(),
            selections: vec![Selection {
                level: 2,
                generator: "p_chase".to_string(),
            }],
            placements: vec![level_switch(2, vec![3], 1.0)],
        };
        let mut scheduler = Scheduler::new(vec![timeline], 16, &registry, &effects).unwrap();
        let mut rng = StdRng::seed_from_u64(1);

        scheduler.load(0, &mut graph, &mut effects, &registry, &mut rng).unwrap();
        assert_eq!(scheduler.active(), Some(0));
        for device in graph.devices_mut() {
            assert_eq!(device.selected(2), Some("p_chase"));
            assert_eq!(device.queue_mut().pending(), 1);
        }

        graph.apply_instructions(&at(3, 0));
        assert!(graph.devices().iter().all(|device| device.level() == 2));
    }

    #[test]
    fn load_clears_previous_schedule() {
        let (mut graph, mut effects, registry) = setup();
        let first = Timeline {
            name: "first".to_string(),
            selections: vec![],
            placements: vec![level_switch(3, vec![1, 2, 3], 1.0)],
        };
        let second = Timeline {
            name: "second".to_string(),
            selections: vec![],
            placements: vec![],
        };
        let mut scheduler = Scheduler::new(vec![first, second], 16, &registry, &effects).unwrap();
        let mut rng = StdRng::seed_from_u64(1);

        scheduler.load(0, &mut graph, &mut effects, &registry, &mut rng).unwrap();
        effects.queue_mut().add(
            Instruction::Effect {
                name: "e_dim".to_string(),
                activation: EffectActivation::frames(2),
            },
            5,
        );
        scheduler.load(1, &mut graph, &mut effects, &registry, &mut rng).unwrap();

        assert_eq!(effects.queue_mut().pending(), 0);
        for device in graph.devices_mut() {
            assert_eq!(device.queue_mut().pending(), 0);
            assert_eq!(device.selected(1), None);
        }
    }

    #[test]
    fn zero_probability_placements_are_dropped() {
        let (mut graph, mut effects, registry) = setup();
        let timeline = Timeline {
            name: "t".to_string(),
            selections: vec![],
            placements: vec![level_switch(2, vec![0], 0.0), level_switch(3, vec![8], 1.0)],
        };
        let mut scheduler = Scheduler::new(vec![timeline], 16, &registry, &effects).unwrap();
        let mut rng = StdRng::seed_from_u64(9);

        scheduler.load(0, &mut graph, &mut effects, &registry, &mut rng).unwrap();
        assert_eq!(graph.devices_mut()[0].queue_mut().pending(), 1);
    }

    #[test]
    fn validation_rejects_bad_timelines() {
        let out_of_range = Timeline {
            name: "slots".to_string(),
            selections: vec![],
            placements: vec![level_switch(1, vec![16], 1.0)],
        };
        let registry = GeneratorRegistry::with_builtins();
        let effects = EffectHandler::with_builtins(1, 16);
        assert!(Scheduler::new(vec![out_of_range], 16, &registry, &effects).is_err());

        let bad_level = Timeline {
            name: "level".to_string(),
            selections: vec![Selection {
                level: 0,
                generator: "p_solid".to_string(),
            }],
            placements: vec![],
        };
        assert!(bad_level.validate(16).is_err());

        let bad_probability = Timeline {
            name: "p".to_string(),
            selections: vec![],
            placements: vec![level_switch(1, vec![0], 1.5)],
        };
        assert!(bad_probability.validate(16).is_err());
        assert!(Timeline::demo(128).validate(128).is_ok());
    }

    #[test]
    fn unknown_names_are_rejected_at_construction() {
        let (_, effects, registry) = setup();
        let typo = Timeline {
            name: "typo".to_string(),
            selections: vec![Selection {
                level: 1,
                generator: "p_missing".to_string(),
            }],
            placements: vec![],
        };
        assert!(matches!(
            Scheduler::new(vec![typo], 16, &registry, &effects),
            Err(LightsError::UnknownGenerator(_))
        ));

        let missing_effect = Timeline {
            name: "effect".to_string(),
            selections: vec![],
            placements: vec![Placement {
                instruction: Instruction::Effect {
                    name: "e_missing".to_string(),
                    activation: EffectActivation::frames(1),
                },
                slots: vec![0],
                probability: 1.0,
            }],
        };
        assert!(matches!(
            Scheduler::new(vec![missing_effect], 16, &registry, &effects),
            Err(LightsError::UnknownEffect(_))
        ));
    }

    #[test]
    fn failed_load_leaves_every_device_untouched() {
        let (mut graph, mut effects, registry) = setup();
        let good = Timeline {
            name: "good".to_string(),
            selections: vec![Selection {
                level: 1,
                generator: "p_chase".to_string(),
            }],
            placements: vec![level_switch(2, vec![4], 1.0)],
        };
        let mut scheduler = Scheduler::new(vec![good], 16, &registry, &effects).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        scheduler.load(0, &mut graph, &mut effects, &registry, &mut rng).unwrap();

        // A registry that lost the generator makes resolution fail mid-load.
        let empty = GeneratorRegistry::new();
        assert!(matches!(
            scheduler.load(0, &mut graph, &mut effects, &empty, &mut rng),
            Err(LightsError::UnknownGenerator(_))
        ));
        assert!(scheduler.load(4, &mut graph, &mut effects, &registry, &mut rng).is_err());

        assert_eq!(scheduler.active(), Some(0));
        for device in graph.devices_mut() {
            assert_eq!(device.selected(1), Some("p_chase"));
            assert_eq!(device.queue_mut().pending(), 1);
        }
    }
}
