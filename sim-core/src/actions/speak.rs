use crate::dispatch::{Action, ActionError};
use crate::parameter::{KnownValues, ParameterMap, ParameterSet, Parameters};
use crate::services::Services;
use crate::world::{SimEvent, SimId};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// Say something out loud to the characters nearby
#[derive(Debug, Deserialize, Parameters)]
pub struct SpeakArgs {
    /// The character who is speaking
    pub actor_character_id: SimId,
    /// The character being spoken to, if anyone in particular
    pub target_character_id: Option<SimId>,
    /// The words spoken by the character
    pub speech: String,
}

/// Queues the speech for everyone else at the speaker's location.
pub struct SpeakAction {
    services: Services,
}

impl SpeakAction {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Action for SpeakAction {
    fn description(&self) -> &str {
        SpeakArgs::description()
    }

    fn parameters(&self) -> ParameterMap {
        SpeakArgs::parameters()
    }

    async fn execute(&self, args: KnownValues) -> Result<(), ActionError> {
        let args: SpeakArgs = args.extract()?;

        let mut world = self.services.world.write().await;
        let location = world.sim(args.actor_character_id)?.location_id;
        let listeners: Vec<SimId> = world
            .sims_at(location)
            .map(|sim| sim.id)
            .filter(|&id| id != args.actor_character_id)
            .collect();
        for &listener in &listeners {
            world.push_event(
                listener,
                SimEvent::Speech {
                    source: args.actor_character_id,
                    target: args.target_character_id,
                    text: args.speech.clone(),
                },
            )?;
        }
        debug!(speaker = %args.actor_character_id, listeners = listeners.len(), "Speech queued");
        Ok(())
    }
}
