use crate::dispatch::{Action, ActionError};
use crate::extract::{closest_match, tags, with_parse_retries, ParseError};
use crate::parameter::{KnownValues, ParameterMap, ParameterSet, Parameters};
use crate::perception::ObservationMaker;
use crate::services::Services;
use crate::world::{LocationId, ObjectId, SimId};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

/// Gather resources from an object
#[derive(Debug, Deserialize, Parameters)]
pub struct HarvestArgs {
    /// The character doing the harvesting
    pub actor_character_id: SimId,
    /// Where the object is
    pub location_id: LocationId,
    /// The object being harvested
    pub target_object_id: ObjectId,
    /// Whether the object is used up by the harvest
    pub destroy: Option<bool>,
}

/// What the model says a harvest did to the object.
#[derive(Debug, Clone, PartialEq)]
struct HarvestOutcome {
    outcome: String,
    destroy: bool,
}

fn parse_outcome(reply: &str) -> Result<HarvestOutcome, ParseError> {
    let outcome = tags::OUTCOME.find(reply)?;
    let answer = tags::DESTROY.find(reply)?;
    let destroy = closest_match(&answer, &["yes", "no"], 0.5)
        .map(|choice| *choice == "yes")
        .ok_or_else(|| ParseError::NoMatch {
            value: answer,
            raw: reply.to_string(),
        })?;
    Ok(HarvestOutcome { outcome, destroy })
}

/// Harvests an object. The outcome is remembered by the harvester, and a
/// destroyed object disappears from the location together with everything
/// the harvester remembered about it. Either way the harvest is recorded as
/// an observation.
pub struct HarvestAction {
    services: Services,
}

impl HarvestAction {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Action for HarvestAction {
    fn description(&self) -> &str {
        HarvestArgs::description()
    }

    fn parameters(&self) -> ParameterMap {
        HarvestArgs::parameters()
    }

    async fn execute(&self, args: KnownValues) -> Result<(), ActionError> {
        let args: HarvestArgs = args.extract()?;
        let world = &self.services.world;

        let (object_name, prompt) = {
            let world = world.read().await;
            let sim = world.sim(args.actor_character_id)?;
            let object = world
                .location(args.location_id)?
                .object(args.target_object_id)?;
            let prompt = format!(
                "You decide the outcome of harvesting an object.\n\
                 \n\
                 Describe what the character gathers and the state the object is left \
                 in as <Outcome>text</Outcome>, then say whether the object is used up \
                 as <Destroy>Yes/No</Destroy>.\n\
                 \n\
                 Character:\n{}, {}\n\
                 \n\
                 Object:\n{}. {}\n",
                sim.name, sim.description, object.name, object.description,
            );
            (object.name.clone(), prompt)
        };

        let (model, prompt) = (&self.services.model, &prompt);
        let mut outcome = with_parse_retries(self.services.parse_retries, move || async move {
            let reply = model.complete(prompt).await?;
            Ok::<_, ActionError>(parse_outcome(&reply)?)
        })
        .await?;
        if let Some(destroy) = args.destroy {
            outcome.destroy = destroy;
        }

        let mut context = format!("Harvested {object_name}. {}", outcome.outcome);
        if outcome.destroy {
            context.push_str(&format!(" Destroyed {object_name}."));
        }
        let observer = ObservationMaker::new(self.services.clone());
        let draft = observer
            .draft(args.actor_character_id, &context, Some(args.location_id))
            .await?;

        if outcome.destroy {
            world
                .write()
                .await
                .location_mut(args.location_id)?
                .remove_object(args.target_object_id)?;
            self.services
                .memory
                .delete_object_memory(
                    world,
                    args.actor_character_id,
                    args.location_id,
                    args.target_object_id,
                )
                .await?;
        } else {
            self.services
                .memory
                .add_object_memory(
                    world,
                    args.actor_character_id,
                    args.location_id,
                    args.target_object_id,
                    &outcome.outcome,
                )
                .await?;
        }
        observer.record(args.actor_character_id, &draft).await?;
        world
            .write()
            .await
            .sim_mut(args.actor_character_id)?
            .current_activity = Some(format!("Harvesting {object_name}"));
        info!(object = %args.target_object_id, destroyed = outcome.destroy, "Object harvested");
        Ok(())
    }
}
