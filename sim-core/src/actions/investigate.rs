use crate::dispatch::{Action, ActionError};
use crate::extract::{tags, with_parse_retries};
use crate::parameter::{KnownValues, ParameterMap, ParameterSet, Parameters};
use crate::perception::ObservationMaker;
use crate::services::Services;
use crate::world::{LocationId, ObjectId, SimId};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

/// Look closely at an object to learn something about it
#[derive(Debug, Deserialize, Parameters)]
pub struct InvestigateArgs {
    /// The character doing the investigating
    pub actor_character_id: SimId,
    /// Where the object is
    pub location_id: LocationId,
    /// The object being investigated
    pub target_object_id: ObjectId,
    /// What the character hopes to find out
    pub intent: String,
}

/// Asks the model what the character finds, remembers it as an object
/// memory and records the investigation as an observation.
pub struct InvestigateAction {
    services: Services,
}

impl InvestigateAction {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Action for InvestigateAction {
    fn description(&self) -> &str {
        InvestigateArgs::description()
    }

    fn parameters(&self) -> ParameterMap {
        InvestigateArgs::parameters()
    }

    async fn execute(&self, args: KnownValues) -> Result<(), ActionError> {
        let args: InvestigateArgs = args.extract()?;

        let (object_name, prompt) = {
            let world = self.services.world.read().await;
            let sim = world.sim(args.actor_character_id)?;
            let location = world.location(args.location_id)?;
            let object = location.object(args.target_object_id)?;
            let known = sim
                .memory
                .object_memory(args.location_id, args.target_object_id)
                .unwrap_or("Nothing yet");
            let prompt = format!(
                "You decide what a character learns by investigating an object.\n\
                 \n\
                 Read the intent, the object and what the character already knows \
                 about it, then describe what they find as <Information>text</Information>. \
                 Only report what can be seen or felt.\n\
                 \n\
                 Intent:\n{}\n\
                 \n\
                 Character:\n{}, {}\n\
                 \n\
                 Location:\n{}: {}\n\
                 \n\
                 Object:\n{}. {}\n\
                 \n\
                 Already known:\n{}\n",
                args.intent,
                sim.name,
                sim.description,
                location.name,
                location.description,
                object.name,
                object.description,
                known,
            );
            (object.name.clone(), prompt)
        };

        let (model, prompt) = (&self.services.model, &prompt);
        let information = with_parse_retries(self.services.parse_retries, move || async move {
            let reply = model.complete(prompt).await?;
            Ok::<_, ActionError>(tags::INFORMATION.find(&reply)?)
        })
        .await?;

        let observer = ObservationMaker::new(self.services.clone());
        let draft = observer
            .draft(
                args.actor_character_id,
                &format!(
                    "Investigated the object {object_name}. Intent: {}. Information: {information}",
                    args.intent
                ),
                Some(args.location_id),
            )
            .await?;

        self.services
            .memory
            .add_object_memory(
                &self.services.world,
                args.actor_character_id,
                args.location_id,
                args.target_object_id,
                &information,
            )
            .await?;
        observer.record(args.actor_character_id, &draft).await?;
        self.services
            .world
            .write()
            .await
            .sim_mut(args.actor_character_id)?
            .current_activity = Some(format!("Investigating {object_name}"));
        info!(object = %args.target_object_id, "Object investigated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::names;
    use crate::providers::tests::{fixture, OBSERVATION_REPLY};
    use serde_json::json;

    fn args(fx: &crate::providers::tests::Fixture, object: ObjectId) -> KnownValues {
        let mut args = KnownValues::new();
        args.insert(names::ACTOR_CHARACTER_ID, json!(fx.anna.0));
        args.insert(names::LOCATION_ID, json!(fx.village.0));
        args.insert(names::TARGET_OBJECT_ID, json!(object.0));
        args.insert(names::INTENT, json!("Check if the water is clean"));
        args
    }

    #[tokio::test]
    async fn test_findings_are_remembered() {
        let fx = fixture([
            "<Information>The water is clear</Information>",
            OBSERVATION_REPLY,
            "I cannot tell.",
            "<Information>A bucket hangs on a rope</Information>",
            OBSERVATION_REPLY,
        ]);
        let action = InvestigateAction::new(fx.services.clone());

        action.execute(args(&fx, fx.well)).await.unwrap();
        action.execute(args(&fx, fx.well)).await.unwrap();

        let world = fx.services.world.read().await;
        let anna = world.sim(fx.anna).unwrap();
        assert_eq!(
            anna.memory.object_memory(fx.village, fx.well),
            Some("The water is clear. A bucket hangs on a rope")
        );
        assert_eq!(anna.memory.len(), 2);
        assert_eq!(anna.current_activity.as_deref(), Some("Investigating Stone well"));

        let prompts = fx.model.prompts();
        assert!(prompts[1].contains("Investigated the object Stone well"));
        assert!(prompts[1].contains("Information: The water is clear"));
        // The second investigation sees the first finding.
        assert!(prompts[2].contains("The water is clear"));
    }

    #[tokio::test]
    async fn test_unknown_object() {
        let fx = fixture(["<Information>x</Information>"]);
        let action = InvestigateAction::new(fx.services.clone());
        let err = action.execute(args(&fx, ObjectId(42))).await.unwrap_err();
        assert!(matches!(err, ActionError::World(_)));
        assert!(fx.model.prompts().is_empty());
    }
}
