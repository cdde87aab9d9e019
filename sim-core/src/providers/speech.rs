use crate::extract::{tags, with_parse_retries};
use crate::memory::describe_sim;
use crate::parameter::{names, parameter_map, FilledParameter, KnownValues, Parameter, ParameterMap};
use crate::provider::{Provider, ProviderError};
use crate::services::Services;
use crate::world::SimId;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Writes what a character says, to another character or to whoever is
/// around.
pub struct SpeechProvider {
    services: Services,
}

impl SpeechProvider {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Provider for SpeechProvider {
    fn name(&self) -> &str {
        "speech"
    }

    fn description(&self) -> &str {
        "Writes the words a character says"
    }

    fn inputs(&self) -> ParameterMap {
        parameter_map([
            Parameter::required(names::ACTOR_CHARACTER_ID, "The character who is speaking"),
            Parameter::required(names::INTENT, "What the speaker wants to achieve"),
            Parameter::optional(names::TARGET_CHARACTER_ID, "The character being spoken to"),
        ])
    }

    fn outputs(&self) -> ParameterMap {
        parameter_map([Parameter::required(
            names::SPEECH,
            "The words spoken by the character",
        )])
    }

    async fn execute(
        &self,
        target: &Parameter,
        known: &KnownValues,
    ) -> Result<BTreeMap<String, FilledParameter>, ProviderError> {
        let actor: SimId = known.require(names::ACTOR_CHARACTER_ID)?;
        let listener: Option<SimId> = known.get(names::TARGET_CHARACTER_ID)?;
        let intent: String = known.require(names::INTENT)?;

        let (speaker, listener_text) = {
            let world = self.services.world.read().await;
            let sim = world.sim(actor)?;
            (
                format!("{}, {}", sim.name, sim.description),
                match listener {
                    Some(listener) => describe_sim(&world, actor, listener)?,
                    None => "No one in particular. Anyone nearby may hear it.".to_string(),
                },
            )
        };

        let prompt = format!(
            "You write what a character says.\n\
             \n\
             Read the speaker's intent, who they are and whom they talk to, if anyone, \
             then write the words they say as <Speech>words</Speech>.\n\
             \n\
             Intent:\n{intent}\n\
             \n\
             Speaker:\n{speaker}\n\
             \n\
             Listener:\n{listener_text}\n"
        );

        let (model, prompt) = (&self.services.model, &prompt);
        let speech = with_parse_retries(self.services.parse_retries, move || async move {
            let reply = model.complete(prompt).await?;
            Ok::<_, ProviderError>(tags::SPEECH.find(&reply)?)
        })
        .await?;

        Ok([(names::SPEECH.to_string(), target.fill(speech)?)]
            .into_iter()
            .collect())
    }
}
