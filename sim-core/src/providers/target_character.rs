use crate::extract::{closest_match, tags, with_parse_retries, ParseError, DEFAULT_MATCH_CUTOFF};
use crate::memory::describe_sim;
use crate::parameter::{names, parameter_map, FilledParameter, KnownValues, Parameter, ParameterMap};
use crate::provider::{Provider, ProviderError};
use crate::services::Services;
use crate::world::SimId;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::debug;

/// Picks the character an intent is aimed at among those nearby.
///
/// Nearby characters are labelled the way the actor knows them, and the
/// actor's memories relevant to the intent are summarized into the prompt.
pub struct TargetCharacterProvider {
    services: Services,
}

impl TargetCharacterProvider {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

fn choose_character(reply: &str, candidates: &[(SimId, String)]) -> Result<SimId, ParseError> {
    let body = tags::CHARACTER.find(reply)?;
    if let Ok(id) = tags::CHARACTER.find_integer(reply) {
        if let Some((sim, _)) = candidates.iter().find(|(sim, _)| sim.0 as i64 == id) {
            return Ok(*sim);
        }
    }
    let labels: Vec<&str> = candidates.iter().map(|(_, label)| label.as_str()).collect();
    closest_match(&body, &labels, DEFAULT_MATCH_CUTOFF)
        .and_then(|label| candidates.iter().find(|(_, l)| l.as_str() == *label))
        .map(|(sim, _)| *sim)
        .ok_or_else(|| ParseError::NoMatch {
            value: body,
            raw: reply.to_string(),
        })
}

#[async_trait]
impl Provider for TargetCharacterProvider {
    fn name(&self) -> &str {
        "target_character"
    }

    fn description(&self) -> &str {
        "Finds the character an action should target"
    }

    fn inputs(&self) -> ParameterMap {
        parameter_map([
            Parameter::required(names::ACTOR_CHARACTER_ID, "The acting character"),
            Parameter::required(names::INTENT, "What the character wants to do"),
        ])
    }

    fn outputs(&self) -> ParameterMap {
        parameter_map([Parameter::required(
            names::TARGET_CHARACTER_ID,
            "The character the action is aimed at",
        )])
    }

    async fn execute(
        &self,
        target: &Parameter,
        known: &KnownValues,
    ) -> Result<BTreeMap<String, FilledParameter>, ProviderError> {
        let actor: SimId = known.require(names::ACTOR_CHARACTER_ID)?;
        let intent: String = known.require(names::INTENT)?;

        let candidates: Vec<(SimId, String)> = {
            let world = self.services.world.read().await;
            let location = world.sim(actor)?.location_id;
            world
                .sims_at(location)
                .filter(|sim| sim.id != actor)
                .map(|sim| describe_sim(&world, actor, sim.id).map(|label| (sim.id, label)))
                .collect::<Result<_, _>>()?
        };
        if candidates.is_empty() {
            return Err(ProviderError::Failed("no characters nearby".into()));
        }

        let memories = self.services.memory.retrieve(&self.services.world, actor, &intent).await?;
        let recollection = self
            .services
            .memory
            .summarize_memories(
                &format!("What I remember that helps decide whom this concerns: {intent}"),
                &memories,
            )
            .await?;

        let listing: Vec<String> = candidates
            .iter()
            .map(|(id, label)| format!("(ID {id}: {label})"))
            .collect();
        let prompt = format!(
            "You find the character an action should target.\n\
             \n\
             Read the intent, what the acting character remembers and the characters \
             nearby, then pick the one the action is aimed at. Answer with their ID as \
             <Character>ID</Character>.\n\
             \n\
             Intent:\n{intent}\n\
             \n\
             What is needed:\n{}\n\
             \n\
             Memories:\n{}\n\
             \n\
             Characters nearby:\n{}\n",
            target.description,
            if recollection.is_empty() { "Nothing relevant" } else { recollection.as_str() },
            listing.join("\n"),
        );

        let (model, prompt, candidates) = (&self.services.model, &prompt, &candidates);
        let chosen = with_parse_retries(self.services.parse_retries, move || async move {
            let reply = model.complete(prompt).await?;
            Ok::<_, ProviderError>(choose_character(&reply, candidates)?)
        })
        .await?;
        debug!(actor = %actor, target = %chosen, "Target character chosen");

        Ok([(names::TARGET_CHARACTER_ID.to_string(), target.fill(chosen)?)]
            .into_iter()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Relationship;
    use crate::providers::tests::fixture;
    use serde_json::json;

    #[test]
    fn test_choose_character() {
        let candidates = vec![(SimId(1), "Piotr".to_string()), (SimId(2), "an old woman".to_string())];
        assert_eq!(choose_character("<Character>2</Character>", &candidates).unwrap(), SimId(2));
        assert_eq!(choose_character("<Character>piotr</Character>", &candidates).unwrap(), SimId(1));
        assert!(choose_character("<Character>0</Character>", &candidates).is_err());
    }

    #[tokio::test]
    async fn test_lists_nearby_by_relationship_name() {
        let fx = fixture(["<Character>1</Character>"]);
        {
            let mut world = fx.services.world.write().await;
            let anna = world.sim_mut(fx.anna).unwrap();
            anna.memory.set_relationship(fx.piotr, Relationship::new("Piotr the miller", "Sells flour"));
        }
        let provider = TargetCharacterProvider::new(fx.services.clone());
        let mut known = KnownValues::new();
        known.insert(names::ACTOR_CHARACTER_ID, json!(fx.anna.0));
        known.insert(names::INTENT, json!("Buy flour"));

        let out = provider
            .execute(&provider.outputs()[names::TARGET_CHARACTER_ID], &known)
            .await
            .unwrap();
        assert_eq!(out[names::TARGET_CHARACTER_ID].value, json!(fx.piotr.0));

        let prompt = &fx.model.prompts()[0];
        assert!(prompt.contains("(ID 1: Piotr the miller)"));
        assert!(prompt.contains("(ID 2: an old herbalist)"));
        assert!(!prompt.contains("(ID 0:"));
    }
}
