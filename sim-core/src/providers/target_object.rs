use crate::extract::{closest_match, tags, with_parse_retries, ParseError, DEFAULT_MATCH_CUTOFF};
use crate::parameter::{names, parameter_map, FilledParameter, KnownValues, Parameter, ParameterMap};
use crate::provider::{Provider, ProviderError};
use crate::services::Services;
use crate::world::{LocationId, ObjectId, SimId, WorldObject};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::debug;

/// Picks the object at a location that an intent is about.
pub struct TargetObjectProvider {
    services: Services,
}

impl TargetObjectProvider {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    fn prompt(
        intent: &str,
        details: &str,
        location: &str,
        objects: &str,
        character: &str,
    ) -> String {
        format!(
            "You identify which object a character means.\n\
             \n\
             Read the intent, the location and the objects there, then pick the \
             object the intent is aimed at. Answer with its ID as <Object>ID</Object>.\n\
             \n\
             Intent:\n{intent}\n\
             \n\
             What is needed:\n{details}\n\
             \n\
             Location:\n{location}\n\
             \n\
             Objects:\n{objects}\n\
             \n\
             Character:\n{character}\n"
        )
    }
}

/// Map a reply onto one of `objects`: an integer naming an object id wins,
/// otherwise the tag text is matched against object names.
fn choose_object(reply: &str, objects: &[WorldObject]) -> Result<ObjectId, ParseError> {
    let body = tags::OBJECT.find(reply)?;
    if let Ok(id) = tags::OBJECT.find_integer(reply) {
        if let Some(object) = objects.iter().find(|o| o.id.0 as i64 == id) {
            return Ok(object.id);
        }
    }
    let names: Vec<&str> = objects.iter().map(|o| o.name.as_str()).collect();
    closest_match(&body, &names, DEFAULT_MATCH_CUTOFF)
        .and_then(|name| objects.iter().find(|o| o.name == *name))
        .map(|o| o.id)
        .ok_or_else(|| ParseError::NoMatch {
            value: body,
            raw: reply.to_string(),
        })
}

#[async_trait]
impl Provider for TargetObjectProvider {
    fn name(&self) -> &str {
        "target_object"
    }

    fn description(&self) -> &str {
        "Identifies the object an intent is aimed at"
    }

    fn inputs(&self) -> ParameterMap {
        parameter_map([
            Parameter::required(names::INTENT, "What the character wants to do"),
            Parameter::required(names::LOCATION_ID, "Where the action takes place"),
            Parameter::optional(names::ACTOR_CHARACTER_ID, "The acting character"),
        ])
    }

    fn outputs(&self) -> ParameterMap {
        parameter_map([Parameter::required(
            names::TARGET_OBJECT_ID,
            "The object the action is aimed at",
        )])
    }

    async fn execute(
        &self,
        target: &Parameter,
        known: &KnownValues,
    ) -> Result<BTreeMap<String, FilledParameter>, ProviderError> {
        let intent: String = known.require(names::INTENT)?;
        let location_id: LocationId = known.require(names::LOCATION_ID)?;
        let actor: Option<SimId> = known.get(names::ACTOR_CHARACTER_ID)?;

        let (location_text, objects, objects_text, character_text) = {
            let world = self.services.world.read().await;
            let location = world.location(location_id)?;
            let objects: Vec<WorldObject> = location.objects.values().cloned().collect();
            let remembered = |object: &WorldObject| {
                actor
                    .and_then(|a| world.sim(a).ok())
                    .and_then(|sim| sim.memory.object_memory(location_id, object.id))
                    .map(str::to_string)
            };
            let objects_text: Vec<String> = objects
                .iter()
                .map(|o| match remembered(o) {
                    Some(memory) => format!("(ID {}: {}. {} I remember: {})", o.id, o.name, o.description, memory),
                    None => format!("(ID {}: {}. {})", o.id, o.name, o.description),
                })
                .collect();
            let character_text = match actor {
                Some(a) => {
                    let sim = world.sim(a)?;
                    format!("{}, {}", sim.name, sim.description)
                }
                None => "Not provided".to_string(),
            };
            (
                format!("{}: {}", location.name, location.description),
                objects,
                objects_text.join("\n"),
                character_text,
            )
        };

        if objects.is_empty() {
            return Err(ProviderError::Failed(format!(
                "there are no objects at location {location_id}"
            )));
        }

        let location_text = self
            .services
            .memory
            .summarizer()
            .summarize(
                &format!("Details that help find the object meant by this intent: {intent}"),
                &location_text,
            )
            .await?;

        let prompt = Self::prompt(
            &intent,
            &target.description,
            &location_text,
            &objects_text,
            &character_text,
        );
        let (model, prompt, objects) = (&self.services.model, &prompt, &objects);
        let object_id = with_parse_retries(self.services.parse_retries, move || async move {
            let reply = model.complete(prompt).await?;
            Ok::<_, ProviderError>(choose_object(&reply, objects)?)
        })
        .await?;
        debug!(object = %object_id, "Target object chosen");

        Ok([(names::TARGET_OBJECT_ID.to_string(), target.fill(object_id)?)]
            .into_iter()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::tests::fixture;
    use serde_json::json;

    fn objects() -> Vec<WorldObject> {
        vec![
            WorldObject {
                id: ObjectId(0),
                name: "Stone well".into(),
                description: "".into(),
            },
            WorldObject {
                id: ObjectId(4),
                name: "Apple tree".into(),
                description: "".into(),
            },
        ]
    }

    #[test]
    fn test_choose_object_by_id_or_name() {
        let objects = objects();
        assert_eq!(choose_object("<Object>4</Object>", &objects).unwrap(), ObjectId(4));
        assert_eq!(
            choose_object("<Object> the apple tree </Object>", &objects).unwrap(),
            ObjectId(4)
        );
        // 7 is not an object id, so the text decides.
        assert_eq!(
            choose_object("<Object>stone well 7</Object>", &objects).unwrap(),
            ObjectId(0)
        );
        assert!(matches!(
            choose_object("<Object>9</Object>", &objects),
            Err(ParseError::NoMatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_execute_retries_bad_reply() {
        let fx = fixture(["The well, probably.", "<Object>1</Object>"]);
        let provider = TargetObjectProvider::new(fx.services.clone());

        let mut known = KnownValues::new();
        known.insert(names::INTENT, json!("Look at the tree"));
        known.insert(names::LOCATION_ID, json!(fx.village.0));
        known.insert(names::ACTOR_CHARACTER_ID, json!(fx.anna.0));

        let out = provider
            .execute(&provider.outputs()[names::TARGET_OBJECT_ID], &known)
            .await
            .unwrap();
        assert_eq!(out[names::TARGET_OBJECT_ID].value, json!(fx.tree.0));

        let prompts = fx.model.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].contains("Apple tree"));
        assert!(prompts[0].contains("Anna"));
    }

    #[tokio::test]
    async fn test_execute_without_actor() {
        let fx = fixture(["<Object>Stone well</Object>"]);
        let provider = TargetObjectProvider::new(fx.services.clone());
        let mut known = KnownValues::new();
        known.insert(names::INTENT, json!("Draw water"));
        known.insert(names::LOCATION_ID, json!(fx.village.0));

        let out = provider
            .execute(&provider.outputs()[names::TARGET_OBJECT_ID], &known)
            .await
            .unwrap();
        assert_eq!(out[names::TARGET_OBJECT_ID].value, json!(fx.well.0));
        assert!(fx.model.prompts()[0].contains("Not provided"));
    }
}
