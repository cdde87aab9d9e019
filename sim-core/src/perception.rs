//! How sims take in what happened around them.
//!
//! Queued events are turned into first-person descriptions, fed into the
//! relationship memories of the sims involved and recorded as observations.

use crate::dispatch::ActionError;
use crate::extract::{tags, with_parse_retries};
use crate::memory::{describe_sim, MemoryId};
use crate::services::Services;
use crate::world::{LocationId, SimEvent, SimId};
use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

/// A memory entry as written by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationDraft {
    pub title: String,
    pub content: String,
    pub importance: i64,
}

impl ObservationDraft {
    pub fn parse(reply: &str) -> Result<Self, crate::extract::ParseError> {
        Ok(Self {
            title: tags::TITLE.find(reply)?,
            content: tags::CONTENT.find(reply)?,
            importance: tags::IMPORTANCE.find_integer(reply)?,
        })
    }
}

/// Turns a description of a situation into an observation memory.
#[derive(Clone)]
pub struct ObservationMaker {
    services: Services,
}

impl ObservationMaker {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Ask the model for a memory entry about `context` and store it.
    pub async fn observe(
        &self,
        sim: SimId,
        context: &str,
        location: Option<LocationId>,
    ) -> Result<MemoryId, ActionError> {
        let draft = self.draft(sim, context, location).await?;
        self.record(sim, &draft).await
    }

    /// Ask the model for a memory entry about `context` without storing it.
    pub async fn draft(
        &self,
        sim: SimId,
        context: &str,
        location: Option<LocationId>,
    ) -> Result<ObservationDraft, ActionError> {
        let (character, location_text) = {
            let world = self.services.world.read().await;
            let sim = world.sim(sim)?;
            let location = world.location(location.unwrap_or(sim.location_id))?;
            (
                format!("{}, {}", sim.name, sim.description),
                format!("{}: {}", location.name, location.description),
            )
        };

        let prompt = format!(
            "You write memory entries for characters in a simulation.\n\
             \n\
             Read the location, the character and what just happened, then write a \
             memory entry: a short title, a detailed description and how important \
             it is on a scale from 1 to 10.\n\
             \n\
             <Title>title</Title>\n\
             <Content>content</Content>\n\
             <Importance>number</Importance>\n\
             \n\
             Location:\n{location_text}\n\
             \n\
             Character:\n{character}\n\
             \n\
             What happened:\n{context}\n"
        );

        let (model, prompt) = (&self.services.model, &prompt);
        with_parse_retries(self.services.parse_retries, move || async move {
            let reply = model.complete(prompt).await?;
            Ok::<_, ActionError>(ObservationDraft::parse(&reply)?)
        })
        .await
    }

    /// Store a drafted memory entry for `sim`.
    pub async fn record(&self, sim: SimId, draft: &ObservationDraft) -> Result<MemoryId, ActionError> {
        let id = self
            .services
            .memory
            .add(
                &self.services.world,
                sim,
                &draft.title,
                &draft.content,
                draft.importance,
            )
            .await?;
        Ok(id)
    }
}

/// Processes the event queue of sims.
#[derive(Clone)]
pub struct Perception {
    services: Services,
    observer: ObservationMaker,
}

impl Perception {
    pub fn new(services: Services) -> Self {
        Self {
            observer: ObservationMaker::new(services.clone()),
            services,
        }
    }

    /// Handle every queued event of `sim`, oldest first.
    ///
    /// Returns the description of each event from the sim's point of view.
    /// Events are taken off the queue one at a time; an event whose handling
    /// fails goes back to the front of the queue together with every later
    /// event, so the next call picks up where this one stopped.
    #[instrument(skip(self), fields(sim = %sim))]
    pub async fn handle_events(&self, sim: SimId) -> Result<Vec<String>, ActionError> {
        let mut descriptions = Vec::new();
        loop {
            let Some(event) = self.services.world.write().await.pop_event(sim)? else {
                break;
            };
            match self.handle_event(sim, &event).await {
                Ok(description) => {
                    debug!(description = %description, "Event perceived");
                    descriptions.push(description);
                }
                Err(err) => {
                    warn!(error = %err, handled = descriptions.len(), "Event failed, requeued");
                    self.services.world.write().await.requeue_event(sim, event)?;
                    return Err(err);
                }
            }
        }
        info!(events = descriptions.len(), "Events handled");
        Ok(descriptions)
    }

    /// Handle the queues of several sims concurrently.
    ///
    /// Every sim runs to completion or to its first failure; one sim failing
    /// does not stop the others. Results are in the order of `sims`.
    pub async fn handle_all(&self, sims: &[SimId]) -> Vec<Result<Vec<String>, ActionError>> {
        join_all(sims.iter().map(|&sim| self.handle_events(sim))).await
    }

    async fn handle_event(&self, sim: SimId, event: &SimEvent) -> Result<String, ActionError> {
        match event {
            SimEvent::Speech {
                source,
                target,
                text,
            } => self.handle_speech(sim, *source, *target, text).await,
            SimEvent::Arrival { sim: arrived } => self.handle_arrival(sim, *arrived).await,
            SimEvent::Observation { location_id, text } => {
                self.observer.observe(sim, text, Some(*location_id)).await?;
                Ok(text.clone())
            }
        }
    }

    async fn handle_speech(
        &self,
        sim: SimId,
        source: SimId,
        target: Option<SimId>,
        text: &str,
    ) -> Result<String, ActionError> {
        let description = {
            let world = self.services.world.read().await;
            let mut description = if source == sim {
                format!("I said: \"{text}\".")
            } else {
                format!("{} said: \"{text}\".", describe_sim(&world, sim, source)?)
            };
            match target {
                Some(target) if target == sim => description.push_str(" They said it to me."),
                Some(target) => {
                    let name = describe_sim(&world, sim, target)?;
                    description.push_str(&format!(" They were saying it to {name}."));
                }
                None => {}
            }
            description
        };

        let draft = self.observer.draft(sim, &description, None).await?;

        let memory = &self.services.memory;
        if source != sim {
            memory
                .update_relationship(&self.services.world, sim, source, &description)
                .await?;
        }
        if let Some(target) = target.filter(|&t| t != sim && t != source) {
            memory
                .update_relationship(&self.services.world, sim, target, &description)
                .await?;
        }

        self.observer.record(sim, &draft).await?;
        Ok(description)
    }

    async fn handle_arrival(&self, sim: SimId, arrived: SimId) -> Result<String, ActionError> {
        let (description, location) = {
            let world = self.services.world.read().await;
            let location = world.sim(arrived)?.location_id;
            if arrived == sim {
                ("I arrived in this region.".to_string(), location)
            } else {
                let known = describe_sim(&world, sim, arrived)?;
                (
                    format!("I notice, that a new settler arrived. Here is what I know about them: {known}"),
                    location,
                )
            }
        };

        let draft = self.observer.draft(sim, &description, Some(location)).await?;
        if arrived != sim {
            self.services
                .memory
                .update_relationship(&self.services.world, sim, arrived, &description)
                .await?;
        }
        self.observer.record(sim, &draft).await?;
        Ok(description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::tests::fixture;

    const OBSERVATION: &str =
        "<Title>Talk at the well</Title><Content>Someone spoke to me</Content><Importance>6</Importance>";

    #[test]
    fn test_parse_draft() {
        let draft = ObservationDraft::parse(
            "<Title>Rain</Title>\n<Content>It rained all day</Content>\n<Importance> 3 </Importance>",
        )
        .unwrap();
        assert_eq!(draft.title, "Rain");
        assert_eq!(draft.importance, 3);
        assert!(ObservationDraft::parse("<Title>Rain</Title><Content>x</Content>").is_err());
    }

    #[tokio::test]
    async fn test_speech_updates_relationships_and_records() {
        let fx = fixture([OBSERVATION]);
        {
            let mut world = fx.services.world.write().await;
            world
                .push_event(
                    fx.marta,
                    SimEvent::Speech {
                        source: fx.anna,
                        target: Some(fx.piotr),
                        text: "Flour, please".into(),
                    },
                )
                .unwrap();
        }

        let perception = Perception::new(fx.services.clone());
        let descriptions = perception.handle_events(fx.marta).await.unwrap();
        assert_eq!(
            descriptions,
            vec!["a young baker said: \"Flour, please\". They were saying it to a tall miller."]
        );

        let world = fx.services.world.read().await;
        let marta = world.sim(fx.marta).unwrap();
        assert_eq!(marta.memory.len(), 1);
        assert_eq!(marta.memory.entries()[0].title, "Talk at the well");
        assert_eq!(marta.memory.entries()[0].importance, 6);
        assert_eq!(marta.memory.relationships().len(), 2);
        assert_eq!(
            marta.memory.relationship(fx.anna).unwrap().name,
            "a young baker"
        );
        assert!(marta.events.is_empty());
    }

    #[tokio::test]
    async fn test_speech_to_me() {
        let fx = fixture([OBSERVATION]);
        fx.services
            .world
            .write()
            .await
            .push_event(
                fx.piotr,
                SimEvent::Speech {
                    source: fx.anna,
                    target: Some(fx.piotr),
                    text: "Hello".into(),
                },
            )
            .unwrap();

        let descriptions = Perception::new(fx.services.clone())
            .handle_events(fx.piotr)
            .await
            .unwrap();
        assert!(descriptions[0].ends_with("They said it to me."));

        let world = fx.services.world.read().await;
        let relationships = world.sim(fx.piotr).unwrap().memory.relationships();
        assert_eq!(relationships.len(), 1);
        assert!(relationships.contains_key(&fx.anna));
    }

    #[tokio::test]
    async fn test_handle_all_keeps_order() {
        let fx = fixture([OBSERVATION]);
        let model = std::sync::Arc::new(crate::testing::ScriptedModel::new([OBSERVATION]).repeating());
        let services = crate::services::Services::new(
            fx.services.world.clone(),
            fx.services.memory.clone(),
            model,
        );
        {
            let mut world = services.world.write().await;
            world.push_event(fx.anna, SimEvent::Arrival { sim: fx.marta }).unwrap();
            world
                .push_event(
                    fx.piotr,
                    SimEvent::Observation {
                        location_id: fx.village,
                        text: "The river is rising".into(),
                    },
                )
                .unwrap();
        }

        let descriptions: Vec<Vec<String>> = Perception::new(services.clone())
            .handle_all(&[fx.piotr, fx.anna, fx.marta])
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(descriptions[0], vec!["The river is rising"]);
        assert!(descriptions[1][0].starts_with("I notice, that a new settler arrived"));
        assert!(descriptions[1][0].ends_with("an old herbalist"));
        assert!(descriptions[2].is_empty());

        let world = services.world.read().await;
        assert_eq!(world.sim(fx.piotr).unwrap().memory.len(), 1);
        assert!(world.sim(fx.anna).unwrap().memory.relationship(fx.marta).is_some());
    }

    #[tokio::test]
    async fn test_own_arrival() {
        let fx = fixture([OBSERVATION]);
        fx.services
            .world
            .write()
            .await
            .push_event(fx.anna, SimEvent::Arrival { sim: fx.anna })
            .unwrap();

        let descriptions = Perception::new(fx.services.clone())
            .handle_events(fx.anna)
            .await
            .unwrap();
        assert_eq!(descriptions, vec!["I arrived in this region."]);

        let world = fx.services.world.read().await;
        assert!(world.sim(fx.anna).unwrap().memory.relationships().is_empty());
        assert_eq!(world.sim(fx.anna).unwrap().memory.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_event_stays_queued() {
        let fx = fixture(Vec::<String>::new());
        {
            let mut world = fx.services.world.write().await;
            for text in ["Smoke over the mill", "Bells ring"] {
                world
                    .push_event(
                        fx.anna,
                        SimEvent::Observation {
                            location_id: fx.village,
                            text: text.into(),
                        },
                    )
                    .unwrap();
            }
        }

        let err = Perception::new(fx.services.clone())
            .handle_events(fx.anna)
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Llm(_)));

        let world = fx.services.world.read().await;
        let anna = world.sim(fx.anna).unwrap();
        assert_eq!(anna.events.len(), 2);
        assert!(matches!(
            &anna.events[0],
            SimEvent::Observation { text, .. } if text == "Smoke over the mill"
        ));
        assert_eq!(anna.memory.len(), 0);
    }

    #[tokio::test]
    async fn test_unparsed_speech_writes_nothing_and_retries_later() {
        let fx = fixture(["mumble", "mumble", "mumble", OBSERVATION]);
        fx.services
            .world
            .write()
            .await
            .push_event(
                fx.marta,
                SimEvent::Speech {
                    source: fx.anna,
                    target: None,
                    text: "Good morning".into(),
                },
            )
            .unwrap();
        let perception = Perception::new(fx.services.clone());

        let err = perception.handle_events(fx.marta).await.unwrap_err();
        assert!(matches!(err, ActionError::Parse(_)));
        {
            let world = fx.services.world.read().await;
            let marta = world.sim(fx.marta).unwrap();
            assert_eq!(marta.events.len(), 1);
            assert!(marta.memory.relationships().is_empty());
            assert_eq!(marta.memory.len(), 0);
        }

        let descriptions = perception.handle_events(fx.marta).await.unwrap();
        assert_eq!(descriptions, vec!["a young baker said: \"Good morning\"."]);
        let world = fx.services.world.read().await;
        let marta = world.sim(fx.marta).unwrap();
        assert!(marta.events.is_empty());
        assert_eq!(marta.memory.relationships().len(), 1);
        assert_eq!(marta.memory.len(), 1);
    }

    #[tokio::test]
    async fn test_handle_all_isolates_failures() {
        let fx = fixture([OBSERVATION]);
        let model = std::sync::Arc::new(crate::testing::ScriptedModel::new([OBSERVATION]).repeating());
        let services = crate::services::Services::new(
            fx.services.world.clone(),
            fx.services.memory.clone(),
            model,
        );
        {
            let mut world = services.world.write().await;
            world.push_event(fx.anna, SimEvent::Arrival { sim: SimId(99) }).unwrap();
            world
                .push_event(
                    fx.piotr,
                    SimEvent::Observation {
                        location_id: fx.village,
                        text: "The river is rising".into(),
                    },
                )
                .unwrap();
        }

        let results = Perception::new(services.clone())
            .handle_all(&[fx.anna, fx.piotr])
            .await;
        assert!(matches!(results[0], Err(ActionError::World(_))));
        assert_eq!(results[1].as_ref().unwrap(), &vec!["The river is rising".to_string()]);

        let world = services.world.read().await;
        assert_eq!(world.sim(fx.anna).unwrap().events.len(), 1);
        assert_eq!(world.sim(fx.piotr).unwrap().memory.len(), 1);
    }
}
