use crate::parameter::{names, FilledParameter, KnownValues, Parameter, ParameterMap};
use crate::provider::{Provider, ProviderError};
use crate::services::Services;
use crate::world::SimId;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Where a character currently is.
pub struct LocationProvider {
    services: Services,
}

impl LocationProvider {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Provider for LocationProvider {
    fn name(&self) -> &str {
        "location"
    }

    fn description(&self) -> &str {
        "Finds the location of the acting character"
    }

    fn inputs(&self) -> ParameterMap {
        crate::parameter::parameter_map([Parameter::required(
            names::ACTOR_CHARACTER_ID,
            "The character whose location is needed",
        )])
    }

    fn outputs(&self) -> ParameterMap {
        crate::parameter::parameter_map([Parameter::required(
            names::LOCATION_ID,
            "The location where the action takes place",
        )])
    }

    async fn execute(
        &self,
        target: &Parameter,
        known: &KnownValues,
    ) -> Result<BTreeMap<String, FilledParameter>, ProviderError> {
        let actor: SimId = known.require(names::ACTOR_CHARACTER_ID)?;
        let location = self.services.world.read().await.sim(actor)?.location_id;
        Ok([(names::LOCATION_ID.to_string(), target.fill(location)?)]
            .into_iter()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::tests::fixture;
    use serde_json::json;

    #[tokio::test]
    async fn test_reads_actor_location() {
        let fx = fixture(Vec::<String>::new());
        let provider = LocationProvider::new(fx.services.clone());

        let mut known = KnownValues::new();
        known.insert(names::ACTOR_CHARACTER_ID, json!(fx.anna.0));
        let out = provider
            .execute(&provider.outputs()[names::LOCATION_ID], &known)
            .await
            .unwrap();
        assert_eq!(out[names::LOCATION_ID].value, json!(fx.village.0));
    }

    #[tokio::test]
    async fn test_unknown_actor() {
        let fx = fixture(Vec::<String>::new());
        let provider = LocationProvider::new(fx.services.clone());
        let mut known = KnownValues::new();
        known.insert(names::ACTOR_CHARACTER_ID, json!(77));
        let err = provider
            .execute(&provider.outputs()[names::LOCATION_ID], &known)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::World(_)));
    }
}
