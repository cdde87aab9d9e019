//! Built-in actions.

mod harvest;
mod investigate;
mod speak;

pub use harvest::{HarvestAction, HarvestArgs};
pub use investigate::{InvestigateAction, InvestigateArgs};
pub use speak::{SpeakAction, SpeakArgs};

use crate::dispatch::{ActionDispatcher, ActionType};
use crate::provider::ProviderRegistry;
use crate::services::Services;
use std::sync::Arc;

/// A dispatcher with every built-in action, resolving through `registry`.
pub fn default_dispatcher(services: &Services, registry: Arc<ProviderRegistry>) -> ActionDispatcher {
    ActionDispatcher::new(registry)
        .with_action(ActionType::Speak, SpeakAction::new(services.clone()))
        .with_action(
            ActionType::InvestigateObject,
            InvestigateAction::new(services.clone()),
        )
        .with_action(ActionType::HarvestObject, HarvestAction::new(services.clone()))
}
