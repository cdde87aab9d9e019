//! Built-in providers.
//!
//! Each provider reads the shared world and, where judgment is needed, asks
//! the language model. None of them write memories.

mod location;
mod speech;
mod target_character;
mod target_object;

pub use location::LocationProvider;
pub use speech::SpeechProvider;
pub use target_character::TargetCharacterProvider;
pub use target_object::TargetObjectProvider;

use crate::provider::{ProviderRegistry, RegistryError};
use crate::services::Services;
use std::sync::Arc;

/// A registry with every built-in provider.
pub fn default_registry(services: &Services) -> Result<ProviderRegistry, RegistryError> {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(LocationProvider::new(services.clone())))?;
    registry.register(Arc::new(TargetObjectProvider::new(services.clone())))?;
    registry.register(Arc::new(TargetCharacterProvider::new(services.clone())))?;
    registry.register(Arc::new(SpeechProvider::new(services.clone())))?;
    Ok(registry)
}
