//! Simulation world state.
//!
//! The world owns the sims, the locations with their objects and the
//! simulation clock. It is shared between concurrently processed sims as a
//! [`SharedWorld`].

use crate::memory::MemoryStore;
use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// World state behind an async lock.
pub type SharedWorld = Arc<RwLock<World>>;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifies a sim.
    SimId
);
id_type!(
    /// Identifies a location.
    LocationId
);
id_type!(
    /// Identifies an object within a location.
    ObjectId
);

/// Errors from looking things up in the world.
#[derive(Debug, Error)]
pub enum WorldError {
    #[error("Unknown sim {0}")]
    UnknownSim(SimId),

    #[error("Unknown location {0}")]
    UnknownLocation(LocationId),

    #[error("Unknown object {object} at location {location}")]
    UnknownObject {
        location: LocationId,
        object: ObjectId,
    },
}

/// Simulation time. Only moves when the game loop advances it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimClock {
    now: NaiveDateTime,
}

impl Default for SimClock {
    fn default() -> Self {
        let start = NaiveDate::from_ymd_opt(1410, 5, 1)
            .and_then(|date| date.and_hms_opt(10, 0, 0))
            .unwrap_or_default();
        Self { now: start }
    }
}

impl SimClock {
    pub fn starting_at(now: NaiveDateTime) -> Self {
        Self { now }
    }

    pub fn now(&self) -> NaiveDateTime {
        self.now
    }

    pub fn advance(&mut self, by: TimeDelta) {
        self.now += by;
    }

    pub fn advance_minutes(&mut self, minutes: i64) {
        self.advance(TimeDelta::minutes(minutes));
    }
}

/// Something a sim perceives on its next turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimEvent {
    Speech {
        source: SimId,
        target: Option<SimId>,
        text: String,
    },
    Arrival {
        sim: SimId,
    },
    Observation {
        location_id: LocationId,
        text: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimStatus {
    #[default]
    Active,
    Inactive,
}

/// An autonomous character.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sim {
    pub id: SimId,
    pub name: String,
    /// What others see before they know anything about this sim.
    pub description: String,
    pub location_id: LocationId,
    #[serde(default)]
    pub status: SimStatus,
    /// What the sim is busy with, as last set by an action.
    #[serde(default)]
    pub current_activity: Option<String>,
    #[serde(default)]
    pub memory: MemoryStore,
    #[serde(default)]
    pub events: VecDeque<SimEvent>,
}

impl Sim {
    pub fn new(
        id: SimId,
        name: impl Into<String>,
        description: impl Into<String>,
        location_id: LocationId,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            description: description.into(),
            location_id,
            status: SimStatus::Active,
            current_activity: None,
            memory: MemoryStore::new(),
            events: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldObject {
    pub id: ObjectId,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub objects: BTreeMap<ObjectId, WorldObject>,
}

impl Location {
    pub fn new(id: LocationId, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: description.into(),
            objects: BTreeMap::new(),
        }
    }

    pub fn object(&self, id: ObjectId) -> Result<&WorldObject, WorldError> {
        self.objects.get(&id).ok_or(WorldError::UnknownObject {
            location: self.id,
            object: id,
        })
    }

    /// Add an object and return its id.
    pub fn add_object(&mut self, name: impl Into<String>, description: impl Into<String>) -> ObjectId {
        let id = ObjectId(self.objects.keys().map(|id| id.0 + 1).max().unwrap_or(0));
        self.objects.insert(
            id,
            WorldObject {
                id,
                name: name.into(),
                description: description.into(),
            },
        );
        id
    }

    pub fn remove_object(&mut self, id: ObjectId) -> Result<WorldObject, WorldError> {
        self.objects.remove(&id).ok_or(WorldError::UnknownObject {
            location: self.id,
            object: id,
        })
    }
}

/// Everything that exists in the simulation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct World {
    pub clock: SimClock,
    #[serde(default)]
    pub sims: BTreeMap<SimId, Sim>,
    #[serde(default)]
    pub locations: BTreeMap<LocationId, Location>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_shared(self) -> SharedWorld {
        Arc::new(RwLock::new(self))
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    pub fn add_location(&mut self, name: impl Into<String>, description: impl Into<String>) -> LocationId {
        let id = LocationId(self.locations.keys().map(|id| id.0 + 1).max().unwrap_or(0));
        self.locations.insert(id, Location::new(id, name, description));
        id
    }

    /// Add a sim at an existing location and return its id.
    pub fn add_sim(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        location_id: LocationId,
    ) -> Result<SimId, WorldError> {
        self.location(location_id)?;
        let id = SimId(self.sims.keys().map(|id| id.0 + 1).max().unwrap_or(0));
        self.sims.insert(id, Sim::new(id, name, description, location_id));
        Ok(id)
    }

    pub fn sim(&self, id: SimId) -> Result<&Sim, WorldError> {
        self.sims.get(&id).ok_or(WorldError::UnknownSim(id))
    }

    pub fn sim_mut(&mut self, id: SimId) -> Result<&mut Sim, WorldError> {
        self.sims.get_mut(&id).ok_or(WorldError::UnknownSim(id))
    }

    pub fn location(&self, id: LocationId) -> Result<&Location, WorldError> {
        self.locations.get(&id).ok_or(WorldError::UnknownLocation(id))
    }

    pub fn location_mut(&mut self, id: LocationId) -> Result<&mut Location, WorldError> {
        self.locations
            .get_mut(&id)
            .ok_or(WorldError::UnknownLocation(id))
    }

    /// Sims currently at a location, in id order.
    pub fn sims_at(&self, location_id: LocationId) -> impl Iterator<Item = &Sim> {
        self.sims
            .values()
            .filter(move |sim| sim.location_id == location_id)
    }

    pub fn push_event(&mut self, sim: SimId, event: SimEvent) -> Result<(), WorldError> {
        self.sim_mut(sim)?.events.push_back(event);
        Ok(())
    }

    /// Take the oldest queued event of a sim.
    pub fn pop_event(&mut self, sim: SimId) -> Result<Option<SimEvent>, WorldError> {
        Ok(self.sim_mut(sim)?.events.pop_front())
    }

    /// Put an event back at the front of a sim's queue.
    pub fn requeue_event(&mut self, sim: SimId, event: SimEvent) -> Result<(), WorldError> {
        self.sim_mut(sim)?.events.push_front(event);
        Ok(())
    }
}
