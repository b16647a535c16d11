// voyage-common: shared types for the itinerary collaboration relay and its clients

pub mod path;
pub mod protocol;
pub mod types;
