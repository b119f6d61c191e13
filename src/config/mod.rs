//! Configuration: schema, validated model, matcher, and live snapshot
//! machinery.

pub mod loader;
pub mod matcher;
pub mod model;
pub mod raw;
pub mod snapshot;
pub mod target;

pub use loader::{load_from_path, load_from_str};
pub use matcher::{match_route, Matched};
pub use model::{Action, AlertSubtype, ConfigData, ListenerConfig, Route, SlotRoutes, SniPattern};
pub use snapshot::{ConfigSnapshot, Current};
