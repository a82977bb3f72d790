//! Wire types shared between the orchestrator, the test runners it launches on the DUT, and
//! the fixture service.
//!
//! Everything here is serialized as JSON inside length-prefixed frames, see
//! [dutrun_utils::net_protocol].

pub mod codec;
pub mod entity;
pub mod fixture;
pub mod message;
pub mod runner;
pub mod timing;

pub use codec::{ControlReader, ControlWriter};
pub use entity::{BundleEntity, Entity, EntityType};
pub use message::{ControlMessage, ErrorInfo};
