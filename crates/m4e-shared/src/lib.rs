//! # m4e-shared
//!
//! Types shared by every layer of the Meet4Eat client: identifiers, the
//! event/location/vote domain model, voting schedules, the push
//! notification wire format and the client error taxonomy.

pub mod constants;
pub mod error;
pub mod model;
pub mod protocol;
pub mod schedule;
pub mod types;

pub use error::{ClientError, Result};
