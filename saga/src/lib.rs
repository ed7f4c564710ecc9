//! # Stayflow Saga
//!
//! The create-accommodation saga, spread over three services that only talk through a
//! [`MessageChannel`](stayflow_core::channel::MessageChannel):
//!
//! - [`orchestrator`]: accommodations side; starts the saga and decides commit or rollback
//! - [`participant`]: reservations side; stores the free dates and replies
//! - [`accommodation`]: accommodations side; approves or denies the accommodation
//!
//! ```text
//!  Orchestrator ── CreateAvailability ──► AvailabilityParticipant
//!       ▲                                         │
//!       └──── AvailabilityCreated / NotCreated ───┘
//!       │
//!       └── UpdateAccommodation / RollbackAccommodation ──► AccommodationHandler
//! ```
//!
//! Message shapes live in [`messages`]; every service routes incoming messages through a
//! [`DispatchTable`](dispatch::DispatchTable) validated at start-up.

pub mod accommodation;
pub mod dispatch;
pub mod error;
pub mod messages;
pub mod orchestrator;
pub mod participant;

pub use accommodation::{AccommodationHandler, AccommodationHandlerConfig, AccommodationRepository};
pub use dispatch::{DispatchTable, serve};
pub use error::{DispatchError, SagaError};
pub use messages::{
    AccommodationAvailability, AvailableDates, Command, CommandId, CommandType, CorrelationId,
    Reply, ReplyType,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig, SagaInstance, SagaState};
pub use participant::{
    AvailabilityParticipant, AvailabilityRepository, DateRangeWithPrice, FreeReservation,
    ParticipantConfig,
};
