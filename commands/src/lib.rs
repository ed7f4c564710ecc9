//! # Stayflow Commands
//!
//! Write side of the activity metrics: requests from the front end are validated,
//! turned into [`ActivityEvent`](stayflow_core::activity::ActivityEvent)s and appended
//! to the accommodation's stream.
//!
//! - [`request`]: the four JSON request shapes and their validation
//! - [`command`]: the closed [`Command`] set
//! - [`writer`]: [`CommandWriter`], the only component that appends
//! - [`error`]: [`WriteError`] with its HTTP status mapping
//!
//! Optimistic concurrency is opt-in per request: an `expectedSequence` of zero or more
//! makes the append conditional on the stream still ending there.

pub mod command;
pub mod error;
pub mod request;
pub mod writer;

pub use command::Command;
pub use error::WriteError;
pub use request::{
    NO_EXPECTATION, UserJoinedRequest, UserLeftRequest, UserRatedRequest, UserReservedRequest,
};
pub use writer::CommandWriter;
