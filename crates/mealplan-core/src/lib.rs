//! Collaborative meal planning for a household.
//!
//! Members propose candidate meals for upcoming events, rank them, and
//! the core finalizes each plan by instant-runoff once voting closes. A
//! finalized plan is then turned into a grocery list and a schedule of
//! prep tasks, and progress is announced on the event bus.
//!
//! [`PlanningCore`] is the facade; storage, the reference-data catalog,
//! the clock and the bus are injected behind traits.

pub mod bus;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod grocery;
pub mod jobs;
pub mod planning;
pub mod prep;
pub mod state;
pub mod store;
pub mod voting;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::CoreConfig;
pub use context::OpContext;
pub use error::{CoreError, CoreResult};
pub use planning::{MissingVote, PlanningCore};
pub use state::Actor;
