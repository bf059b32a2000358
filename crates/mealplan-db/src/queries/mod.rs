//! Query functions, one module per table (or table family).

pub mod events;
pub mod grocery_items;
pub mod options;
pub mod outbox;
pub mod plans;
pub mod prep_tasks;
pub mod reference;
pub mod votes;
