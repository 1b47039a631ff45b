//! Automation trigger engine.
//!
//! Every delivered event is offered to the engine, which loads the website's
//! active automations and runs each matching one in its own supervised task:
//! frequency gate, condition gate, then the actions in declared order.

pub mod actions;
pub mod conditions;
pub mod engine;
pub mod frequency;
pub mod triggers;

pub use actions::{ActionRunner, LogMailer, Mailer};
pub use engine::{AutomationEngine, RunOutcome, SkipReason};
