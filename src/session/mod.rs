//! Client sessions: the wire envelope and the turn controller

mod controller;
mod events;

pub use controller::{ERROR_REPLY, TurnController, TurnServices};
pub use events::{ClientCommand, OUTBOUND_CAPACITY, Outbound, ServerEvent, SessionSink, TurnState};
