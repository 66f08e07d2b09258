//! Collaboration services used by the websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Services own state and rules so route handlers stay focused on protocol
//! translation. None of them broadcast on their own; the routes decide who
//! hears about a change.

pub mod conflict;
pub mod connection;
pub mod document;
pub mod persistence;
pub mod presence;
pub mod room;
pub mod store;
pub mod sweeper;
