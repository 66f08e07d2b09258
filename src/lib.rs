//! Real-time collaboration core: connection registry, room membership,
//! presence, and the document engine behind the `/api/ws` protocol.

pub mod config;
pub mod db;
pub mod delta;
pub mod ids;
pub mod message;
pub mod routes;
pub mod services;
pub mod state;
