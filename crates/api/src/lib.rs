//! The HTTP surface for log history and real-time event subscriptions.
mod events;
mod logs;
mod server;

pub use server::{router, serve, ApiState};
