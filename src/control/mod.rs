//! Control plane: the authenticated WebSocket channel to Pangolin
//!
//! Directives arrive as `{type, data}` JSON frames and are dispatched to
//! per-type handlers; registration announcements, pings, and status
//! reports flow outbound on the same socket.

pub mod message;

mod client;
mod token;

pub use client::{ControlClient, Handler, HandlerFuture};
pub use token::acquire_token;
