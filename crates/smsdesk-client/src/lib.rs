//! Client side of smsdesk: a per-session conversation controller that keeps a
//! local view converged with the server through fetches, optimistic sends,
//! real-time hints and a polling fallback.

pub mod api;
pub mod controller;
pub mod error;
pub mod merge;
pub mod overlay;
pub mod realtime;
pub mod resync;
pub mod state_dir;

pub use controller::{Command, Controller, ControllerConfig, Notice, Pane, Phase, ViewState};
pub use error::{ErrorKind, UserError};
