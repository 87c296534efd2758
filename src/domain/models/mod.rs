mod action;
mod agent_server;
mod context;
mod event;
mod message;
mod session;
mod slash_commands;
mod state_store;
mod ui_event;

pub use action::*;
pub use agent_server::*;
pub use context::*;
pub use event::*;
pub use message::*;
pub use session::*;
pub use slash_commands::*;
pub use state_store::*;
pub use ui_event::*;
