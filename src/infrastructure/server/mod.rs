pub mod opencode;
pub mod payload;

pub use opencode::OpenCodeServer;
