pub mod actions;
mod debounce;
mod event_stream;
#[cfg(test)]
pub mod fakes;
mod history;
pub mod mentions;
mod reconciler;
mod session_store;

pub use debounce::*;
pub use event_stream::*;
pub use history::*;
pub use reconciler::*;
pub use session_store::*;

/// Wall clock in milliseconds since the epoch, the unit every server
/// timestamp uses.
pub fn now_millis() -> i64 {
    return chrono::Utc::now().timestamp_millis();
}
