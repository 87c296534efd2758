mod file_state;

pub use file_state::FileStateStore;
