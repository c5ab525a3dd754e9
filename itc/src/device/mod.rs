//! Device surface: single-reader session and the read payload layout

pub mod protocol;
pub mod session;

pub use protocol::{DurationRecord, RECORD_SIZE};
pub use session::{DeviceSession, Reader};
