pub mod confidence;
pub mod error;
pub mod hlc;
pub mod ids;
pub mod vector_clock;

pub use confidence::Confidence;
pub use error::CoreError;
pub use hlc::{Hlc, HlcClock};
pub use ids::*;
pub use vector_clock::{ClockOrdering, VectorClock};
