pub mod comm_pacer;
pub mod striped_map;
pub mod vector_clock;

pub use vector_clock::VectorClock;
pub use vector_clock::VectorClockMt;
