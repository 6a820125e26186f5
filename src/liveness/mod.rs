pub mod state;
pub mod supervisor;

pub use state::{LivenessCounter, TripReason};
pub use supervisor::{LivenessPolicy, LivenessSupervisor};
