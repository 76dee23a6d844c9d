pub mod envelope;
pub mod gain;
pub mod limiter;
pub mod loudness;
pub mod utils;

pub use envelope::{DuckCurve, DuckPoint, SidechainFollower};
pub use gain::{GainPlan, GainStage};
pub use limiter::LookaheadLimiter;
pub use loudness::{LoudnessMeter, MeterConfig, PeakMode};
