pub mod deal;
pub mod estimator;

pub use deal::{assess, AskingPrice, DealAssessment, DealLabel};
pub use estimator::estimate;
