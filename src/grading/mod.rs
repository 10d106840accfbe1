//! Submission grading: answer decoding, per-student flags, scoring.

pub mod decode;
pub mod flag;
pub mod score;

pub use decode::decode;
pub use flag::{compute_expected_flag, todays_flag};
pub use score::{score, CheckpointResult, GradeReport, SubmissionContext};
