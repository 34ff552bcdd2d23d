pub mod gradebook;

pub use gradebook::{Gradebook, InstanceKey, QuestionKey};
