pub mod csv_export;
pub mod grader;
pub mod points_accumulator;
pub mod rubric_engine;
pub mod score_override;
pub mod score_upload;
pub mod zone_aggregator;

pub use csv_export::{InstanceRecord, SubmissionSelection};
pub use grader::{
    ExactMatchGrader, GeneratedVariant, GradeOutcome, Grader,
    StaticVariantGenerator, VariantGenerator,
};
pub use points_accumulator::{GradeApplication, PointsAccumulator};
pub use rubric_engine::{Adjustment, PointsBreakdown};
pub use score_override::{AssessmentOverride, ResolvedScore, ScoreUpdate};
pub use score_upload::{AssessmentInstanceScoreRow, InstanceQuestionScoreRow, ParsedRow, RowTarget};
pub use zone_aggregator::{AggregateResult, ZoneTotal};
