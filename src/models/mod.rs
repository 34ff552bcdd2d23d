pub mod assessment;
pub mod instance;
pub mod job;
pub mod loaders;
pub mod rubric;
pub mod variant;

pub use assessment::{Assessment, AssessmentQuestion, AssessmentType, RetryPolicy, Zone};
pub use instance::{AssessmentInstance, InstanceQuestion, QuestionStatus};
pub use job::{Job, JobSequence, JobStatus, SequenceKind, SequenceSnapshot};
pub use loaders::{load_all_assessment_files, load_assessment_file, AssessmentFile, RosterEntry};
pub use rubric::{
    AppliedRubricItem, RubricConfig, RubricGrading, RubricItem, RubricItemInput, RubricSelection,
    RubricSettings, RubricSettingsUpdate, RubricType, StartingPoints,
};
pub use variant::{Submission, SubmissionAction, Variant};

// 所有实体共用一个全局递增的 ID 空间
pub type AssessmentId = u64;
pub type AssessmentQuestionId = u64;
pub type AssessmentInstanceId = u64;
pub type InstanceQuestionId = u64;
pub type VariantId = u64;
pub type SubmissionId = u64;
pub type RubricItemId = u64;
pub type JobSequenceId = u64;
pub type JobId = u64;
