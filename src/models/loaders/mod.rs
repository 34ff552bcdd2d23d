pub mod toml_loader;

pub use toml_loader::{load_all_assessment_files, load_assessment_file, AssessmentFile, RosterEntry};
