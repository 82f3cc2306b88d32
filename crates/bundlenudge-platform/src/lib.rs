mod paths;

pub use paths::{NudgePaths, NudgePathsError};
