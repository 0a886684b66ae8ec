use camino::Utf8PathBuf;
use thiserror::Error;

/// Misuse of a pin from inside a task body.
#[derive(Debug, Error)]
pub enum PinError {
    #[error("pin already carries data, payloads are write-once")]
    AlreadySet,

    #[error("pin expects {expected} but was given {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("no input pin at index {0}")]
    MissingInput(usize),

    #[error("no output pin at index {0}")]
    MissingOutput(usize),

    #[error("input pin {0} carries no data")]
    NoData(usize),
}

/// Failure while scanning a source tree for project files.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("File '{0}' is outside of project root '{1}'")]
    OutsideRoot(Utf8PathBuf, Utf8PathBuf),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("None of the build paths is a valid directory")]
    NoBuildPaths,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't serialize solution.\n{0}")]
    Json(#[from] serde_json::Error),

    #[error("Couldn't start worker pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Build finished with {errors} failed task(s)")]
    Failed { errors: usize },
}
