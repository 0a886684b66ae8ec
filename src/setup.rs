use std::borrow::Cow;

use camino::Utf8PathBuf;

use crate::engine::{Task, TaskContext};
use crate::error::BuildError;
use crate::tags;

/// A directory handed to the project lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDir {
    pub path: Utf8PathBuf,
}

/// Root task of a build. Emits one [`SourceDir`] flagged [`tags::SETUP`] per
/// configured path that exists.
pub struct Setup {
    paths: Vec<Utf8PathBuf>,
}

impl Setup {
    pub fn new(paths: impl IntoIterator<Item = impl Into<Utf8PathBuf>>) -> Self {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

impl Task for Setup {
    fn name(&self) -> Cow<'static, str> {
        "Setup".into()
    }

    fn execute(&mut self, ctx: &mut TaskContext<'_>) -> anyhow::Result<()> {
        let mut found = 0;

        for path in &self.paths {
            if !path.is_dir() {
                ctx.error_once(
                    &format!("setup:{path}"),
                    format!("Build path '{path}' is not a directory, skipping"),
                );
                continue;
            }

            ctx.emit_flagged(SourceDir { path: path.clone() }, tags::SETUP)?;
            found += 1;
        }

        if found == 0 {
            return Err(BuildError::NoBuildPaths.into());
        }

        ctx.info(format!("found {found} source directories"));
        Ok(())
    }
}
