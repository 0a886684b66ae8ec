//! Project discovery and the solution manifest.
//!
//! One [`ProjectLookup`] per language takes every [`SourceDir`] the setup
//! task hands out. The projects found are gathered by a single
//! [`ProjectFence`], and the resulting [`Solution`] is written to disk by
//! [`SolutionWriter`].

use std::borrow::Cow;
use std::fs;
use std::iter;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::config::Language;
use crate::core::Hash32;
use crate::engine::{Pin, PinSpec, Prototype, Task, TaskContext};
use crate::error::LookupError;
use crate::setup::SourceDir;
use crate::tags;

/// Sources of one language under one directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    pub name: String,
    pub root: Utf8PathBuf,
    pub language: &'static str,
    /// Sorted, relative to `root`.
    pub files: Vec<Utf8PathBuf>,
    /// BLAKE3 over the language and the file list, hex encoded.
    pub fingerprint: String,
}

impl Project {
    fn new(root: &Utf8Path, language: &Language, files: Vec<Utf8PathBuf>) -> Self {
        let fingerprint = Hash32::hash_all(
            iter::once(language.name).chain(files.iter().map(|file| file.as_str())),
        );

        Self {
            name: root.file_name().unwrap_or(root.as_str()).to_string(),
            root: root.to_owned(),
            language: language.name,
            files,
            fingerprint: fingerprint.to_hex(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Solution {
    pub name: String,
    pub projects: Vec<Project>,
}

/// Files under `root` with one of the language's extensions, relative to
/// `root`.
pub fn scan(root: &Utf8Path, language: &Language) -> Result<Vec<Utf8PathBuf>, LookupError> {
    let base = Utf8PathBuf::from(glob::Pattern::escape(root.as_str()));
    let mut files = Vec::new();

    for ext in language.extensions {
        let pattern = base.join(format!("**/*.{ext}"));

        for entry in glob::glob(pattern.as_str())? {
            let path = Utf8PathBuf::try_from(entry?)?;
            let relative = path
                .strip_prefix(root)
                .map_err(|_| LookupError::OutsideRoot(path.clone(), root.to_owned()))?;
            files.push(relative.to_owned());
        }
    }

    files.sort();
    files.dedup();
    Ok(files)
}

/// Turns a source directory into a [`Project`] of one language.
pub struct ProjectLookup {
    language: Language,
    inputs: [PinSpec; 1],
    outputs: [PinSpec; 1],
}

impl ProjectLookup {
    pub fn new(language: Language) -> Self {
        let tag = language.tag;

        Self {
            language,
            inputs: [PinSpec::exclusive::<SourceDir>(tags::SETUP)],
            outputs: [PinSpec::flagged::<Project>(tags::PROJECT | tag)],
        }
    }
}

impl Prototype for ProjectLookup {
    fn name(&self) -> Cow<'static, str> {
        format!("ProjectLookup({})", self.language.name).into()
    }

    fn inputs(&self) -> &[PinSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[PinSpec] {
        &self.outputs
    }

    fn instantiate(&self) -> Box<dyn Task> {
        Box::new(LookupTask {
            language: self.language.clone(),
            root: None,
        })
    }
}

struct LookupTask {
    language: Language,
    root: Option<Utf8PathBuf>,
}

impl Task for LookupTask {
    fn name(&self) -> Cow<'static, str> {
        match &self.root {
            Some(root) => format!("ProjectLookup({}) {root}", self.language.name).into(),
            None => format!("ProjectLookup({})", self.language.name).into(),
        }
    }

    fn execute(&mut self, ctx: &mut TaskContext<'_>) -> anyhow::Result<()> {
        let dir = ctx.input::<SourceDir>(0)?;
        let root = self.root.insert(dir.path.clone());

        if !root.is_dir() {
            ctx.warn_once(
                &format!("lookup:{root}"),
                format!("Source directory '{root}' is gone"),
            );
            ctx.cancel();
            return Ok(());
        }

        let files = scan(root, &self.language)?;
        if files.is_empty() {
            ctx.cancel();
            return Ok(());
        }

        ctx.set_output(0, Project::new(root, &self.language, files))?;
        Ok(())
    }
}

/// Gathers every project found into one [`Solution`].
pub struct ProjectFence {
    solution: String,
    outputs: [PinSpec; 1],
}

impl ProjectFence {
    pub fn new(solution: impl Into<String>) -> Self {
        Self {
            solution: solution.into(),
            outputs: [PinSpec::flagged::<Solution>(tags::SOLUTION)],
        }
    }
}

impl Prototype for ProjectFence {
    fn name(&self) -> Cow<'static, str> {
        "ProjectFence".into()
    }

    fn inputs(&self) -> &[PinSpec] {
        &[]
    }

    fn outputs(&self) -> &[PinSpec] {
        &self.outputs
    }

    fn is_variadic(&self) -> bool {
        true
    }

    fn accepts_variadic(&self, candidate: &Pin) -> bool {
        candidate.data_type().is::<Project>()
            && candidate
                .flags()
                .is_some_and(|flags| flags.contains(tags::PROJECT))
    }

    fn instantiate(&self) -> Box<dyn Task> {
        Box::new(FenceTask {
            solution: self.solution.clone(),
        })
    }
}

struct FenceTask {
    solution: String,
}

impl Task for FenceTask {
    fn name(&self) -> Cow<'static, str> {
        "ProjectFence".into()
    }

    fn execute(&mut self, ctx: &mut TaskContext<'_>) -> anyhow::Result<()> {
        let mut projects: Vec<Project> = ctx
            .inputs_of::<Project>()
            .iter()
            .map(|project| Project::clone(project))
            .collect();

        projects.sort_by(|a, b| (&a.name, a.language).cmp(&(&b.name, b.language)));
        ctx.info(format!("gathered {} project(s)", projects.len()));

        ctx.set_output(
            0,
            Solution {
                name: self.solution.clone(),
                projects,
            },
        )?;
        Ok(())
    }
}

/// Writes `<out_dir>/<solution>.solution.json` and outputs its path.
pub struct SolutionWriter {
    out_dir: Utf8PathBuf,
    inputs: [PinSpec; 1],
    outputs: [PinSpec; 1],
}

impl SolutionWriter {
    pub fn new(out_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            inputs: [PinSpec::exclusive::<Solution>(tags::SOLUTION)],
            outputs: [PinSpec::plain::<Utf8PathBuf>()],
        }
    }
}

impl Prototype for SolutionWriter {
    fn name(&self) -> Cow<'static, str> {
        "SolutionWriter".into()
    }

    fn exclusive_use(&self) -> bool {
        true
    }

    fn inputs(&self) -> &[PinSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[PinSpec] {
        &self.outputs
    }

    fn instantiate(&self) -> Box<dyn Task> {
        Box::new(WriterTask {
            out_dir: self.out_dir.clone(),
        })
    }
}

struct WriterTask {
    out_dir: Utf8PathBuf,
}

impl Task for WriterTask {
    fn name(&self) -> Cow<'static, str> {
        "SolutionWriter".into()
    }

    fn execute(&mut self, ctx: &mut TaskContext<'_>) -> anyhow::Result<()> {
        let solution = ctx.input::<Solution>(0)?;
        let path = self.out_dir.join(format!("{}.solution.json", solution.name));

        fs::create_dir_all(&self.out_dir)?;
        fs::write(&path, serde_json::to_string_pretty(&*solution)?)?;

        ctx.info(format!("wrote {path}"));
        ctx.set_output(0, path)?;
        Ok(())
    }
}
