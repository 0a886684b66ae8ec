use std::time::Duration;

use camino::Utf8PathBuf;

use crate::core::Flags;
use crate::tags;

/// Tunables of a single orchestration run.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval of the wait loop; bounds the latency of rechecking deferred
    /// tasks.
    pub tick: Duration,
    /// Capacity of the channel through which workers hand back tasks that
    /// were not ready yet.
    pub pending_capacity: usize,
    /// Largest producer subset enumerated by multi-input matching.
    pub max_subset_size: usize,
    /// Generations with more tasks than this are only matched one task at a
    /// time, to keep the subset enumeration small.
    pub subset_frontier_limit: usize,
    /// Growth stops after this many consecutive generations.
    pub max_generations: usize,
    /// Size of the dedicated worker pool a [`Pipeline`](crate::Pipeline)
    /// binds, `None` runs on the global rayon pool.
    pub threads: Option<usize>,
    /// Attach progress bars to the run spans.
    pub progress: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(200),
            pending_capacity: 64,
            max_subset_size: 4,
            subset_frontier_limit: 8,
            max_generations: 256,
            threads: None,
            progress: true,
        }
    }
}

impl SchedulerConfig {
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_pending_capacity(mut self, capacity: usize) -> Self {
        self.pending_capacity = capacity.max(1);
        self
    }

    pub fn with_max_subset_size(mut self, size: usize) -> Self {
        self.max_subset_size = size.max(1);
        self
    }

    pub fn with_subset_frontier_limit(mut self, limit: usize) -> Self {
        self.subset_frontier_limit = limit;
        self
    }

    pub fn with_max_generations(mut self, generations: usize) -> Self {
        self.max_generations = generations;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads.max(1));
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }
}

/// A source language the project lookup recognizes.
#[derive(Debug, Clone)]
pub struct Language {
    pub name: &'static str,
    pub tag: Flags,
    pub extensions: &'static [&'static str],
}

impl Language {
    pub const CPP: Language = Language {
        name: "C++",
        tag: tags::CPP,
        extensions: &["c", "cc", "cpp", "cxx", "h", "hh", "hpp"],
    };

    pub const SHARP: Language = Language {
        name: "C#",
        tag: tags::SHARP,
        extensions: &["cs"],
    };

    pub const RUST: Language = Language {
        name: "Rust",
        tag: tags::RUST,
        extensions: &["rs"],
    };
}

/// What to build and where to put the results.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Directories scanned for projects, one project per directory and
    /// language.
    pub paths: Vec<Utf8PathBuf>,
    /// Directory receiving the solution manifest.
    pub out_dir: Utf8PathBuf,
    /// Solution name, also the manifest file stem.
    pub solution: String,
    pub languages: Vec<Language>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            out_dir: Utf8PathBuf::from("dist"),
            solution: String::from("solution"),
            languages: vec![Language::CPP, Language::SHARP, Language::RUST],
        }
    }
}

impl BuildConfig {
    pub fn new(paths: impl IntoIterator<Item = impl Into<Utf8PathBuf>>) -> Self {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn out_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.out_dir = dir.into();
        self
    }

    pub fn solution(mut self, name: impl Into<String>) -> Self {
        self.solution = name.into();
        self
    }

    pub fn languages(mut self, languages: impl IntoIterator<Item = Language>) -> Self {
        self.languages = languages.into_iter().collect();
        self
    }
}
