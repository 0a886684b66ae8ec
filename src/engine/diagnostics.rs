use std::fmt::{self, Display, Formatter, Write};
use std::time::{Duration, Instant};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::Serialize;

use crate::core::Tier;
use crate::engine::TaskId;
use crate::engine::task::TaskState;

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Outcome of one orchestration run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// `true` iff no task failed.
    pub success: bool,
    pub errors: usize,
    /// Task bodies that ran to the end, successfully or not.
    pub executed: usize,
    pub canceled: usize,
    /// Tasks in the graph when the run ended.
    pub created: usize,
    pub elapsed: Duration,
}

impl Display for RunReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tasks, {} executed, {} canceled, {} failed in {:.2?}",
            self.created, self.executed, self.canceled, self.errors, self.elapsed
        )
    }
}

/// One task as seen by a [`Snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub name: String,
    pub tier: Tier,
    pub state: TaskState,
    #[serde(skip)]
    pub execution: Option<TaskExecution>,
}

/// Point-in-time copy of the task graph, edges labelled with the type of the
/// pin connecting the two tasks.
#[derive(Debug, Default)]
pub struct Snapshot {
    graph: DiGraph<TaskSummary, &'static str>,
}

#[derive(Serialize)]
struct JsonGraph<'a> {
    tasks: Vec<JsonTask<'a>>,
    edges: Vec<JsonEdge<'a>>,
}

#[derive(Serialize)]
struct JsonTask<'a> {
    #[serde(flatten)]
    summary: &'a TaskSummary,
    duration_us: Option<u64>,
}

#[derive(Serialize)]
struct JsonEdge<'a> {
    from: TaskId,
    to: TaskId,
    pin: &'a str,
}

impl Snapshot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_task(&mut self, summary: TaskSummary) -> NodeIndex {
        self.graph.add_node(summary)
    }

    pub(crate) fn add_edge(&mut self, from: NodeIndex, to: NodeIndex, pin: &'static str) {
        self.graph.add_edge(from, to, pin);
    }

    pub fn graph(&self) -> &DiGraph<TaskSummary, &'static str> {
        &self.graph
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Growth only ever links new tasks below existing ones, so a cycle
    /// means the graph is corrupt.
    pub fn is_cyclic(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.graph)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let tasks = self
            .graph
            .node_weights()
            .map(|summary| JsonTask {
                summary,
                duration_us: summary
                    .execution
                    .as_ref()
                    .map(|e| e.duration.as_micros() as u64),
            })
            .collect();

        let edges = self
            .graph
            .edge_references()
            .map(|edge| JsonEdge {
                from: self.graph[edge.source()].id,
                to: self.graph[edge.target()].id,
                pin: *edge.weight(),
            })
            .collect();

        serde_json::to_string_pretty(&JsonGraph { tasks, edges })
    }

    /// Renders the task graph as a Mermaid diagram, color-coded by execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Never executed
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        // writing into a String cannot fail
        let _ = self.write_mermaid(&mut f);
        f
    }

    fn write_mermaid(&self, f: &mut String) -> fmt::Result {
        writeln!(f, "graph LR")?;

        let durations = self
            .graph
            .node_weights()
            .filter_map(|task| task.execution.as_ref())
            .map(|exec| exec.duration.as_secs_f64());

        let (mut min_time, mut max_time) = durations
            .fold((f64::MAX, f64::MIN), |(lo, hi), secs| (lo.min(secs), hi.max(secs)));

        if min_time > max_time {
            // No tasks ran
            min_time = 0.0;
            max_time = 0.0;
        }

        // Avoid divide by zero if all tasks took same time
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            let name = task.name.replace('"', "#quot;");

            let (label_extra, color_code) = match &task.execution {
                Some(exec) => {
                    let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);
                    (format!("{:.2?}", exec.duration), gradient(t))
                }
                None => (state_label(task.state).to_string(), "#ADD8E6".to_string()),
            };

            writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), name, label_extra)?;
            writeln!(f, "    style {} fill:{}", index.index(), color_code)?;
        }

        for edge in self.graph.edge_references() {
            let type_name = edge.weight().replace('<', "&lt;").replace('>', "&gt;");
            if type_name.is_empty() {
                writeln!(f, "    {} --> {}", edge.source().index(), edge.target().index())?;
            } else {
                writeln!(
                    f,
                    "    {} -- \"{}\" --> {}",
                    edge.source().index(),
                    type_name,
                    edge.target().index()
                )?;
            }
        }

        Ok(())
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn gradient(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);

    let (r, g, b) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255, 0)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8, 0)
    };

    format!("#{r:02X}{g:02X}{b:02X}")
}

fn state_label(state: TaskState) -> &'static str {
    match state {
        TaskState::Created => "not run",
        TaskState::Dispatched => "waiting",
        TaskState::Executing => "running",
        TaskState::Completed => "done",
        TaskState::Canceled => "canceled",
        TaskState::Errored => "failed",
    }
}
