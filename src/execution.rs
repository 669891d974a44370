use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
    error::{KrakenError, Result},
    output::OutputMode,
    property::PropertyRole,
    task::{Project, Task, TaskContext, TaskGraph, TaskStatus, show_task_relationships},
};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub output: OutputMode,
    pub timeout: Option<Duration>,
    pub dry_run: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub name: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Default)]
pub struct BuildSummary {
    pub order: Vec<String>,
    pub results: Vec<TaskResult>,
    /// The build stopped early because shutdown was requested.
    pub interrupted: bool,
}

impl BuildSummary {
    pub fn is_success(&self) -> bool {
        !self.interrupted && !self.results.iter().any(|r| r.status.is_failed())
    }

    pub fn status(&self, task: &str) -> Option<&TaskStatus> {
        self.results
            .iter()
            .find(|r| r.name == task)
            .map(|r| &r.status)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.status.is_failed())
            .map(|r| r.name.as_str())
            .collect()
    }
}

/// Runs the selected tasks of a project one after another in dependency order.
pub struct TaskRunner<'a> {
    project: &'a Project,
    options: RunOptions,
    shutdown: Option<watch::Receiver<bool>>,
}

struct Background {
    name: String,
    task: Arc<dyn Task>,
    ctx: TaskContext,
}

impl<'a> TaskRunner<'a> {
    pub fn new(project: &'a Project, options: RunOptions) -> Self {
        Self {
            project,
            options,
            shutdown: None,
        }
    }

    /// Stop the build once `true` is sent on `shutdown`. The running task is cancelled (its tool
    /// processes are killed) and background tasks that already started are torn down.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Resolve `targets` (or the project's default tasks), check the graph and run the build.
    /// Configuration problems are returned as errors before any task executes; task failures are
    /// reported in the summary.
    pub async fn run(&self, targets: &[String]) -> Result<BuildSummary> {
        self.project.finalize()?;
        let graph = TaskGraph::build(self.project)?;
        show_task_relationships(&graph, self.options.verbose);

        let selectors = if targets.is_empty() {
            self.project.default_tasks()
        } else {
            targets.to_vec()
        };
        let mut roots = Vec::new();
        for selector in &selectors {
            roots.extend(self.project.resolve(selector)?);
        }
        if roots.is_empty() {
            return Err(KrakenError::Config("no tasks selected".to_string()));
        }

        let selected = graph.select(&roots)?;
        let order = graph.execution_order(&selected);
        if self.options.verbose {
            println!("Task execution order: {}", order.join(" -> "));
        }

        let mut summary = BuildSummary {
            order: order.clone(),
            results: Vec::new(),
            interrupted: false,
        };
        let mut shutdown = self.shutdown.clone();

        if self.options.dry_run {
            println!("Dry run mode - showing what would be executed:");
            for name in &order {
                let description = self
                    .project
                    .task(name)
                    .and_then(|t| t.description())
                    .unwrap_or_default();
                println!("  {} {}", name, description);
            }
            return Ok(summary);
        }

        let mut statuses: HashMap<String, TaskStatus> = HashMap::new();
        let mut blocked: Vec<String> = Vec::new();
        let mut background: Vec<Background> = Vec::new();

        for name in &order {
            if shutdown_requested(&shutdown) {
                summary.interrupted = true;
                break;
            }
            let Some(task) = self.project.task(name) else {
                return Err(KrakenError::task(name.clone(), "not found"));
            };
            let ctx = self
                .project
                .context(name, self.options.output, self.options.timeout);

            let upstream = graph.dependencies(name).filter(|e| e.strict).find_map(|e| {
                match statuses.get(&e.from) {
                    Some(status) if status.is_failed() => Some(format!("upstream task '{}' failed", e.from)),
                    _ if blocked.contains(&e.from) => {
                        Some(format!("upstream task '{}' was skipped", e.from))
                    }
                    _ => None,
                }
            });

            let status = match upstream {
                Some(reason) => {
                    blocked.push(name.clone());
                    TaskStatus::Skipped(reason)
                }
                None => {
                    println!("> {}", name);
                    tokio::select! {
                        status = run_task(task.as_ref(), &ctx) => status,
                        _ = wait_for_shutdown(&mut shutdown) => {
                            summary.interrupted = true;
                            TaskStatus::failed("interrupted")
                        }
                    }
                }
            };

            println!("{} {}", name, status);
            if status.is_started() {
                background.push(Background {
                    name: name.clone(),
                    task: Arc::clone(task),
                    ctx,
                });
            }
            statuses.insert(name.clone(), status.clone());
            summary.results.push(TaskResult {
                name: name.clone(),
                status,
            });
            if summary.interrupted {
                break;
            }

            let mut i = 0;
            while i < background.len() {
                let dependents: Vec<&str> = graph
                    .dependents(&background[i].name)
                    .filter(|e| order.contains(&e.to))
                    .map(|e| e.to.as_str())
                    .collect();
                let done = !dependents.is_empty()
                    && dependents.iter().all(|d| statuses.contains_key(*d));
                if done {
                    let bg = background.remove(i);
                    teardown(&bg, &mut summary).await;
                } else {
                    i += 1;
                }
            }
        }

        if summary.interrupted {
            warn!("Build interrupted, tearing down {} background task(s)", background.len());
        }
        while let Some(bg) = background.pop() {
            teardown(&bg, &mut summary).await;
        }

        Ok(summary)
    }
}

fn shutdown_requested(shutdown: &Option<watch::Receiver<bool>>) -> bool {
    shutdown.as_ref().is_some_and(|rx| *rx.borrow())
}

/// Resolves once shutdown is requested; never resolves without a receiver or after the sender is
/// dropped without requesting it.
async fn wait_for_shutdown(shutdown: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = shutdown else {
        return std::future::pending().await;
    };
    if rx.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn run_task(task: &dyn Task, ctx: &TaskContext) -> TaskStatus {
    match lifecycle(task, ctx).await {
        Ok(status) => status,
        Err(e) => TaskStatus::failed(e.to_string()),
    }
}

async fn lifecycle(task: &dyn Task, ctx: &TaskContext) -> Result<TaskStatus> {
    for property in task.properties() {
        match property.role() {
            PropertyRole::Output => property.clear(),
            _ => property.finalize()?,
        }
    }
    if let Some(status) = task.prepare(ctx).await? {
        debug!("Task '{}' prepared: {}", ctx.task_name, status);
        return Ok(status);
    }
    task.execute(ctx).await
}

async fn teardown(bg: &Background, summary: &mut BuildSummary) {
    let status = match bg.task.teardown(&bg.ctx).await {
        Ok(status) => status,
        Err(e) => TaskStatus::failed(e.to_string()),
    };
    for property in bg.task.properties() {
        if property.role() == PropertyRole::Output {
            property.clear();
        }
    }
    println!("{} teardown {}", bg.name, status);
    if status.is_failed() {
        warn!("Teardown of '{}' failed", bg.name);
        if let Some(result) = summary.results.iter_mut().find(|r| r.name == bg.name) {
            result.status = status;
        }
    }
}
