use tracing::info;

use super::{Project, TaskGraph};

pub fn show_task_relationships(graph: &TaskGraph, verbose: bool) {
    if !verbose {
        return;
    }

    for edge in graph.edges() {
        let kind = if edge.strict { "depends on" } else { "runs after" };
        if edge.data {
            info!("Task '{}' {} '{}' and reads its properties", edge.to, kind, edge.from);
        } else {
            info!("Task '{}' {} '{}' for ordering only", edge.to, kind, edge.from);
        }
    }
}

/// One line per task: name, group, default marker and description.
pub fn list_tasks(project: &Project) -> Vec<String> {
    let width = project
        .entries()
        .iter()
        .map(|e| e.name.len())
        .max()
        .unwrap_or(0);

    project
        .entries()
        .iter()
        .map(|entry| {
            let group = entry
                .group
                .as_deref()
                .map(|g| format!(" [{}]", g))
                .unwrap_or_default();
            let default = if entry.default { " *" } else { "" };
            let description = entry.task.description().unwrap_or_default();
            format!(
                "{:width$}{}{}  {}",
                entry.name,
                default,
                group,
                description,
                width = width
            )
            .trim_end()
            .to_string()
        })
        .collect()
}
