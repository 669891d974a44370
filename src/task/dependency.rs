use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use super::Project;
use crate::error::{KrakenError, Result};

/// `from` must finish before `to` starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub strict: bool,
    /// The edge was inferred from `to` reading a property of `from`.
    pub data: bool,
}

/// Relationships of all tasks in a project, resolved to task names and verified to be acyclic.
#[derive(Debug)]
pub struct TaskGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
}

impl TaskGraph {
    pub fn build(project: &Project) -> Result<Self> {
        let names: Vec<String> = project.entries().iter().map(|e| e.name.clone()).collect();
        let index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        let mut graph = Self {
            names,
            index,
            edges: Vec::new(),
        };

        for entry in project.entries() {
            for rel in entry.relationships() {
                let direct = rel.selector.trim_start_matches(':').trim_end_matches('?');
                for other in project.resolve(&rel.selector)? {
                    if other == entry.name {
                        if direct == entry.name {
                            return Err(KrakenError::Dependency(format!(
                                "Task '{}' depends on itself",
                                entry.name
                            )));
                        }
                        continue;
                    }
                    if rel.dependency {
                        graph.add_edge(&other, &entry.name, rel.strict, false);
                    } else {
                        graph.add_edge(&entry.name, &other, rel.strict, false);
                    }
                }
            }

            for property in entry.task.properties() {
                for lineage in property.lineage() {
                    if lineage.task == entry.name {
                        continue;
                    }
                    if !project.contains(&lineage.task) {
                        return Err(KrakenError::Dependency(format!(
                            "Task '{}' reads '{}.{}' but there is no task '{}'",
                            entry.name, lineage.task, lineage.property, lineage.task
                        )));
                    }
                    graph.add_edge(&lineage.task, &entry.name, true, true);
                }
            }
        }

        graph.detect_cycles()?;
        Ok(graph)
    }

    fn add_edge(&mut self, from: &str, to: &str, strict: bool, data: bool) {
        if let Some(edge) = self.edges.iter_mut().find(|e| e.from == from && e.to == to) {
            edge.strict |= strict;
            edge.data |= data;
            return;
        }
        self.edges.push(Edge {
            from: from.to_string(),
            to: to.to_string(),
            strict,
            data,
        });
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn dependencies(&self, task: &str) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.to == task)
    }

    pub fn dependents(&self, task: &str) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.from == task)
    }

    /// The given tasks plus everything they strictly depend on, transitively, in declaration order.
    pub fn select(&self, roots: &[String]) -> Result<Vec<String>> {
        let mut needed: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();

        for root in roots {
            if !self.index.contains_key(root) {
                return Err(KrakenError::task(root.clone(), "not found"));
            }
            queue.push_back(root);
        }

        while let Some(current) = queue.pop_front() {
            if !needed.insert(current) {
                continue;
            }
            for edge in self.dependencies(current).filter(|e| e.strict) {
                if !needed.contains(edge.from.as_str()) {
                    queue.push_back(&edge.from);
                }
            }
        }

        Ok(self
            .names
            .iter()
            .filter(|name| needed.contains(name.as_str()))
            .cloned()
            .collect())
    }

    /// Topological order of `selected`. Edges to tasks outside the selection are ignored, and ties
    /// are broken by declaration order.
    pub fn execution_order(&self, selected: &[String]) -> Vec<String> {
        let selected: HashSet<&str> = selected.iter().map(String::as_str).collect();
        let mut in_degrees: HashMap<&str, usize> = selected.iter().map(|name| (*name, 0)).collect();

        for edge in &self.edges {
            if selected.contains(edge.from.as_str()) && selected.contains(edge.to.as_str()) {
                if let Some(count) = in_degrees.get_mut(edge.to.as_str()) {
                    *count += 1;
                }
            }
        }

        let mut ready: BTreeSet<usize> = in_degrees
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .filter_map(|(name, _)| self.index.get(*name).copied())
            .collect();

        let mut sorted = Vec::new();

        while let Some(i) = ready.pop_first() {
            let task = self.names[i].as_str();
            sorted.push(task.to_string());

            for edge in self.dependents(task) {
                if let Some(count) = in_degrees.get_mut(edge.to.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        if let Some(&j) = self.index.get(&edge.to) {
                            ready.insert(j);
                        }
                    }
                }
            }
        }

        sorted
    }

    fn detect_cycles(&self) -> Result<()> {
        let mut visited = HashSet::new();

        for name in &self.names {
            let mut path = Vec::new();
            if let Some(cycle) = self.find_cycle(name, &mut visited, &mut path) {
                return Err(KrakenError::Dependency(format!(
                    "Circular dependency: {}",
                    cycle.join(" -> ")
                )));
            }
        }

        Ok(())
    }

    fn find_cycle<'a>(
        &'a self,
        task: &'a str,
        visited: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = path.iter().position(|t| *t == task) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|t| t.to_string()).collect();
            cycle.push(task.to_string());
            return Some(cycle);
        }

        if !visited.insert(task) {
            return None;
        }

        path.push(task);
        for edge in self.dependencies(task) {
            if let Some(cycle) = self.find_cycle(&edge.from, visited, path) {
                return Some(cycle);
            }
        }
        path.pop();

        None
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        property::{AnyProperty, Property},
        task::{Relationship, Task, TaskContext, TaskStatus},
    };

    struct Node {
        input: Property<String>,
        output: Property<String>,
        relationships: Vec<Relationship>,
    }

    impl Node {
        fn new(name: &str, relationships: &[&str]) -> Self {
            Self {
                input: Property::new(name, "input"),
                output: Property::output(name, "output"),
                relationships: relationships
                    .iter()
                    .map(|s| Relationship::depends_on(*s))
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl Task for Node {
        fn properties(&self) -> Vec<&dyn AnyProperty> {
            vec![&self.input, &self.output]
        }

        fn relationships(&self) -> Vec<Relationship> {
            self.relationships.clone()
        }

        async fn execute(&self, _ctx: &TaskContext) -> crate::error::Result<TaskStatus> {
            Ok(TaskStatus::Succeeded(None))
        }
    }

    fn add(project: &mut Project, name: &str, deps: &[&str]) -> std::sync::Arc<Node> {
        project
            .register(name, None, false, |n| Node::new(n, deps))
            .unwrap()
    }

    #[test]
    fn order_is_topological_with_declaration_tiebreak() {
        let mut project = Project::new("p", "/tmp/p");
        add(&mut project, "c", &["a"]);
        add(&mut project, "b", &[]);
        add(&mut project, "a", &[]);
        add(&mut project, "d", &["c", "b"]);
        let graph = TaskGraph::build(&project).unwrap();
        let all = graph.select(&["d".to_string()]).unwrap();
        assert_eq!(all, vec!["c", "b", "a", "d"]);
        assert_eq!(graph.execution_order(&all), vec!["b", "a", "c", "d"]);
    }

    #[test]
    fn cycles_are_reported_with_their_path() {
        let mut project = Project::new("p", "/tmp/p");
        add(&mut project, "a", &["b"]);
        add(&mut project, "b", &["c"]);
        add(&mut project, "c", &["a"]);
        match TaskGraph::build(&project) {
            Err(KrakenError::Dependency(msg)) => {
                assert_eq!(msg, "Circular dependency: a -> b -> c -> a")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn reading_an_output_infers_a_strict_data_edge() {
        let mut project = Project::new("p", "/tmp/p");
        let package = add(&mut project, "package", &[]);
        let push = add(&mut project, "push", &[]);
        push.input.set(package.output.supplier()).unwrap();
        let graph = TaskGraph::build(&project).unwrap();
        assert_eq!(
            graph.edges(),
            &[Edge {
                from: "package".into(),
                to: "push".into(),
                strict: true,
                data: true,
            }]
        );
        assert_eq!(graph.select(&["push".into()]).unwrap(), vec!["package", "push"]);
    }

    #[test]
    fn non_strict_edges_order_but_do_not_select() {
        let mut project = Project::new("p", "/tmp/p");
        add(&mut project, "check", &[]);
        add(&mut project, "render", &[]);
        project.add_relationship("check", "render", false).unwrap();
        let graph = TaskGraph::build(&project).unwrap();
        assert_eq!(graph.select(&["check".into()]).unwrap(), vec!["check"]);
        let both = vec!["check".to_string(), "render".to_string()];
        assert_eq!(graph.execution_order(&both), vec!["render", "check"]);
    }

    #[test]
    fn optional_selectors_may_match_nothing() {
        let mut project = Project::new("p", "/tmp/p");
        add(&mut project, "build", &[":cargoBuildSupport?"]);
        assert!(TaskGraph::build(&project).unwrap().edges().is_empty());

        let mut project = Project::new("p", "/tmp/p");
        add(&mut project, "build", &[":cargoBuildSupport"]);
        assert!(TaskGraph::build(&project).is_err());
    }
}
