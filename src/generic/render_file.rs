use std::{fs, path::PathBuf, sync::Arc};

use async_trait::async_trait;

use crate::{
    error::{KrakenError, Result},
    property::{AnyProperty, Property, PropertyError, Supplier},
    task::{Project, Task, TaskContext, TaskStatus},
};

pub const DEFAULT_ENCODING: &str = "utf-8";

fn encode(content: &str, encoding: &str) -> Result<Vec<u8>> {
    match encoding.to_ascii_lowercase().as_str() {
        "utf-8" | "utf8" => Ok(content.as_bytes().to_vec()),
        "ascii" if content.is_ascii() => Ok(content.as_bytes().to_vec()),
        "ascii" => Err(KrakenError::Config(
            "content cannot be encoded as ascii".to_string(),
        )),
        other => Err(KrakenError::Config(format!("unsupported encoding '{}'", other))),
    }
}

/// Writes `content` to `file`. Up to date when the file already holds exactly those bytes.
pub struct RenderFileTask {
    name: String,
    pub file: Property<PathBuf>,
    pub content: Property<String>,
    pub encoding: Property<String>,
}

impl RenderFileTask {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            file: Property::new(name, "file"),
            content: Property::new(name, "content"),
            encoding: Property::new(name, "encoding").with_default(DEFAULT_ENCODING.to_string()),
        }
    }

    pub fn rendered(&self) -> Result<Vec<u8>> {
        encode(&self.content.get()?, &self.encoding.get()?)
    }

    /// Register a task in `group` that fails when the rendered file is missing or stale.
    pub fn make_check_task(
        &self,
        project: &mut Project,
        name: Option<&str>,
        group: &str,
        default: bool,
    ) -> Result<Arc<CheckFileContentsTask>> {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.check", self.name));

        // Callables without dependencies: the check must not pull the render task into the build.
        let file = self.file.clone();
        let content = self.content.clone();
        let encoding = self.encoding.clone();
        let update_task = self.name.clone();

        let task = project.register(&name, Some(group), default, CheckFileContentsTask::new)?;
        task.file
            .set(Supplier::of_callable(move || file.get(), vec![]))?;
        task.content.set(Supplier::of_callable(
            move || {
                let content = content.get()?;
                let encoding = encoding.get()?;
                encode(&content, &encoding).map_err(|e| PropertyError::Supplier(e.to_string()))
            },
            vec![],
        ))?;
        task.update_task.set(update_task)?;
        project.add_relationship(&name, &self.name, false)?;
        Ok(task)
    }
}

#[async_trait]
impl Task for RenderFileTask {
    fn properties(&self) -> Vec<&dyn AnyProperty> {
        vec![&self.file, &self.content, &self.encoding]
    }

    fn description(&self) -> Option<String> {
        let file = self.file.get().ok()?;
        Some(format!("Create or update \"{}\".", file.display()))
    }

    fn finalize(&self, ctx: &TaskContext) -> Result<()> {
        let dir = ctx.project_dir.clone();
        self.file.set_map(move |path| dir.join(path))?;
        Ok(())
    }

    async fn prepare(&self, _ctx: &TaskContext) -> Result<Option<TaskStatus>> {
        let file = self.file.get()?;
        if file.is_file() && fs::read(&file)? == self.rendered()? {
            return Ok(Some(TaskStatus::UpToDate(None)));
        }
        Ok(None)
    }

    async fn execute(&self, _ctx: &TaskContext) -> Result<TaskStatus> {
        let file = self.file.get()?;
        let bytes = self.rendered()?;
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&file, &bytes)?;
        Ok(TaskStatus::succeeded(format!(
            "write {} bytes to {}",
            bytes.len(),
            file.display()
        )))
    }
}

pub struct CheckFileContentsTask {
    pub file: Property<PathBuf>,
    pub content: Property<Vec<u8>>,
    pub update_task: Property<String>,
}

impl CheckFileContentsTask {
    pub fn new(name: &str) -> Self {
        Self {
            file: Property::new(name, "file"),
            content: Property::new(name, "content"),
            update_task: Property::new(name, "update_task"),
        }
    }
}

#[async_trait]
impl Task for CheckFileContentsTask {
    fn properties(&self) -> Vec<&dyn AnyProperty> {
        vec![&self.file, &self.content, &self.update_task]
    }

    fn description(&self) -> Option<String> {
        let file = self.file.get().ok()?;
        Some(format!("Check if \"{}\" is up to date.", file.display()))
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskStatus> {
        let file = self.file.get()?;
        let shown = file.strip_prefix(&ctx.project_dir).unwrap_or(file.as_path()).display();
        let update_task = self.update_task.get()?;

        if !file.exists() {
            return Ok(TaskStatus::failed(format!(
                "file \"{}\" does not exist, run {} to generate it",
                shown, update_task
            )));
        }
        if !file.is_file() {
            return Ok(TaskStatus::failed(format!("\"{}\" is not a file", shown)));
        }
        if fs::read(&file)? != self.content.get()? {
            return Ok(TaskStatus::failed(format!(
                "file \"{}\" is not up to date, run {} to update it",
                shown, update_task
            )));
        }
        Ok(TaskStatus::Succeeded(None))
    }
}

/// Register a [`RenderFileTask`] writing `content` to `file` (relative to the project directory).
pub fn render_file(
    project: &mut Project,
    name: &str,
    file: impl Into<PathBuf>,
    content: impl Into<Supplier<String>>,
) -> Result<Arc<RenderFileTask>> {
    let file = file.into();
    let content = content.into();
    let task = project.register(name, None, true, RenderFileTask::new)?;
    task.file.set(file)?;
    task.content.set(content)?;
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{RunOptions, TaskRunner};
    use tempfile::TempDir;

    #[tokio::test]
    async fn renders_then_reports_up_to_date() {
        let dir = TempDir::new().unwrap();
        let mut project = Project::new("p", dir.path());
        render_file(&mut project, "renderReadme", "docs/README.md", "hello\n".to_string()).unwrap();

        let runner = TaskRunner::new(&project, RunOptions::default());
        let summary = runner.run(&["renderReadme".into()]).await.unwrap();
        assert_eq!(
            summary.status("renderReadme"),
            Some(&TaskStatus::succeeded(format!(
                "write 6 bytes to {}",
                dir.path().join("docs/README.md").display()
            )))
        );
        assert_eq!(fs::read_to_string(dir.path().join("docs/README.md")).unwrap(), "hello\n");

        let summary = runner.run(&["renderReadme".into()]).await.unwrap();
        assert_eq!(summary.status("renderReadme"), Some(&TaskStatus::UpToDate(None)));
    }

    #[tokio::test]
    async fn check_task_fails_until_rendered() {
        let dir = TempDir::new().unwrap();
        let mut project = Project::new("p", dir.path());
        let render = render_file(&mut project, "renderConfig", "config.txt", "a = 1\n".to_string()).unwrap();
        render.make_check_task(&mut project, None, "lint", false).unwrap();

        let runner = TaskRunner::new(&project, RunOptions::default());
        let summary = runner.run(&["renderConfig.check".into()]).await.unwrap();
        assert_eq!(summary.order, vec!["renderConfig.check"]);
        match summary.status("renderConfig.check") {
            Some(TaskStatus::Failed { message, .. }) => {
                assert!(message.contains("does not exist, run renderConfig"))
            }
            other => panic!("unexpected: {other:?}"),
        }

        let summary = runner.run(&["renderConfig".into(), "lint".into()]).await.unwrap();
        assert_eq!(summary.order, vec!["renderConfig", "renderConfig.check"]);
        assert!(summary.is_success());

        fs::write(dir.path().join("config.txt"), "a = 2\n").unwrap();
        let summary = runner.run(&["lint".into()]).await.unwrap();
        match summary.status("renderConfig.check") {
            Some(TaskStatus::Failed { message, .. }) => assert!(message.contains("not up to date")),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
