//! Package Helm charts and push them to OCI registries.

use std::{fs, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use tempfile::TempDir;
use url::Url;

use crate::{
    error::{KrakenError, Result},
    property::{AnyProperty, Property, Supplier},
    task::{Project, Task, TaskContext, TaskStatus},
    util::{Credentials, ToolCommand},
};

/// Runs `helm package` and publishes the chart archive through `chart_tarball`.
pub struct HelmPackageTask {
    pub chart_directory: Property<PathBuf>,
    pub version: Property<Option<String>>,
    pub app_version: Property<Option<String>>,
    /// Where to put the archive. Defaults to the task's build directory, keeping helm's file name.
    pub output_file: Property<Option<PathBuf>>,
    pub chart_tarball: Property<PathBuf>,
}

impl HelmPackageTask {
    pub fn new(name: &str) -> Self {
        Self {
            chart_directory: Property::config(name, "chart_directory"),
            version: Property::config(name, "version").with_default(None),
            app_version: Property::config(name, "app_version").with_default(None),
            output_file: Property::config(name, "output_file").with_default(None),
            chart_tarball: Property::output(name, "chart_tarball"),
        }
    }

    fn command(&self, destination: &std::path::Path) -> Result<ToolCommand> {
        let mut command = ToolCommand::new("helm")
            .arg("package")
            .arg(self.chart_directory.get()?.to_string_lossy())
            .arg("--destination")
            .arg(destination.to_string_lossy());
        if let Some(app_version) = self.app_version.get()? {
            command = command.args(["--app-version".to_string(), app_version]);
        }
        if let Some(version) = self.version.get()? {
            command = command.args(["--version".to_string(), version]);
        }
        Ok(command)
    }
}

#[async_trait]
impl Task for HelmPackageTask {
    fn properties(&self) -> Vec<&dyn AnyProperty> {
        vec![
            &self.chart_directory,
            &self.version,
            &self.app_version,
            &self.output_file,
            &self.chart_tarball,
        ]
    }

    fn description(&self) -> Option<String> {
        let chart = self.chart_directory.get().ok()?;
        Some(format!("Package the Helm chart in {}.", chart.display()))
    }

    fn finalize(&self, ctx: &TaskContext) -> Result<()> {
        let dir = ctx.project_dir.clone();
        self.chart_directory.set_map(move |path| dir.join(path))?;
        Ok(())
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskStatus> {
        let staging = TempDir::new()?;
        let status = ctx.run(&self.command(staging.path())?).await?;
        if status.is_failed() {
            return Ok(status);
        }

        let packaged = fs::read_dir(staging.path())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .find(|path| path.extension().is_some_and(|ext| ext == "tgz"))
            .ok_or_else(|| KrakenError::task(&ctx.task_name, "helm package produced no chart archive"))?;
        let destination = match self.output_file.get()? {
            Some(file) => ctx.resolve(&file),
            None => ctx.task_build_dir().join(packaged.file_name().unwrap_or_default()),
        };
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&packaged, &destination)?;

        self.chart_tarball.set(destination.clone())?;
        Ok(TaskStatus::succeeded(format!("packaged {}", destination.display())))
    }
}

/// Pushes a chart archive with `helm push`, logging in with `--password-stdin` first when
/// credentials are configured.
pub struct HelmPushTask {
    pub chart_tarball: Property<PathBuf>,
    /// E.g. `oci://registry.example.test/charts`.
    pub registry: Property<String>,
    pub credentials: Property<Option<Credentials>>,
    pub insecure: Property<bool>,
}

impl HelmPushTask {
    pub fn new(name: &str) -> Self {
        Self {
            chart_tarball: Property::new(name, "chart_tarball"),
            registry: Property::config(name, "registry"),
            credentials: Property::config(name, "credentials").with_default(None),
            insecure: Property::config(name, "insecure").with_default(false),
        }
    }

    /// `helm registry login` takes the registry host, not the OCI URL.
    fn login_host(registry: &str) -> Result<String> {
        let url = Url::parse(registry)
            .map_err(|e| KrakenError::Config(format!("invalid helm registry '{}': {}", registry, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| KrakenError::Config(format!("helm registry '{}' has no host", registry)))?;
        Ok(match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        })
    }

    pub fn login_command(&self) -> Result<Option<ToolCommand>> {
        let Some(credentials) = self.credentials.get()? else {
            return Ok(None);
        };
        let mut command = ToolCommand::new("helm")
            .args(["registry", "login"])
            .arg(Self::login_host(&self.registry.get()?)?)
            .args(["-u", credentials.username.as_str(), "--password-stdin"])
            .stdin(format!("{}\n", credentials.password))
            .secret(credentials.password.as_str());
        if self.insecure.get()? {
            command = command.arg("--insecure");
        }
        Ok(Some(command))
    }
}

#[async_trait]
impl Task for HelmPushTask {
    fn properties(&self) -> Vec<&dyn AnyProperty> {
        vec![&self.chart_tarball, &self.registry, &self.credentials, &self.insecure]
    }

    fn description(&self) -> Option<String> {
        Some(format!("Push a Helm chart to {}.", self.registry.get().ok()?))
    }

    fn finalize(&self, _ctx: &TaskContext) -> Result<()> {
        Self::login_host(&self.registry.get()?)?;
        Ok(())
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskStatus> {
        if let Some(login) = self.login_command()? {
            let status = ctx.run(&login).await?;
            if status.is_failed() {
                return Ok(status);
            }
        }
        let push = ToolCommand::new("helm")
            .arg("push")
            .arg(ctx.resolve(&self.chart_tarball.get()?).to_string_lossy())
            .arg(self.registry.get()?);
        ctx.run(&push).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct HelmPackageOptions {
    pub version: Option<String>,
    pub app_version: Option<String>,
    pub output_file: Option<PathBuf>,
}

pub fn helm_package(
    project: &mut Project,
    name: &str,
    chart_directory: impl Into<PathBuf>,
    options: HelmPackageOptions,
) -> Result<Arc<HelmPackageTask>> {
    let chart_directory = chart_directory.into();
    let task = project.register(name, Some("build"), false, HelmPackageTask::new)?;
    task.chart_directory.set(chart_directory)?;
    task.version.set(options.version)?;
    task.app_version.set(options.app_version)?;
    task.output_file.set(options.output_file)?;
    Ok(task)
}

/// Pass `package.chart_tarball.supplier()` as `chart_tarball` to push the output of a
/// [`HelmPackageTask`]; the push then depends on it.
pub fn helm_push(
    project: &mut Project,
    name: &str,
    chart_tarball: impl Into<Supplier<PathBuf>>,
    registry: &str,
    credentials: Option<Credentials>,
) -> Result<Arc<HelmPushTask>> {
    let chart_tarball = chart_tarball.into();
    let task = project.register(name, Some("publish"), false, HelmPushTask::new)?;
    task.chart_tarball.set(chart_tarball)?;
    task.registry.set(registry.to_string())?;
    task.credentials.set(credentials)?;
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskGraph;

    #[test]
    fn login_uses_host_and_stdin() {
        let task = HelmPushTask::new("helmPush");
        task.registry
            .set("oci://registry.example.test:5000/charts".to_string())
            .unwrap();
        task.credentials
            .set(Some(Credentials::new("robot", "pa55")))
            .unwrap();
        let login = task.login_command().unwrap().unwrap();
        assert_eq!(
            login.get_args(),
            [
                "registry",
                "login",
                "registry.example.test:5000",
                "-u",
                "robot",
                "--password-stdin"
            ]
        );
        assert!(!login.display().contains("pa55"));
    }

    #[test]
    fn no_credentials_no_login() {
        let task = HelmPushTask::new("helmPush");
        task.registry.set("oci://ghcr.io/acme".to_string()).unwrap();
        assert!(task.login_command().unwrap().is_none());
    }

    #[test]
    fn push_depends_on_package_output() {
        let mut project = Project::new("demo", "/tmp/demo");
        let package = helm_package(&mut project, "helmPackage", "chart", HelmPackageOptions::default()).unwrap();
        helm_push(
            &mut project,
            "helmPush",
            package.chart_tarball.supplier(),
            "oci://ghcr.io/acme",
            None,
        )
        .unwrap();
        let graph = TaskGraph::build(&project).unwrap();
        let selected = graph.select(&["helmPush".to_string()]).unwrap();
        assert_eq!(graph.execution_order(&selected), vec!["helmPackage", "helmPush"]);
    }

    #[test]
    fn package_command_resolves_chart_directory() {
        let project = Project::new("demo", "/src/demo");
        let ctx = project.context("helmPackage", Default::default(), None);
        let task = HelmPackageTask::new("helmPackage");
        task.chart_directory.set(PathBuf::from("chart")).unwrap();
        task.version.set(Some("1.2.3".to_string())).unwrap();
        task.finalize(&ctx).unwrap();

        let command = task.command(std::path::Path::new("/tmp/out")).unwrap();
        assert_eq!(
            command.get_args(),
            ["package", "/src/demo/chart", "--destination", "/tmp/out", "--version", "1.2.3"]
        );
    }
}
