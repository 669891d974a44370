//! Distribution archives built from task outputs and project files.

use std::{
    collections::BTreeSet,
    fmt, fs,
    io::{self, Write},
    path::{Component, Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use async_trait::async_trait;
use flate2::{Compression, write::GzEncoder};
use serde::Deserialize;
use tempfile::NamedTempFile;
use tracing::info;
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use crate::{
    error::{KrakenError, Result},
    fs::set_new_file_permissions,
    property::{AnyProperty, Property, Supplier},
    task::{Project, Task, TaskContext, TaskStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ArchiveType {
    #[serde(rename = "tar")]
    Tar,
    #[serde(rename = "tar.gz", alias = "tgz")]
    TarGz,
    #[serde(rename = "zip")]
    Zip,
}

impl ArchiveType {
    /// The archive type implied by the file name: `.tar`, `.tar.gz`, `.tgz` or `.zip`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Ok(ArchiveType::TarGz)
        } else if name.ends_with(".tar") {
            Ok(ArchiveType::Tar)
        } else if name.ends_with(".zip") {
            Ok(ArchiveType::Zip)
        } else {
            Err(KrakenError::Config(format!(
                "cannot derive the archive type of {}, set archive_type to tar, tar.gz or zip",
                path.display()
            )))
        }
    }
}

impl FromStr for ArchiveType {
    type Err = KrakenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tar" => Ok(ArchiveType::Tar),
            "tar.gz" | "tgz" => Ok(ArchiveType::TarGz),
            "zip" => Ok(ArchiveType::Zip),
            other => Err(KrakenError::Config(format!("unsupported archive type: '{}'", other))),
        }
    }
}

impl fmt::Display for ArchiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArchiveType::Tar => "tar",
            ArchiveType::TarGz => "tar.gz",
            ArchiveType::Zip => "zip",
        })
    }
}

/// One file or directory to put into the archive. Without `arcname`, a path inside the project
/// keeps its project-relative path and anything else is stored under its file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistResource {
    pub path: PathBuf,
    pub arcname: Option<String>,
}

/// Writes the files of all `resources` into one archive and publishes its path as `archive`.
pub struct DistributionTask {
    pub output_file: Property<PathBuf>,
    /// Derived from the `output_file` suffix when unset.
    pub archive_type: Property<Option<ArchiveType>>,
    /// Directory prepended to every name in the archive.
    pub prefix: Property<Option<String>>,
    pub resources: Property<Vec<DistResource>>,
    pub archive: Property<PathBuf>,
}

impl DistributionTask {
    pub fn new(name: &str) -> Self {
        Self {
            output_file: Property::config(name, "output_file"),
            archive_type: Property::config(name, "archive_type").with_default(None),
            prefix: Property::config(name, "prefix").with_default(None),
            resources: Property::new(name, "resources").with_default(Vec::new()),
            archive: Property::output(name, "archive"),
        }
    }

    fn kind(&self) -> Result<ArchiveType> {
        match self.archive_type.get()? {
            Some(kind) => Ok(kind),
            None => ArchiveType::from_path(&self.output_file.get()?),
        }
    }

    /// Archive name and source file of every file to write, directories expanded.
    pub fn entries(&self, ctx: &TaskContext) -> Result<Vec<(String, PathBuf)>> {
        let prefix = self.prefix.get()?;
        let mut entries = Vec::new();
        for resource in self.resources.get()? {
            let path = ctx.resolve(&resource.path);
            let arcname = match resource.arcname {
                Some(arcname) => arcname,
                None => default_arcname(&resource.path, &ctx.project_dir),
            };
            let arcname = match &prefix {
                Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), arcname),
                None => arcname,
            };
            if !path.exists() {
                return Err(KrakenError::task(
                    &ctx.task_name,
                    format!("{} does not exist", path.display()),
                ));
            }
            collect_files(&arcname, &path, &mut entries)?;
        }

        let mut seen = BTreeSet::new();
        for (arcname, _) in &entries {
            if !seen.insert(arcname.as_str()) {
                return Err(KrakenError::task(
                    &ctx.task_name,
                    format!("'{}' would be added to the archive twice", arcname),
                ));
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl Task for DistributionTask {
    fn properties(&self) -> Vec<&dyn AnyProperty> {
        vec![
            &self.output_file,
            &self.archive_type,
            &self.prefix,
            &self.resources,
            &self.archive,
        ]
    }

    fn description(&self) -> Option<String> {
        let output = self.output_file.get().ok()?;
        Some(format!("Create the distribution archive {}.", output.display()))
    }

    fn finalize(&self, _ctx: &TaskContext) -> Result<()> {
        self.kind()?;
        Ok(())
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskStatus> {
        let output = ctx.resolve(&self.output_file.get()?);
        let kind = self.kind()?;
        let entries = self.entries(ctx)?;

        info!("Writing archive {}", output.display());
        for (arcname, path) in &entries {
            info!("  + {} ({})", arcname, path.display());
        }
        write_archive(&output, kind, &entries)?;

        self.archive.set(output.clone())?;
        Ok(TaskStatus::succeeded(format!(
            "wrote {} ({} files)",
            output.display(),
            entries.len()
        )))
    }
}

fn default_arcname(path: &Path, project_dir: &Path) -> String {
    let relative = if path.is_relative() {
        Some(path)
    } else {
        path.strip_prefix(project_dir).ok()
    };
    match relative {
        Some(relative) => relative
            .components()
            .filter_map(|component| match component {
                Component::Normal(part) => Some(part.to_string_lossy()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/"),
        None => path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}

/// Files under `path`, in name order.
fn collect_files(arcname: &str, path: &Path, out: &mut Vec<(String, PathBuf)>) -> Result<()> {
    if path.is_dir() {
        let mut children = fs::read_dir(path)?.collect::<io::Result<Vec<_>>>()?;
        children.sort_by_key(|entry| entry.file_name());
        for child in children {
            let name = format!("{}/{}", arcname, child.file_name().to_string_lossy());
            collect_files(&name, &child.path(), out)?;
        }
    } else {
        out.push((arcname.to_string(), path.to_path_buf()));
    }
    Ok(())
}

enum ArchiveWriter<W: Write + io::Seek> {
    Tar(tar::Builder<W>),
    TarGz(tar::Builder<GzEncoder<W>>),
    Zip(ZipWriter<W>),
}

impl<W: Write + io::Seek> ArchiveWriter<W> {
    fn new(inner: W, kind: ArchiveType) -> Self {
        match kind {
            ArchiveType::Tar => ArchiveWriter::Tar(tar::Builder::new(inner)),
            ArchiveType::TarGz => {
                ArchiveWriter::TarGz(tar::Builder::new(GzEncoder::new(inner, Compression::default())))
            }
            ArchiveType::Zip => ArchiveWriter::Zip(ZipWriter::new(inner)),
        }
    }

    fn add_file(&mut self, arcname: &str, path: &Path) -> Result<()> {
        match self {
            ArchiveWriter::Tar(builder) => builder.append_path_with_name(path, arcname)?,
            ArchiveWriter::TarGz(builder) => builder.append_path_with_name(path, arcname)?,
            ArchiveWriter::Zip(writer) => {
                let options = SimpleFileOptions::default()
                    .compression_method(CompressionMethod::Deflated)
                    .unix_permissions(file_mode(path)?);
                writer.start_file(arcname, options)?;
                io::copy(&mut fs::File::open(path)?, writer)?;
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<()> {
        match self {
            ArchiveWriter::Tar(builder) => {
                builder.into_inner()?.flush()?;
            }
            ArchiveWriter::TarGz(builder) => {
                builder.into_inner()?.finish()?.flush()?;
            }
            ArchiveWriter::Zip(writer) => {
                writer.finish()?.flush()?;
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    Ok(fs::metadata(path)?.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Result<u32> {
    Ok(0o644)
}

/// Write the archive next to `output` and move it into place once complete.
pub fn write_archive(output: &Path, kind: ArchiveType, entries: &[(String, PathBuf)]) -> Result<()> {
    let dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let tmp = NamedTempFile::new_in(dir)?;
    let mut writer = ArchiveWriter::new(tmp.reopen()?, kind);
    for (arcname, path) in entries {
        writer.add_file(arcname, path)?;
    }
    writer.finish()?;
    set_new_file_permissions(tmp.as_file())?;
    tmp.persist(output).map_err(|e| e.error)?;
    Ok(())
}

/// Files a [`dist`] archive takes from one task output or project path.
pub struct DistInput {
    files: Supplier<Vec<PathBuf>>,
    arcname: Option<String>,
}

impl DistInput {
    /// Pass `task.property.supplier()` to depend on the task producing the file.
    pub fn file(path: impl Into<Supplier<PathBuf>>) -> Self {
        let path: Supplier<PathBuf> = path.into();
        Self {
            files: path.map(|path| vec![path]),
            arcname: None,
        }
    }

    pub fn files(paths: impl Into<Supplier<Vec<PathBuf>>>) -> Self {
        Self {
            files: paths.into(),
            arcname: None,
        }
    }

    /// Name in the archive. For an input with several files it names the directory they go into.
    pub fn arcname(mut self, arcname: impl Into<String>) -> Self {
        self.arcname = Some(arcname.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct DistOptions {
    pub archive_type: Option<ArchiveType>,
    pub prefix: Option<String>,
    pub group: Option<String>,
}

/// Register a [`DistributionTask`]. A relative `output_file` is placed in the build directory.
/// Every input's tasks become dependencies of the archive.
pub fn dist(
    project: &mut Project,
    name: &str,
    inputs: Vec<DistInput>,
    output_file: impl Into<PathBuf>,
    options: DistOptions,
) -> Result<Arc<DistributionTask>> {
    let output_file = output_file.into();
    let output_file = if output_file.is_relative() {
        project.build_directory().join(output_file)
    } else {
        output_file
    };

    let dependencies = inputs.iter().map(|input| input.files.as_dependency()).collect();
    let resources = Supplier::of_callable(
        move || {
            let mut resources = Vec::new();
            for input in &inputs {
                let files = input.files.get()?;
                let nested = files.len() > 1;
                for path in files {
                    let arcname = match (&input.arcname, nested) {
                        (Some(dir), true) => Some(format!(
                            "{}/{}",
                            dir.trim_end_matches('/'),
                            path.file_name().unwrap_or_default().to_string_lossy()
                        )),
                        (arcname, _) => arcname.clone(),
                    };
                    resources.push(DistResource { path, arcname });
                }
            }
            Ok(resources)
        },
        dependencies,
    );

    let group = options.group.as_deref().unwrap_or("build");
    let task = project.register(name, Some(group), false, DistributionTask::new)?;
    task.output_file.set(output_file)?;
    task.archive_type.set(options.archive_type)?;
    task.prefix.set(options.prefix)?;
    task.resources.set(resources)?;
    Ok(task)
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    use super::*;
    use crate::task::TaskGraph;

    fn context(dir: &Path) -> TaskContext {
        Project::new("demo", dir).context("dist", Default::default(), None)
    }

    #[test]
    fn archive_type_follows_the_suffix() {
        assert_eq!(ArchiveType::from_path(Path::new("out/app.tgz")).unwrap(), ArchiveType::TarGz);
        assert_eq!(ArchiveType::from_path(Path::new("app-1.0.TAR.GZ")).unwrap(), ArchiveType::TarGz);
        assert_eq!(ArchiveType::from_path(Path::new("app.tar")).unwrap(), ArchiveType::Tar);
        assert_eq!(ArchiveType::from_path(Path::new("app.zip")).unwrap(), ArchiveType::Zip);
        assert!(ArchiveType::from_path(Path::new("app.tar.xz")).is_err());
        assert!("rar".parse::<ArchiveType>().is_err());
    }

    #[test]
    fn arcnames_keep_project_paths_and_prefix() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("conf/extra")).unwrap();
        fs::write(dir.path().join("conf/app.toml"), "a").unwrap();
        fs::write(dir.path().join("conf/extra/b.toml"), "b").unwrap();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("kraken"), "bin").unwrap();

        let task = DistributionTask::new("dist");
        task.prefix.set(Some("app-1.0/".to_string())).unwrap();
        task.resources
            .set(vec![
                DistResource { path: PathBuf::from("conf"), arcname: None },
                DistResource { path: outside.path().join("kraken"), arcname: None },
                DistResource { path: dir.path().join("conf/app.toml"), arcname: Some("etc/app.toml".into()) },
            ])
            .unwrap();
        let names: Vec<String> = task
            .entries(&context(dir.path()))
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(
            names,
            [
                "app-1.0/conf/app.toml",
                "app-1.0/conf/extra/b.toml",
                "app-1.0/kraken",
                "app-1.0/etc/app.toml",
            ]
        );
    }

    #[test]
    fn duplicate_and_missing_entries_fail() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("README.md"), "hi").unwrap();
        let task = DistributionTask::new("dist");
        task.resources
            .set(vec![
                DistResource { path: PathBuf::from("README.md"), arcname: None },
                DistResource { path: dir.path().join("README.md"), arcname: None },
            ])
            .unwrap();
        let err = task.entries(&context(dir.path())).unwrap_err().to_string();
        assert!(err.contains("'README.md' would be added to the archive twice"));

        task.resources
            .set(vec![DistResource { path: PathBuf::from("missing"), arcname: None }])
            .unwrap();
        assert!(task.entries(&context(dir.path())).unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn writes_tar_gz_and_zip() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("LICENSE"), "MIT").unwrap();
        let entries = vec![("pkg/LICENSE".to_string(), dir.path().join("LICENSE"))];

        let tgz = dir.path().join("out/pkg.tar.gz");
        write_archive(&tgz, ArchiveType::TarGz, &entries).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(fs::File::open(&tgz).unwrap()));
        let mut entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap(), Path::new("pkg/LICENSE"));
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "MIT");

        let zip_path = dir.path().join("out/pkg.zip");
        write_archive(&zip_path, ArchiveType::Zip, &entries).unwrap();
        let mut archive = zip::ZipArchive::new(fs::File::open(&zip_path).unwrap()).unwrap();
        let mut file = archive.by_name("pkg/LICENSE").unwrap();
        let mut content = String::new();
        file.read_to_string(&mut content).unwrap();
        assert_eq!(content, "MIT");
        assert_eq!(fs::read_dir(dir.path().join("out")).unwrap().count(), 2);
    }

    #[test]
    fn archive_depends_on_the_tasks_providing_files() {
        let mut project = Project::new("demo", "/tmp/demo");
        let chart = crate::helm::helm_package(
            &mut project,
            "helmPackage",
            "chart",
            crate::helm::HelmPackageOptions::default(),
        )
        .unwrap();
        let task = dist(
            &mut project,
            "dist",
            vec![
                DistInput::file(chart.chart_tarball.supplier()).arcname("chart.tgz"),
                DistInput::file(PathBuf::from("README.md")),
            ],
            "demo.zip",
            DistOptions::default(),
        )
        .unwrap();
        assert_eq!(task.output_file.get().unwrap(), Path::new("/tmp/demo/build/demo.zip"));

        let graph = TaskGraph::build(&project).unwrap();
        let selected = graph.select(&["dist".to_string()]).unwrap();
        assert_eq!(graph.execution_order(&selected), vec!["helmPackage", "dist"]);
    }

    #[test]
    fn several_files_go_into_the_arcname_directory() {
        let mut project = Project::new("demo", "/tmp/demo");
        let files = vec![PathBuf::from("/opt/bin/a"), PathBuf::from("/opt/bin/b")];
        let task = dist(
            &mut project,
            "dist",
            vec![DistInput::files(files).arcname("bin"), DistInput::file(PathBuf::from("/etc/x.conf")).arcname("x.conf")],
            "/tmp/out/demo.tar",
            DistOptions::default(),
        )
        .unwrap();
        let arcnames: Vec<Option<String>> = task.resources.get().unwrap().into_iter().map(|r| r.arcname).collect();
        assert_eq!(
            arcnames,
            vec![Some("bin/a".to_string()), Some("bin/b".to_string()), Some("x.conf".to_string())]
        );
        assert_eq!(task.output_file.get().unwrap(), Path::new("/tmp/out/demo.tar"));
    }
}
