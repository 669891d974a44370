use std::fs;

use kraken_std::{
    execution::{RunOptions, TaskRunner},
    task::{list_tasks, load_project},
};
use tempfile::TempDir;

const KRAKEN_TOML: &str = r#"
[project]
name = "${NAME}"
default_timeout = "10m"

[variables]
NAME = "pydemo"
CHART_VERSION = "0.3.0"

[python]
build_system = "poetry"
install = true
black = true
flake8 = { config_file = ".flake8" }

[python.build]
as_version = "1.0.0"

[[python.indexes]]
alias = "internal"
index_url = "https://pypi.example.test/simple"
upload_url = "https://pypi.example.test/upload"

[[python.publish]]
index = "internal"

[[helm]]
name = "helmPackage"
chart_directory = "chart"
version = "$CHART_VERSION"
"#;

fn write_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("kraken.toml"), KRAKEN_TOML).unwrap();
    dir
}

#[tokio::test]
async fn loads_tasks_from_the_project_file() {
    let dir = write_project();
    let loaded = load_project(&dir.path().join("kraken.toml")).await.unwrap();
    assert_eq!(loaded.project.name(), "pydemo");
    assert_eq!(loaded.default_timeout.as_deref(), Some("10m"));

    let listing = list_tasks(&loaded.project);
    for task in [
        "pythonInstall",
        "blackCheck",
        "blackFormat",
        "flake8",
        "pythonBuild",
        "pythonPublish.internal",
        "helmPackage",
    ] {
        assert!(
            listing.iter().any(|line| line.starts_with(task)),
            "{task} missing from {listing:?}"
        );
    }
    let helm = listing.iter().find(|line| line.starts_with("helmPackage")).unwrap();
    assert!(helm.contains("[build]"));
}

#[tokio::test]
async fn lint_runs_after_install_when_both_are_selected() {
    let dir = write_project();
    let loaded = load_project(&dir.path().join("kraken.toml")).await.unwrap();
    let options = RunOptions {
        dry_run: true,
        ..Default::default()
    };

    let lint_only = TaskRunner::new(&loaded.project, options.clone())
        .run(&["lint".to_string()])
        .await
        .unwrap();
    assert_eq!(lint_only.order, vec!["blackCheck", "flake8"]);

    let with_install = TaskRunner::new(&loaded.project, options)
        .run(&["lint".to_string(), "pythonInstall".to_string()])
        .await
        .unwrap();
    assert_eq!(with_install.order, vec!["pythonInstall", "blackCheck", "flake8"]);
}

#[tokio::test]
async fn publishing_pulls_in_the_build() {
    let dir = write_project();
    let loaded = load_project(&dir.path().join("kraken.toml")).await.unwrap();
    let options = RunOptions {
        dry_run: true,
        ..Default::default()
    };
    let summary = TaskRunner::new(&loaded.project, options)
        .run(&["publish".to_string()])
        .await
        .unwrap();
    assert_eq!(summary.order, vec!["pythonBuild", "pythonPublish.internal"]);
}

#[tokio::test]
async fn missing_project_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    assert!(load_project(&dir.path().join("kraken.toml")).await.is_err());
}
