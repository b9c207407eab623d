//! Command handlers.

use crate::config::CliConfig;
use crate::executor::{self, RunOptions};
use console::style;
use keel_runner::CancellationToken;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

pub const STARTER_FILE: &str = "keel.yaml";

pub const STARTER_PIPELINE: &str = r#"name: my-app
description: Build a container image and push it to the registry

environment:
  IMAGE: registry.example.com/my-app
  TAG: latest

timeout_seconds: 1800

stages:
  - name: clone
    run: git clone --depth 1 https://git.example.com/my-app.git src

  - name: build
    working_dir: src
    run: mvn -B clean package -DskipTests

  - name: image-build
    working_dir: src
    run: docker build -t ${{ IMAGE }}:${{ TAG }} .

  - name: push
    credentials:
      - id: registry
        kind: username_password
    run: |
      echo "$REGISTRY_PSW" | docker login -u "$REGISTRY_USR" --password-stdin registry.example.com
      docker push ${{ IMAGE }}:${{ TAG }}

post:
  failure: echo "pipeline failed at $KEEL_FAILED_STAGE"
"#;

/// Write a starter pipeline into `dir`.
pub fn init(dir: &Path, force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let path = dir.join(STARTER_FILE);

    if path.exists() && !force {
        println!(
            "{} {} already exists (use --force to overwrite)",
            style("!").yellow(),
            STARTER_FILE
        );
        return Ok(path);
    }

    std::fs::write(&path, STARTER_PIPELINE)?;
    println!("{} Created {}", style("✓").green(), STARTER_FILE);
    Ok(path)
}

/// Validate a pipeline configuration.
pub fn validate(file: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let path = locate(file)?;
    let spec = keel_core::pipeline::PipelineSpec::load(&path)?;

    println!(
        "{} Pipeline \"{}\" is valid",
        style("✓").green(),
        spec.name()
    );
    println!("  Stages: {}", spec.len());

    for stage in spec.stages() {
        if stage.credentials.is_empty() {
            println!("    - {}", stage.name);
        } else {
            let ids: Vec<&str> = stage.credentials.iter().map(|c| c.id.as_str()).collect();
            println!(
                "    - {} {}",
                stage.name,
                style(format!("(credentials: {})", ids.join(", "))).dim()
            );
        }
    }

    Ok(())
}

/// Run a pipeline locally and map its outcome to the process exit code.
pub async fn run_pipeline(
    config: &CliConfig,
    file: Option<&Path>,
    options: RunOptions,
    json: bool,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let path = locate(file)?;
    let spec = executor::load_pipeline(&path, &options.variables)?;

    let cancel = CancellationToken::new();
    executor::cancel_on_ctrl_c(cancel.clone());

    let options = RunOptions {
        quiet: json,
        ..options
    };
    let report = executor::execute_pipeline(&spec, config, &options, cancel).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        executor::print_summary(&report);
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Print the JSON Schema of the pipeline file format.
pub fn schema() -> Result<(), Box<dyn std::error::Error>> {
    let schema = keel_core::pipeline::pipeline_schema();
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Show configuration.
pub fn show_config(config: &CliConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", style("Configuration").bold());
    println!("  Path: {}", CliConfig::config_path()?.display());
    println!("  Default timeout: {}s", config.default_timeout_seconds);
    println!("  Shell: {}", config.shell);
    println!("  Credential prefix: {}", config.env_prefix);
    println!(
        "  Secrets file: {}",
        config
            .secrets_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none)".to_string())
    );
    println!(
        "  Workspace: {}",
        config
            .workspace
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(current directory)".to_string())
    );
    Ok(())
}

/// Set configuration value.
pub fn set_config(key: &str, value: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = CliConfig::load()?;
    config.set(key, value)?;
    config.save()?;
    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}

fn locate(file: Option<&Path>) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let cwd = std::env::current_dir()?;
    executor::find_pipeline_file(file, &cwd).ok_or_else(|| match file {
        Some(p) => format!("Pipeline file not found: {}", p.display()).into(),
        None => format!(
            "No pipeline file found (looked for {})",
            executor::PIPELINE_CANDIDATES.join(", ")
        )
        .into(),
    })
}
