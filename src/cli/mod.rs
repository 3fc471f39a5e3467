//! CLI for shipline
//!
//! - `run`: Execute the four-stage pipeline against a source checkout
//! - `plan`: Show what a run would do without touching a container
//! - `image`: Build, push, list, prune and run the service image locally
//! - `completions`: Generate shell completions

pub mod completions;
pub mod image;
pub mod plan;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use shipline::infrastructure::{PipelineConfig, init_logging};
use shipline::pipeline::{
    GitRevision, PipelineEngine, PipelineRun, RevisionSource, SecretVault, SourceTree,
    StaticRevision, lookup_short_revision,
};
use shipline::runtime::{ContainerRuntime, DockerRuntime};

/// CLI arguments for shipline
#[derive(Parser, Debug)]
#[command(name = "shipline")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Pipeline configuration file (YAML); defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overriding the configuration
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline against a source checkout
    Run {
        /// Source checkout
        #[arg(short, long, default_value = ".")]
        source: PathBuf,
        /// Write the run record as JSON
        #[arg(short, long)]
        report: Option<PathBuf>,
        /// Use this revision instead of asking git
        #[arg(long)]
        revision: Option<String>,
        /// Docker-compatible CLI to drive
        #[arg(long, default_value = "docker")]
        runtime_binary: String,
    },

    /// Show the stages, images, services and tags of a run
    Plan {
        /// Source checkout
        #[arg(short, long, default_value = ".")]
        source: PathBuf,
        /// Use this revision instead of asking git
        #[arg(long)]
        revision: Option<String>,
        /// Output format
        #[arg(short, long, value_enum, default_value_t = PlanFormat::Text)]
        format: PlanFormat,
    },

    /// Manage local service images
    Image {
        /// Docker-compatible CLI to drive
        #[arg(long, default_value = "docker", global = true)]
        runtime_binary: String,

        #[command(subcommand)]
        action: ImageAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: ShellArg,
        /// Output file (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum ImageAction {
    /// Build the image under the release tags
    Build {
        /// Release version
        #[arg(long, default_value = "1.0.0")]
        version: String,
        /// Team tag
        #[arg(long, default_value = "devops")]
        team: String,
        /// Author label (defaults to git user.name)
        #[arg(long)]
        author: Option<String>,
        /// Build context
        #[arg(long, default_value = ".")]
        context: PathBuf,
        /// Push every tag after building
        #[arg(long)]
        push: bool,
    },
    /// Push every local tag of the image
    Push,
    /// List local tags grouped by image id
    List,
    /// Remove local images not carrying the kept tag
    Cleanup {
        /// Tag to keep
        #[arg(long, default_value = "latest")]
        keep: String,
    },
    /// Run the image in the foreground
    Run {
        /// Tag to run
        #[arg(long, default_value = "latest")]
        tag: String,
        /// Host port
        #[arg(short, long, default_value_t = 9999)]
        port: u16,
    },
    /// Stop containers started from the image
    Stop,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum PlanFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ShellArg {
    Bash,
    Zsh,
    Fish,
    PowerShell,
}

/// Build the CLI command for completion generation
pub fn build_cli() -> clap::Command {
    Args::command()
}

/// Parse and execute CLI arguments
pub fn run() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    init_logging(&config.log_level);

    match args.command {
        Command::Run {
            source,
            report,
            revision,
            runtime_binary,
        } => run_pipeline(config, &source, report.as_deref(), revision, &runtime_binary)?,
        Command::Plan {
            source,
            revision,
            format,
        } => {
            let revision = block_on(async {
                let revisions = revision_source(revision);
                lookup_short_revision(revisions.as_ref(), &source).await
            })??;
            let owner = [&config.credentials.owner_var, &config.credentials.username_var]
                .into_iter()
                .find_map(|name| std::env::var(name).ok().filter(|v| !v.trim().is_empty()))
                .unwrap_or_else(|| "<owner>".to_string());
            let stages = shipline::pipeline::plan(&config, &owner, &revision);

            match format {
                PlanFormat::Text => print!("{}", plan::render_plan(&stages)),
                PlanFormat::Json => println!("{}", serde_json::to_string_pretty(&stages)?),
            }
        }
        Command::Image {
            runtime_binary,
            action,
        } => run_image(&config, &runtime_binary, action)?,
        Command::Completions { shell, output } => {
            use clap_complete::Shell;

            let shell_enum = match shell {
                ShellArg::Bash => Shell::Bash,
                ShellArg::Zsh => Shell::Zsh,
                ShellArg::Fish => Shell::Fish,
                ShellArg::PowerShell => Shell::PowerShell,
            };

            let completions = completions::generate_completions(shell_enum)?;

            if let Some(output_path) = output {
                completions::save_completions(&completions, &output_path)?;
            } else {
                println!("{completions}");
            }
        }
    }

    Ok(())
}

fn run_pipeline(
    config: PipelineConfig,
    source: &Path,
    report: Option<&Path>,
    revision: Option<String>,
    runtime_binary: &str,
) -> Result<()> {
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::with_binary(runtime_binary));
    let run = block_on(execute_pipeline(config, source, revision, runtime, |name| {
        std::env::var(name).ok()
    }))??;

    print!("{run}");
    if let Some(path) = report {
        std::fs::write(path, run.to_json()?)
            .with_context(|| format!("Failed to write report to: {}", path.display()))?;
    }

    match (&run.error, run.failed_stage()) {
        (Some(error), Some(stage)) => bail!("Stage {stage} failed: {error}"),
        (Some(error), None) => bail!("{error}"),
        _ => Ok(()),
    }
}

async fn execute_pipeline<F>(
    config: PipelineConfig,
    source: &Path,
    revision: Option<String>,
    runtime: Arc<dyn ContainerRuntime>,
    lookup: F,
) -> Result<PipelineRun>
where
    F: Fn(&str) -> Option<String>,
{
    // Credentials are checked before any container work
    let vault = SecretVault::load(&config.credentials, lookup)?;
    let source = SourceTree::open(source)?;

    if !runtime.is_available().await {
        bail!("Container runtime '{}' is not available", runtime.name());
    }
    let mut engine = PipelineEngine::new(config, runtime, vault)?;
    if let Some(revision) = revision {
        engine = engine.with_revision_source(StaticRevision(revision));
    }
    Ok(engine.run(&source).await?)
}

fn run_image(config: &PipelineConfig, binary: &str, action: ImageAction) -> Result<()> {
    let options = image::ImageOptions::from_env(config, binary)?;

    match action {
        ImageAction::Build {
            version,
            team,
            author,
            context,
            push,
        } => {
            let revision = block_on(lookup_short_revision(&GitRevision, &context))??;
            let release = image::ReleaseBuild {
                version,
                team,
                author: author.unwrap_or_else(image::git_author),
                revision: revision.to_string(),
                context,
            };
            let plan = image::build(&options, &release)?;
            println!("Built {}", plan.references().join(", "));
            if push {
                push_image(config, &options)?;
            }
        }
        ImageAction::Push => push_image(config, &options)?,
        ImageAction::List => {
            let groups = image::list(&options)?;
            if groups.is_empty() {
                println!("No local images for {}", options.image);
            }
            for group in groups {
                println!("{}  {:<30}  {}", group.id, group.tags.join(","), group.created);
            }
        }
        ImageAction::Cleanup { keep } => {
            let removed = image::cleanup(&options, &keep)?;
            println!("Removed {} image(s)", removed.len());
        }
        ImageAction::Run { tag, port } => {
            image::run(&options, &tag, port, config.service.port)?;
        }
        ImageAction::Stop => {
            let stopped = image::stop(&options)?;
            println!("Stopped {} container(s)", stopped.len());
        }
    }
    Ok(())
}

fn push_image(config: &PipelineConfig, options: &image::ImageOptions) -> Result<()> {
    let vault = SecretVault::from_env(&config.credentials)?;
    let token = vault.registry_token()?;
    image::push(
        options,
        &config.registry.host,
        vault.username(),
        token.expose_secret(),
    )
}

fn revision_source(revision: Option<String>) -> Box<dyn RevisionSource> {
    match revision {
        Some(revision) => Box::new(StaticRevision(revision)),
        None => Box::new(GitRevision),
    }
}

fn block_on<F: std::future::Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    Ok(runtime.block_on(future))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipline::pipeline::PipelineError;
    use shipline::runtime::FakeRuntime;

    #[test]
    fn test_cli_definition_is_consistent() {
        build_cli().debug_assert();
    }

    #[test]
    fn test_parse_run_arguments() {
        let args = Args::try_parse_from([
            "shipline",
            "run",
            "--source",
            "checkout",
            "--revision",
            "abc123456",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert_eq!(args.log_level.as_deref(), Some("debug"));
        match args.command {
            Command::Run {
                source, revision, ..
            } => {
                assert_eq!(source, PathBuf::from("checkout"));
                assert_eq!(revision.as_deref(), Some("abc123456"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    fn without_username(name: &str) -> Option<String> {
        (name == "DOCKERHUB_TOKEN").then(|| "dckr_pat_s3cret-token".to_string())
    }

    #[test]
    fn test_missing_username_fails_before_any_container_work() {
        let fake = FakeRuntime::new();
        fake.set_unavailable();
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(fake.clone());
        let dir = tempfile::tempdir().unwrap();

        let err = block_on(execute_pipeline(
            PipelineConfig::default(),
            dir.path(),
            Some("abc123456".to_string()),
            runtime,
            without_username,
        ))
        .unwrap()
        .unwrap_err();

        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::Configuration(message)) => {
                assert!(message.contains("DOCKERHUB_USERNAME"));
            }
            other => panic!("expected a configuration error, got {other:?}"),
        }
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn test_unavailable_runtime_stops_before_any_stage() {
        let fake = FakeRuntime::new();
        fake.set_unavailable();
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(fake.clone());
        let dir = tempfile::tempdir().unwrap();

        let err = block_on(execute_pipeline(
            PipelineConfig::default(),
            dir.path(),
            Some("abc123456".to_string()),
            runtime,
            |name| Some(format!("{name}-value")),
        ))
        .unwrap()
        .unwrap_err();

        assert!(err.to_string().contains("not available"));
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn test_parse_image_build_defaults() {
        let args = Args::try_parse_from(["shipline", "image", "build", "--push"]).unwrap();
        match args.command {
            Command::Image {
                action:
                    ImageAction::Build {
                        version,
                        team,
                        push,
                        ..
                    },
                ..
            } => {
                assert_eq!(version, "1.0.0");
                assert_eq!(team, "devops");
                assert!(push);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
