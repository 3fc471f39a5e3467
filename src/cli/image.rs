//! `shipline image` - Local image operations
//!
//! Thin synchronous wrappers around the docker CLI for building, pushing,
//! listing, pruning and running the service image under the release tag plan.

use anyhow::{Context, Result, bail};
use chrono::{SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use shipline::infrastructure::PipelineConfig;
use shipline::pipeline::{ImageName, TagPlan};

/// Settings shared by every image subcommand
#[derive(Debug, Clone)]
pub struct ImageOptions {
    /// Docker-compatible CLI
    pub binary: String,
    /// Image name
    pub image: ImageName,
}

impl ImageOptions {
    /// Resolves the image owner from the environment
    pub fn from_env(config: &PipelineConfig, binary: &str) -> Result<Self> {
        let credentials = &config.credentials;
        let owner = [&credentials.owner_var, &credentials.username_var]
            .into_iter()
            .find_map(|name| std::env::var(name).ok().filter(|v| !v.trim().is_empty()))
            .with_context(|| {
                format!(
                    "{} or {} must be set",
                    credentials.owner_var, credentials.username_var
                )
            })?;

        Ok(Self {
            binary: binary.to_string(),
            image: ImageName::new(owner, &config.registry.repository),
        })
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }
}

/// Inputs of a release build
#[derive(Debug, Clone)]
pub struct ReleaseBuild {
    /// Release version, with or without a leading `v`
    pub version: String,
    /// Team tag
    pub team: String,
    /// Author recorded in the image
    pub author: String,
    /// Short source revision
    pub revision: String,
    /// Build context directory
    pub context: PathBuf,
}

/// Build arguments recorded in a release image
#[must_use]
pub fn release_build_args(
    build: &ReleaseBuild,
    image: &ImageName,
    now: chrono::DateTime<Utc>,
) -> Vec<(String, String)> {
    vec![
        ("SOURCE_DATE_EPOCH".to_string(), now.timestamp().to_string()),
        (
            "BUILD_DATE".to_string(),
            now.to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
        ("AUTHOR".to_string(), build.author.clone()),
        ("VERSION".to_string(), build.version.clone()),
        ("GIT_SHA_SHORT".to_string(), build.revision.clone()),
        ("TEAM".to_string(), build.team.clone()),
        ("IMAGE_NAME".to_string(), image.to_string()),
    ]
}

/// Arguments of the `docker build` invocation
#[must_use]
pub fn build_arguments(plan: &TagPlan, args: &[(String, String)], context: &Path) -> Vec<String> {
    let mut argv = vec!["build".to_string()];
    for reference in plan.references() {
        argv.push("-t".to_string());
        argv.push(reference);
    }
    for (key, value) in args {
        argv.push("--build-arg".to_string());
        argv.push(format!("{key}={value}"));
    }
    argv.push(context.display().to_string());
    argv
}

/// One local image id and the tags pointing at it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageGroup {
    /// Short image id
    pub id: String,
    /// Tags, sorted
    pub tags: Vec<String>,
    /// Creation time as reported by the CLI
    pub created: String,
}

/// Groups `docker images` lines of the form `<repo>:<tag> <id> <created...>`
#[must_use]
pub fn parse_image_listing(output: &str, image: &ImageName) -> Vec<ImageGroup> {
    let prefix = format!("{image}:");
    let mut groups: BTreeMap<String, ImageGroup> = BTreeMap::new();

    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let (Some(reference), Some(id)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Some(tag) = reference.strip_prefix(&prefix) else {
            continue;
        };
        let id: String = id.chars().take(12).collect();
        let created = fields.collect::<Vec<_>>().join(" ");

        let group = groups.entry(id.clone()).or_insert_with(|| ImageGroup {
            id,
            tags: Vec::new(),
            created,
        });
        if !group.tags.iter().any(|t| t == tag) {
            group.tags.push(tag.to_string());
            group.tags.sort();
        }
    }
    groups.into_values().collect()
}

/// Image ids that no `keep` tag points at
#[must_use]
pub fn cleanup_targets(groups: &[ImageGroup], keep: &str) -> Vec<String> {
    groups
        .iter()
        .filter(|group| !group.tags.iter().any(|tag| tag == keep))
        .map(|group| group.id.clone())
        .collect()
}

/// Builds the release image under every release tag
pub fn build(options: &ImageOptions, release: &ReleaseBuild) -> Result<TagPlan> {
    let plan = TagPlan::release(
        options.image.clone(),
        &release.version,
        &release.revision,
        &release.team,
    );
    let args = release_build_args(release, &options.image, Utc::now());
    let argv = build_arguments(&plan, &args, &release.context);

    println!("$ {} {}", options.binary, shell_words::join(&argv));
    run_checked(options.command().args(&argv))?;
    Ok(plan)
}

/// Logs in with registry credentials on stdin and pushes every tag
pub fn push(options: &ImageOptions, registry: &str, username: &str, token: &str) -> Result<()> {
    let mut login = options
        .command()
        .args(["login", registry, "--username", username, "--password-stdin"])
        .stdin(Stdio::piped())
        .spawn()
        .context("Failed to start docker login")?;
    if let Some(mut stdin) = login.stdin.take() {
        stdin
            .write_all(token.as_bytes())
            .context("Failed to pass registry token")?;
    }
    if !login.wait().context("docker login did not finish")?.success() {
        bail!("Registry login failed; check the registry token");
    }

    println!("Pushing all tags for {}...", options.image);
    let image = options.image.to_string();
    run_checked(options.command().args(["push", "--all-tags", image.as_str()]))
    .with_context(|| {
        format!(
            "Push failed; make sure '{}' exists locally and you may push to it",
            options.image
        )
    })
}

/// Lists local images with their tags
pub fn list(options: &ImageOptions) -> Result<Vec<ImageGroup>> {
    let output = capture(options.command().args([
        "images",
        "--format",
        "{{.Repository}}:{{.Tag}} {{.ID}} {{.CreatedAt}}",
    ]))?;
    Ok(parse_image_listing(&output, &options.image))
}

/// Removes every local image not tagged `keep`
pub fn cleanup(options: &ImageOptions, keep: &str) -> Result<Vec<String>> {
    let targets = cleanup_targets(&list(options)?, keep);
    if !targets.is_empty() {
        run_checked(options.command().arg("rmi").args(&targets))?;
    }
    Ok(targets)
}

/// Runs the service image in the foreground
pub fn run(options: &ImageOptions, tag: &str, port: u16, container_port: u16) -> Result<()> {
    let ports = format!("{port}:{container_port}");
    let reference = options.image.tagged(tag);
    run_checked(
        options
            .command()
            .args(["run", "--rm", "-p", ports.as_str(), reference.as_str()]),
    )
}

/// Stops containers started from the image
pub fn stop(options: &ImageOptions) -> Result<Vec<String>> {
    let filter = format!("ancestor={}", options.image);
    let output = capture(options.command().args(["ps", "--filter", filter.as_str(), "-q"]))?;
    let ids: Vec<String> = output
        .lines()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .collect();
    if !ids.is_empty() {
        run_checked(options.command().arg("stop").args(&ids))?;
    }
    Ok(ids)
}

/// Author from git, or "Unknown"
#[must_use]
pub fn git_author() -> String {
    Command::new("git")
        .args(["config", "--get", "user.name"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "Unknown".to_string())
}

fn run_checked(cmd: &mut Command) -> Result<()> {
    let status = cmd
        .status()
        .with_context(|| format!("Failed to run {:?}", cmd.get_program()))?;
    if !status.success() {
        bail!("{:?} exited with {status}", cmd.get_program());
    }
    Ok(())
}

fn capture(cmd: &mut Command) -> Result<String> {
    let output = cmd
        .output()
        .with_context(|| format!("Failed to run {:?}", cmd.get_program()))?;
    if !output.status.success() {
        bail!(
            "{:?} failed: {}",
            cmd.get_program(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn image() -> ImageName {
        ImageName::new("acme", "house-price-predictor-service")
    }

    fn release() -> ReleaseBuild {
        ReleaseBuild {
            version: "1.0.0".to_string(),
            team: "devops".to_string(),
            author: "Dana".to_string(),
            revision: "affb243".to_string(),
            context: PathBuf::from("."),
        }
    }

    #[test]
    fn test_release_build_args() {
        let now = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let args = release_build_args(&release(), &image(), now);
        let keys: Vec<&str> = args.iter().map(|(k, _)| k.as_str()).collect();

        assert_eq!(
            keys,
            vec![
                "SOURCE_DATE_EPOCH",
                "BUILD_DATE",
                "AUTHOR",
                "VERSION",
                "GIT_SHA_SHORT",
                "TEAM",
                "IMAGE_NAME"
            ]
        );
        assert_eq!(args[1].1, "2025-01-02T03:04:05Z");
        assert_eq!(args[6].1, "acme/house-price-predictor-service");
    }

    #[test]
    fn test_build_arguments_tag_every_release_tag() {
        let plan = TagPlan::release(image(), "1.0.0", "affb243", "devops");
        let args = [("TEAM".to_string(), "devops".to_string())];
        let argv = build_arguments(&plan, &args, Path::new("."));

        assert_eq!(
            argv,
            vec![
                "build",
                "-t",
                "acme/house-price-predictor-service:v1.0.0",
                "-t",
                "acme/house-price-predictor-service:affb243",
                "-t",
                "acme/house-price-predictor-service:latest",
                "-t",
                "acme/house-price-predictor-service:devops",
                "--build-arg",
                "TEAM=devops",
                "."
            ]
        );
    }

    #[test]
    fn test_parse_image_listing_groups_by_id() {
        let output = "\
acme/house-price-predictor-service:affb243 47135ea4c4e4 2025-01-02 03:04:05 +0000 UTC
acme/house-price-predictor-service:latest 47135ea4c4e4 2025-01-02 03:04:05 +0000 UTC
acme/house-price-predictor-service:v0.9.0 0123456789ab 2024-12-01 00:00:00 +0000 UTC
other/image:latest ffffffffffff 2024-12-01 00:00:00 +0000 UTC
";
        let groups = parse_image_listing(output, &image());

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1].id, "47135ea4c4e4");
        assert_eq!(groups[1].tags, vec!["affb243", "latest"]);
        assert_eq!(groups[1].created, "2025-01-02 03:04:05 +0000 UTC");
        assert_eq!(cleanup_targets(&groups, "latest"), vec!["0123456789ab"]);
    }
}
