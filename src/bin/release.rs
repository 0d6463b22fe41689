//! Release tagging tool.
//!
//! Computes the next version from existing git tags and creates/pushes
//! one tag per module (`vX.Y.Z` for the root, `path/vX.Y.Z` for
//! sub-modules). With no version arguments it prints the current state.

use clap::{Parser, Subcommand};
use shardherd::release::{plan_release, Action, TagCache, Version, VersionType};
use std::io::{BufRead, Write};
use std::path::Path;
use std::process::Command;

#[derive(Parser)]
#[command(name = "release", about = "Tag a release across all modules")]
struct Args {
    /// Increment type: major, minor, or patch.
    #[arg(long = "type", value_name = "TYPE")]
    version_type: Option<String>,

    /// Use an explicit version instead of incrementing.
    #[arg(long = "set-version", value_name = "VERSION")]
    set_version: Option<String>,

    /// Produce the next prerelease of the target version.
    #[arg(long)]
    prerelease: bool,

    /// Create and push tags without asking for confirmation.
    #[arg(long)]
    yes: bool,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Print usage examples.
    Examples,
}

fn main() {
    let args = Args::parse();

    if let Some(CliCommand::Examples) = args.command {
        print_examples();
        return;
    }

    if let Err(e) = run(&args) {
        eprintln!("release failed: {e}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let repo_root = git_output(&["rev-parse", "--show-toplevel"])?;
    let repo_root = repo_root.trim();
    let raw_tags: Vec<String> = git_output(&["tag", "--list"])?
        .lines()
        .map(str::to_string)
        .filter(|line| !line.is_empty())
        .collect();

    let cache = TagCache::build(&raw_tags);
    let module_paths = find_module_paths(Path::new(repo_root))?;
    let modules = cache.resolve_modules(&module_paths);

    // No version arguments: report current state.
    if args.set_version.is_none() && args.version_type.is_none() && !args.prerelease {
        println!("current global version: {}", cache.current_global_version());
        for module in &modules {
            let name = if module.path.is_empty() {
                "root"
            } else {
                &module.path
            };
            println!("{name} - {}", module.version);
        }
        return Ok(());
    }

    let version_type = args
        .version_type
        .as_deref()
        .map(str::parse::<VersionType>)
        .transpose()?;
    let target: Version =
        cache.calculate_new_version(args.set_version.as_deref(), version_type, args.prerelease)?;

    cache.check_version_exists(&target, &modules)?;

    let actions = plan_release(&modules, &target);
    println!("planned release actions for {target}:");
    for action in &actions {
        match action {
            Action::CreateTag { tag } => println!("  git tag {tag}"),
            Action::PushTag { tag } => println!("  git push origin {tag}"),
        }
    }

    if !args.yes && !confirm("create and push tags?")? {
        println!("cancelled");
        return Ok(());
    }

    for action in &actions {
        if let Action::CreateTag { tag } = action {
            git_run(&["tag", tag])?;
            println!("created tag {tag}");
        }
    }
    for action in &actions {
        if let Action::PushTag { tag } = action {
            git_run(&["push", "origin", tag])?;
            println!("pushed tag {tag}");
        }
    }
    println!("release {target} completed");
    Ok(())
}

/// Every directory containing a Cargo.toml, relative to the repo root.
fn find_module_paths(root: &Path) -> std::io::Result<Vec<String>> {
    let mut paths = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if dir.file_name().map(|n| n == "target" || n == ".git").unwrap_or(false) {
            continue;
        }
        if dir.join("Cargo.toml").is_file() {
            let relative = dir
                .strip_prefix(root)
                .unwrap_or(&dir)
                .to_string_lossy()
                .to_string();
            paths.push(if relative.is_empty() {
                ".".to_string()
            } else {
                relative
            });
        }
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                stack.push(entry.path());
            }
        }
    }
    paths.sort();
    Ok(paths)
}

fn git_output(args: &[&str]) -> Result<String, Box<dyn std::error::Error>> {
    let output = Command::new("git").args(args).output()?;
    if !output.status.success() {
        return Err(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )
        .into());
    }
    Ok(String::from_utf8(output.stdout)?)
}

fn git_run(args: &[&str]) -> Result<(), Box<dyn std::error::Error>> {
    git_output(args).map(|_| ())
}

fn confirm(message: &str) -> std::io::Result<bool> {
    print!("{message} [y/N] ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

fn print_examples() {
    println!(
        "examples:\n\
         \x20 release                      show current versions\n\
         \x20 release --type patch         tag the next patch release\n\
         \x20 release --type minor --prerelease\n\
         \x20                              tag the next minor prerelease\n\
         \x20 release --set-version v1.4.0 tag an explicit version\n\
         \x20 release --prerelease         next prerelease of the current base"
    );
}
