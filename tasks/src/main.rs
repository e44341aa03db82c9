use std::{
    collections::HashSet,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tasks::core::Task;
use tasks::format::format_task_groups;
use tasks::group::{GroupingProperty, names_for_task};
use tasks::query::parse_grouping_instructions;
use tasks::storage::{JsonTaskSource, TaskSource};
use tasks::tree::TaskGroups;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "tasks",
    about = "Group task snapshots by their properties",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Group tasks and print one section per group.
    Group(GroupArgs),

    /// Print the group keys each task gets for a single property.
    Names(NamesArgs),
}

#[derive(Debug, Args)]
struct GroupArgs {
    /// JSON task files, or directories containing them.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Property to group by; repeat to nest (outermost first).
    #[arg(long = "by", value_name = "PROPERTY")]
    by: Vec<GroupingProperty>,
    /// File with `group by <property>` lines, applied before any --by values.
    #[arg(long)]
    query: Option<PathBuf>,
    /// Emit JSON instead of Markdown.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct NamesArgs {
    /// JSON task files, or directories containing them.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Property whose keys to print.
    #[arg(long)]
    property: GroupingProperty,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let mut stdout = io::stdout().lock();
    match cli.command {
        Commands::Group(args) => handle_group(args, &mut stdout),
        Commands::Names(args) => handle_names(args, &mut stdout),
    }
}

fn handle_group(args: GroupArgs, out: &mut impl Write) -> Result<()> {
    let GroupArgs {
        inputs,
        by,
        query,
        json,
    } = args;

    let dimensions = resolve_dimensions(query.as_deref(), &by)?;
    let tasks = load_tasks(&inputs)?;
    let groups = TaskGroups::by(&dimensions, &tasks);

    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&groups)?)?;
    } else {
        write!(out, "{}", format_task_groups(&groups))?;
        eprintln!(
            "{} tasks in {} groups",
            groups.total_tasks_count(),
            groups.len()
        );
    }
    Ok(())
}

fn handle_names(args: NamesArgs, out: &mut impl Write) -> Result<()> {
    let NamesArgs {
        inputs,
        property,
        json,
    } = args;

    let tasks = load_tasks(&inputs)?;

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            description: &'a str,
            names: Vec<String>,
        }

        let payload: Vec<JsonOutput<'_>> = tasks
            .iter()
            .map(|task| JsonOutput {
                description: &task.description,
                names: names_for_task(property, task),
            })
            .collect();
        writeln!(out, "{}", serde_json::to_string_pretty(&payload)?)?;
    } else {
        for task in &tasks {
            writeln!(
                out,
                "{}: {}",
                task.description,
                names_for_task(property, task).join(", ")
            )?;
        }
    }
    Ok(())
}

/// Instructions from the query file come first, then the `--by` flags.
fn resolve_dimensions(query: Option<&Path>, by: &[GroupingProperty]) -> Result<Vec<GroupingProperty>> {
    let mut dimensions = match query {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading query {:?}", path))?;
            parse_grouping_instructions(&text)
                .with_context(|| format!("parsing query {:?}", path))?
        }
        None => Vec::new(),
    };
    dimensions.extend_from_slice(by);
    debug!(?dimensions, "resolved grouping dimensions");
    Ok(dimensions)
}

fn load_tasks(inputs: &[PathBuf]) -> Result<Vec<Task>> {
    let expanded = expand_inputs(inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no JSON task files found in the provided inputs");
    }

    let source = JsonTaskSource;
    let mut tasks = Vec::new();
    for path in expanded {
        let loaded = source
            .load(&path)
            .with_context(|| format!("loading tasks from {:?}", path))?;
        tasks.extend(loaded);
    }
    Ok(tasks)
}

fn is_json(path: &Path) -> bool {
    path.extension().map(|ext| ext == "json").unwrap_or(false)
}

/// Resolve files and directories into a de-duplicated, ordered list of JSON files.
/// Directory contents are visited in name order so grouping input order is stable.
fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!(path = ?canonical, "scanning directory");
            visit_dir(&canonical, &mut out, &mut visited)?;
        } else if meta.is_file() {
            if !is_json(&canonical) {
                anyhow::bail!("{:?} is not a .json file", canonical);
            }
            if visited.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    let mut entries = fs::read_dir(path)
        .with_context(|| format!("reading directory {:?}", path))?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            continue;
        }
        let entry_path = entry.path();
        if file_type.is_dir() {
            visit_dir(&entry_path, out, visited)?;
        } else if file_type.is_file() && is_json(&entry_path) {
            let canonical = fs::canonicalize(&entry_path)?;
            if visited.insert(canonical.clone()) {
                debug!(path = ?canonical, "found task file");
                out.push(canonical);
            }
        }
    }
    Ok(())
}
