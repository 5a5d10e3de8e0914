//! CLI subcommands: init, profile, schema, validate, preview, synth, author,
//! build, projects, rerun, run-script.

use crate::collaborator::{Collaborator, CommandCollaborator};
use crate::config::{RegridSettings, SETTINGS_FILE};
use crate::core::codegen::{PlanSynthesizer, SynthesisContext, Synthesizer};
use crate::core::compare::ValidationReport;
use crate::core::interpreter::interpret;
use crate::core::parser::{compile_plan, parse_plan_file, plan_schema, plan_to_yaml, ACTION_PARAMS};
use crate::core::profile::{profile_file, FileProfile};
use crate::core::project::ProjectStore;
use crate::core::rerun::{expand_inputs, rerun, RerunSummary};
use crate::core::script::{parse_ops, run_script};
use crate::core::sheet_io::{read_sheet, write_table};
use crate::core::types::CompiledPlan;
use crate::core::workflow::{Decision, Session, WorkflowLimits};
use crate::error::RegridError;
use crate::provenance::eventlog::read_events;
use crate::provenance::hasher::short;
use crate::sandbox::Executor;
use anyhow::{bail, Context};
use clap::Subcommand;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Rows printed in previews.
const PREVIEW_ROWS: usize = 10;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default regrid.toml and create the projects directory
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Profile a spreadsheet: header row, columns, samples, notes
    Profile {
        file: PathBuf,

        /// Sheet to profile (default: first)
        #[arg(long)]
        sheet: Option<String>,

        /// Print the profile as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the plan JSON schema and the parameters of every action
    Schema {
        /// Only list actions and their parameters
        #[arg(long)]
        actions: bool,
    },

    /// Validate a plan file; with --input, column references too
    Validate {
        plan: PathBuf,

        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Run a plan in-process and show the result
    Preview {
        plan: PathBuf,
        input: PathBuf,

        /// Rows to show
        #[arg(short = 'n', long, default_value_t = PREVIEW_ROWS)]
        rows: usize,

        /// Also write the result (xlsx, or csv by extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Synthesize transform.sh from a plan without running it
    Synth {
        plan: PathBuf,

        #[arg(short, long, default_value = "transform.sh")]
        output: PathBuf,

        /// Input used to show custom steps their sample rows
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Ask the collaborator for a plan, or for a revision of one
    Author {
        input: PathBuf,

        /// What the normalized output should look like (with --revise: what to change)
        #[arg(short = 'm', long)]
        instructions: String,

        /// Existing plan to revise
        #[arg(long, value_name = "PLAN")]
        revise: Option<PathBuf>,

        /// Example of the desired output, shown to the collaborator
        #[arg(long, value_name = "FILE")]
        expected: Option<PathBuf>,

        #[arg(short, long, default_value = "transform_plan.yaml")]
        output: PathBuf,
    },

    /// Synthesize, execute and validate a plan against an input file
    Build {
        input: PathBuf,

        /// Plan file; without it the collaborator writes one from --instructions
        #[arg(short, long)]
        plan: Option<PathBuf>,

        #[arg(short = 'm', long)]
        instructions: Option<String>,

        /// Example of the desired output; every script output is compared with it
        #[arg(long, value_name = "FILE")]
        expected: Option<PathBuf>,

        /// Approve the validated result and save it as this project
        #[arg(long, value_name = "PROJECT")]
        approve: Option<String>,

        /// Execution timeout (e.g. "30s", "2m")
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        timeout: Option<Duration>,

        #[arg(long)]
        retry_budget: Option<u32>,
    },

    /// List saved projects, or show one project's event log
    Projects {
        /// Show the event log of this project
        #[arg(long, value_name = "PROJECT")]
        events: Option<String>,
    },

    /// Run a saved project's script on new files (globs allowed)
    Rerun {
        project: String,

        #[arg(required = true)]
        files: Vec<String>,

        /// Files processed concurrently
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Write outputs here instead of the project directory
        #[arg(long)]
        output_dir: Option<PathBuf>,

        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        timeout: Option<Duration>,
    },

    /// Script runtime: apply operations from stdin to <input>, write <output>
    #[command(hide = true)]
    RunScript { input: PathBuf, output: PathBuf },
}

/// Global options shared by every subcommand.
#[derive(Debug, Clone)]
pub struct GlobalOpts {
    pub config: PathBuf,
    pub projects_root: Option<PathBuf>,
}

impl Default for GlobalOpts {
    fn default() -> Self {
        Self {
            config: PathBuf::from(SETTINGS_FILE),
            projects_root: None,
        }
    }
}

fn load_settings(opts: &GlobalOpts) -> anyhow::Result<RegridSettings> {
    let mut settings = RegridSettings::load(&opts.config).map_err(anyhow::Error::msg)?;
    if let Some(root) = &opts.projects_root {
        settings.projects_root.clone_from(root);
    }
    Ok(settings)
}

fn collaborator(settings: &RegridSettings) -> Option<Arc<dyn Collaborator>> {
    settings.collaborator.as_ref().map(|c| {
        let mut collab = CommandCollaborator::new(c.command.clone(), c.args.clone(), c.timeout);
        collab.pass_env.clone_from(&c.pass_env);
        Arc::new(collab) as Arc<dyn Collaborator>
    })
}

fn executor(settings: &RegridSettings) -> Executor {
    Executor::new(settings.execution_timeout, settings.runtime_bin.clone())
}

/// Dispatch a CLI command.
pub async fn dispatch(cmd: Commands, opts: &GlobalOpts) -> anyhow::Result<()> {
    if let Commands::RunScript { input, output } = &cmd {
        return cmd_run_script(input, output);
    }
    let settings = load_settings(opts)?;
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Profile { file, sheet, json } => {
            cmd_profile(&settings, &file, sheet.as_deref(), json)
        }
        Commands::Schema { actions } => {
            cmd_schema(actions);
            Ok(())
        }
        Commands::Validate { plan, input } => cmd_validate(&settings, &plan, input.as_deref()),
        Commands::Preview {
            plan,
            input,
            rows,
            output,
        } => cmd_preview(&settings, &plan, &input, rows, output.as_deref()),
        Commands::Synth {
            plan,
            output,
            input,
        } => cmd_synth(&settings, &plan, &output, input.as_deref()).await,
        Commands::Author {
            input,
            instructions,
            revise,
            expected,
            output,
        } => {
            cmd_author(
                &settings,
                &input,
                &instructions,
                revise.as_deref(),
                expected.as_deref(),
                &output,
            )
            .await
        }
        Commands::Build {
            input,
            plan,
            instructions,
            expected,
            approve,
            timeout,
            retry_budget,
        } => {
            let mut settings = settings;
            if let Some(t) = timeout {
                settings.execution_timeout = t;
            }
            if let Some(b) = retry_budget {
                settings.retry_budget = b;
            }
            settings.validate().map_err(anyhow::Error::msg)?;
            cmd_build(
                &settings,
                &input,
                plan.as_deref(),
                instructions.as_deref(),
                expected.as_deref(),
                approve.as_deref(),
            )
            .await
        }
        Commands::Projects { events } => cmd_projects(&settings, events.as_deref()),
        Commands::Rerun {
            project,
            files,
            jobs,
            output_dir,
            timeout,
        } => {
            let mut settings = settings;
            if let Some(j) = jobs {
                settings.rerun_jobs = j;
            }
            if let Some(t) = timeout {
                settings.execution_timeout = t;
            }
            settings.validate().map_err(anyhow::Error::msg)?;
            cmd_rerun(&settings, &project, &files, output_dir.as_deref()).await
        }
        Commands::RunScript { .. } => Ok(()),
    }
}

fn cmd_init(path: &Path) -> anyhow::Result<()> {
    let config_path = path.join(SETTINGS_FILE);
    if config_path.exists() {
        bail!("{} already exists", config_path.display());
    }
    let settings = RegridSettings::default();
    let projects = path.join(&settings.projects_root);
    std::fs::create_dir_all(&projects)
        .with_context(|| format!("cannot create {}", projects.display()))?;
    let mut text = String::from("# regrid settings; every field is optional\n");
    text.push_str(&settings.to_toml().map_err(anyhow::Error::msg)?);
    text.push_str(
        "\n# [collaborator]\n# command = \"plan-author\"\n# args = []\n# timeout = \"5m\"\n# pass_env = []\n",
    );
    std::fs::write(&config_path, text)
        .with_context(|| format!("cannot write {}", config_path.display()))?;

    println!("Initialized regrid at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}/", projects.display());
    Ok(())
}

fn cmd_profile(
    settings: &RegridSettings,
    file: &Path,
    sheet: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let profile = profile_file(file, sheet, &settings.profile_limits())?;
    if json {
        println!("{}", serde_json::to_string_pretty(&profile)?);
    } else {
        println!("{}", profile.summary());
    }
    Ok(())
}

fn cmd_schema(actions_only: bool) {
    if !actions_only {
        println!("{}", plan_schema());
        println!();
    }
    println!("Actions:");
    for (action, params) in ACTION_PARAMS {
        println!("  {:<22} {}", action, params);
    }
}

fn load_profile(settings: &RegridSettings, input: Option<&Path>) -> anyhow::Result<Option<FileProfile>> {
    input
        .map(|p| profile_file(p, None, &settings.profile_limits()))
        .transpose()
        .map_err(Into::into)
}

fn compile(plan_path: &Path, profile: Option<&FileProfile>) -> anyhow::Result<CompiledPlan> {
    let plan = parse_plan_file(plan_path).map_err(anyhow::Error::msg)?;
    compile_plan(&plan, profile).map_err(|issues| RegridError::PlanSchema(issues).into())
}

fn cmd_validate(settings: &RegridSettings, plan_path: &Path, input: Option<&Path>) -> anyhow::Result<()> {
    let profile = load_profile(settings, input)?;
    let plan = compile(plan_path, profile.as_ref())?;
    let custom = plan.custom_steps();
    println!(
        "OK: {} ({} steps{})",
        plan_path.display(),
        plan.steps.len(),
        if custom.is_empty() {
            String::new()
        } else {
            format!(", custom: {:?}", custom)
        }
    );
    if profile.is_some() {
        println!("  column references checked against {}", input.map(|p| p.display().to_string()).unwrap_or_default());
    }
    Ok(())
}

fn cmd_preview(
    settings: &RegridSettings,
    plan_path: &Path,
    input: &Path,
    rows: usize,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let profile = load_profile(settings, Some(input))?;
    let plan = compile(plan_path, profile.as_ref())?;
    let raw = read_sheet(input, None).map_err(RegridError::Profile)?.table;
    let result = interpret(&plan, raw)?;
    for t in &result.trace {
        println!("  {:>2}. {:<22} {} rows × {} columns", t.step, t.action, t.rows, t.columns);
    }
    if let Some(step) = result.halted_at {
        println!("  halted at custom step {}; showing the result before it", step);
    }
    println!();
    println!("{}", result.table.render(rows));
    println!("({} rows)", result.table.len());
    if let Some(out) = output {
        write_table(out, &result.table).map_err(anyhow::Error::msg)?;
        println!("Wrote {}", out.display());
    }
    Ok(())
}

async fn cmd_synth(
    settings: &RegridSettings,
    plan_path: &Path,
    output: &Path,
    input: Option<&Path>,
) -> anyhow::Result<()> {
    let plan = compile(plan_path, None)?;
    let raw = match input {
        Some(p) => Some(read_sheet(p, None).map_err(RegridError::Profile)?.table),
        None => None,
    };
    let synth = PlanSynthesizer::new(collaborator(settings));
    let ctx = SynthesisContext {
        input: raw.as_ref(),
        feedback: &[],
    };
    let script = synth.synthesize(&plan, &ctx).await?;
    std::fs::write(output, &script.text)
        .with_context(|| format!("cannot write {}", output.display()))?;
    println!(
        "Wrote {} ({} ops, {})",
        output.display(),
        script.lines.len(),
        short(&script.identity)
    );
    Ok(())
}

fn session(settings: &RegridSettings) -> Session {
    let collab = collaborator(settings);
    Session::new(
        WorkflowLimits::from(settings),
        Arc::new(PlanSynthesizer::new(collab.clone())),
        executor(settings),
        collab,
    )
}

async fn cmd_author(
    settings: &RegridSettings,
    input: &Path,
    instructions: &str,
    revise: Option<&Path>,
    expected: Option<&Path>,
    output: &Path,
) -> anyhow::Result<()> {
    if settings.collaborator.is_none() {
        bail!("no collaborator configured (add a [collaborator] section to {})", SETTINGS_FILE);
    }
    let mut s = session(settings);
    s.analyze(input)?;
    if let Some(path) = expected {
        s.set_example(path)?;
    }
    let plan = match revise {
        Some(path) => {
            s.set_plan(parse_plan_file(path).map_err(anyhow::Error::msg)?)?;
            s.revise_plan(instructions).await?
        }
        None => s.request_plan(instructions).await?,
    };
    let yaml = plan_to_yaml(&plan.plan).map_err(anyhow::Error::msg)?;
    std::fs::write(output, yaml).with_context(|| format!("cannot write {}", output.display()))?;
    println!("Plan ({} steps):", plan.steps.len());
    print!("{}", plan);
    println!("Wrote {}", output.display());
    Ok(())
}

fn print_report(report: &ValidationReport) {
    println!("Validation: {}", report);
}

async fn cmd_build(
    settings: &RegridSettings,
    input: &Path,
    plan_path: Option<&Path>,
    instructions: Option<&str>,
    expected: Option<&Path>,
    approve: Option<&str>,
) -> anyhow::Result<()> {
    let mut s = session(settings);
    let profile = s.analyze(input)?;
    println!(
        "Profiled {} ({} rows × {} columns)",
        input.display(),
        profile.total_rows,
        profile.total_columns
    );
    if let Some(path) = expected {
        let example = s.set_example(path)?;
        println!(
            "Example output {} ({} rows × {} columns)",
            path.display(),
            example.total_rows.saturating_sub(1),
            example.total_columns
        );
    }

    match (plan_path, instructions) {
        (Some(path), _) => {
            let plan = parse_plan_file(path).map_err(anyhow::Error::msg)?;
            s.set_plan(plan)?;
        }
        (None, Some(text)) => {
            s.request_plan(text).await?;
        }
        (None, None) => bail!("either --plan or --instructions is required"),
    }
    if let Some(plan) = s.plan() {
        println!("Plan:");
        print!("{}", plan);
    }

    let generated = s.generate().await.cloned();
    for a in s.attempts() {
        match &a.error {
            None => println!("  attempt {}: ok ({})", a.number, short(&a.script_identity)),
            Some(e) => println!("  attempt {}: {}", a.number, e),
        }
    }
    let report = generated?;
    print_report(&report);
    if let Some(table) = s.execution().and_then(|e| e.table.as_ref()) {
        println!();
        println!("{}", table.render(PREVIEW_ROWS));
        println!("({} rows)", table.len());
    }

    match approve {
        Some(name) => {
            let store = ProjectStore::new(&settings.projects_root);
            let dir = s.decide(Decision::Approve { project: name.to_string() }, &store)?;
            if let Some(dir) = dir {
                println!("Approved: saved project '{}' at {}", name, dir.display());
            }
        }
        None => println!("Not saved; re-run with --approve <PROJECT> to keep this result."),
    }
    Ok(())
}

fn cmd_projects(settings: &RegridSettings, events: Option<&str>) -> anyhow::Result<()> {
    let store = ProjectStore::new(&settings.projects_root);
    if let Some(name) = events {
        let dir = store.project_dir(name);
        if !dir.is_dir() {
            bail!("project '{}' not found under {}", name, store.root().display());
        }
        for e in read_events(&dir).map_err(anyhow::Error::msg)? {
            println!("{}", serde_json::to_string(&e)?);
        }
        return Ok(());
    }
    let manifests = store.list()?;
    if manifests.is_empty() {
        println!("No projects under {}", store.root().display());
        return Ok(());
    }
    for m in manifests {
        println!(
            "{:<24} {:<8} {:>6} rows  script {}  {}",
            m.name,
            m.coverage,
            m.output_rows,
            short(&m.script_hash),
            m.created_at
        );
    }
    Ok(())
}

fn print_rerun(summary: &RerunSummary) {
    for f in &summary.files {
        match (&f.output_path, &f.error) {
            (Some(out), None) => {
                println!(
                    "  ok      {} → {} ({} rows, {:.2}s)",
                    f.input.display(),
                    out.display(),
                    f.rows,
                    f.elapsed.as_secs_f64()
                );
                for row in f.preview.iter().take(3) {
                    println!("          {}", row.join(" | "));
                }
            }
            _ => println!(
                "  {:<7} {}: {}",
                f.status.as_str(),
                f.input.display(),
                f.error.as_deref().unwrap_or("")
            ),
        }
    }
    println!(
        "Re-run {}: {} succeeded, {} failed ({:.2}s)",
        summary.run_id,
        summary.succeeded(),
        summary.failed(),
        summary.elapsed.as_secs_f64()
    );
}

async fn cmd_rerun(
    settings: &RegridSettings,
    project: &str,
    patterns: &[String],
    output_dir: Option<&Path>,
) -> anyhow::Result<()> {
    let files = expand_inputs(patterns).map_err(anyhow::Error::msg)?;
    let store = ProjectStore::new(&settings.projects_root);
    let summary = rerun(
        &store,
        project,
        &files,
        &executor(settings),
        settings.rerun_jobs,
        output_dir,
    )
    .await?;
    print_rerun(&summary);
    if summary.failed() > 0 {
        bail!("{} of {} file(s) failed", summary.failed(), summary.files.len());
    }
    Ok(())
}

fn cmd_run_script(input: &Path, output: &Path) -> anyhow::Result<()> {
    let mut body = String::new();
    std::io::stdin()
        .read_to_string(&mut body)
        .context("cannot read operations from stdin")?;
    let lines = parse_ops(&body).map_err(anyhow::Error::msg)?;
    let table = run_script(&lines, input, output).map_err(anyhow::Error::msg)?;
    tracing::info!(rows = table.len(), columns = table.width(), output = %output.display(), "script applied");
    Ok(())
}
