use std::fs::File;
use std::io::{self, BufWriter, Write as _};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use fsreplay_exec::kcov::{Coverage, KCOV_FILENAME};
use fsreplay_exec::{Executor, EXIT_FAIL, EXIT_OK};
use fsreplay_trace::TRACE_FILENAME;

mod workload;

pub const REPORT_SCHEMA_VERSION: &str = "fsreplay.report@0.2";

#[derive(Parser)]
#[command(name = "fsreplay")]
#[command(
    about = "Replays a fixed filesystem workload against a workspace and records a per-operation trace.",
    long_about = None
)]
struct Cli {
    /// Workspace directory the workload runs in.
    workspace: PathBuf,

    /// Where to write the operation trace.
    #[arg(long, default_value = TRACE_FILENAME)]
    trace_path: PathBuf,

    /// Where to write the kernel coverage dump.
    #[arg(long, default_value = KCOV_FILENAME)]
    kcov_path: PathBuf,
}

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();

    goal(format!("prepare workspace '{}'", cli.workspace.display()));
    prepare_workspace(&cli.workspace)?;

    goal("set up kcov");
    let mut coverage = Coverage::init()?;
    if coverage.is_enabled() {
        subgoal("done");
    }

    goal("init buffers");
    let mut exec = Executor::new(&cli.workspace);

    goal("test workload");
    // Collection brackets the workload alone; setup stays outside it.
    coverage.enable()?;
    workload::run(&mut exec);
    subgoal(format!("done ({} operations)", exec.trace().len()));

    let mut kcov_written = false;
    if coverage.is_enabled() {
        goal("disable coverage collection");
        coverage.disable()?;
        goal("dump kcov coverage");
        kcov_written = coverage.dump(&cli.kcov_path)?;
        subgoal(format!(
            "kcov dump saved at '{}' ({} addresses)",
            shown_path(&cli.kcov_path).display(),
            coverage.collected()
        ));
        goal("free kcov resources");
        coverage.release()?;
        subgoal("done");
    }

    goal("dump trace");
    dump_trace(&exec, &cli.trace_path)?;
    subgoal(format!(
        "trace dump saved at '{}'",
        shown_path(&cli.trace_path).display()
    ));

    goal("summary");
    println!(
        "#SUCCESS: {} | #FAILURE: {}",
        exec.success_count(),
        exec.failure_count()
    );
    let report = serde_json::json!({
        "schema_version": REPORT_SCHEMA_VERSION,
        "ok": exec.failure_count() == 0,
        "success_count": exec.success_count(),
        "failure_count": exec.failure_count(),
        "trace_path": cli.trace_path.display().to_string(),
        "kcov_path": kcov_written.then(|| cli.kcov_path.display().to_string()),
    });
    println!("{}", serde_json::to_string(&report)?);

    if exec.failure_count() > 0 {
        Ok(ExitCode::from(EXIT_FAIL as u8))
    } else {
        Ok(ExitCode::from(EXIT_OK as u8))
    }
}

fn prepare_workspace(workspace: &Path) -> Result<()> {
    subgoal(format!("mkdir '{}'", workspace.display()));
    match std::fs::create_dir(workspace) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            eprintln!("[WARNING] directory '{}' exists", workspace.display());
            Ok(())
        }
        Err(err) => {
            Err(err).with_context(|| format!("create workspace '{}'", workspace.display()))
        }
    }
}

fn dump_trace(exec: &Executor, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("open trace dump file '{}'", path.display()))?;
    let mut out = BufWriter::new(file);
    exec.trace()
        .write_csv(&mut out)
        .with_context(|| format!("write trace dump '{}'", path.display()))?;
    out.flush()
        .with_context(|| format!("flush trace dump '{}'", path.display()))?;
    Ok(())
}

fn shown_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn goal(msg: impl AsRef<str>) {
    println!(":: {}", msg.as_ref());
}

fn subgoal(msg: impl AsRef<str>) {
    println!("==> {}", msg.as_ref());
}
