//! rankpipe command-line front end.
//!
//! Parses arguments into an [`Invocation`] and runs it through the kernel:
//! - `run`: one program
//! - `pipe`: a chain of whitespace-split stages
//! - `args`: print the launcher command line for a JSON rank-group job
//! - `mpi`: run a JSON rank-group job through a launcher
//!
//! Ctrl-C shuts down the process-wide registry: every child gets SIGTERM,
//! no new child is started, stragglers get SIGKILL after a second, and the
//! command exits 130 once the children are reaped. A second Ctrl-C exits
//! immediately.

pub mod format;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::runtime::Runtime;

use rankpipe_kernel::{
    Chain, Command, Error as KernelError, Launcher, ManageConfig, Pipeline, PipelineOptions,
    ProcessRegistry, ProgramDescription, RankGroup, Signal,
};

use crate::format::{Report, exit_code, render_args};

/// Exit code after an interrupt, as a shell reports SIGINT.
pub const EXIT_INTERRUPTED: u8 = 130;

/// Options shared by the subcommands that run processes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Force-close grace period; `RANKPIPE_FORCE_CLOSE_MS` or the default otherwise.
    pub grace: Option<Duration>,
    /// Print a JSON report (stdout, stderr, status) instead of raw output.
    pub json: bool,
}

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Help,
    Version,
    Run {
        argv: Vec<String>,
        opts: RunOptions,
    },
    Pipe {
        stages: Vec<Vec<String>>,
        opts: RunOptions,
    },
    Args {
        job: PathBuf,
        launcher: String,
        expand: bool,
        shell: bool,
        json: bool,
    },
    Mpi {
        job: PathBuf,
        launcher: String,
        opts: RunOptions,
    },
}

fn parse_grace(value: Option<&String>) -> Result<Duration> {
    let raw = value.context("--grace-ms requires a value")?;
    let ms: u64 = raw
        .parse()
        .with_context(|| format!("--grace-ms: not a number of milliseconds: {raw}"))?;
    Ok(Duration::from_millis(ms))
}

/// Parse the arguments after the program name.
pub fn parse_args(args: &[String]) -> Result<Invocation> {
    let Some(sub) = args.first() else {
        return Ok(Invocation::Help);
    };
    let rest = &args[1..];

    match sub.as_str() {
        "-h" | "--help" | "help" => Ok(Invocation::Help),
        "-V" | "--version" => Ok(Invocation::Version),
        "run" | "pipe" | "mpi" => {
            let mut opts = RunOptions::default();
            let mut launcher = "mpiexec".to_string();
            let mut positional = Vec::new();
            let mut iter = rest.iter();
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--" => {
                        positional.extend(iter.by_ref().cloned());
                        break;
                    }
                    "--grace-ms" => opts.grace = Some(parse_grace(iter.next())?),
                    "--json" => opts.json = true,
                    "--launcher" if sub == "mpi" => {
                        launcher = iter.next().context("--launcher requires a program")?.clone();
                    }
                    flag if flag.starts_with('-') && positional.is_empty() => {
                        bail!("{sub}: unknown option: {flag}")
                    }
                    _ => {
                        // First positional ends option parsing for `run`.
                        positional.push(arg.clone());
                        if sub == "run" {
                            positional.extend(iter.by_ref().cloned());
                            break;
                        }
                    }
                }
            }
            match sub.as_str() {
                "run" => {
                    if positional.is_empty() {
                        bail!("run: missing program");
                    }
                    Ok(Invocation::Run {
                        argv: positional,
                        opts,
                    })
                }
                "pipe" => {
                    let stages: Vec<Vec<String>> = positional
                        .iter()
                        .map(|stage| stage.split_whitespace().map(str::to_string).collect())
                        .collect();
                    if stages.is_empty() || stages.iter().any(Vec::is_empty) {
                        bail!("pipe: every stage needs a program");
                    }
                    Ok(Invocation::Pipe { stages, opts })
                }
                _ => {
                    let [job] = positional.as_slice() else {
                        bail!("mpi: expected exactly one job file");
                    };
                    Ok(Invocation::Mpi {
                        job: PathBuf::from(job),
                        launcher,
                        opts,
                    })
                }
            }
        }
        "args" => {
            let mut launcher = "mpiexec".to_string();
            let (mut expand, mut shell, mut json) = (false, false, false);
            let mut job = None;
            let mut iter = rest.iter();
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--expand" => expand = true,
                    "--shell" => shell = true,
                    "--json" => json = true,
                    "--launcher" => {
                        launcher = iter.next().context("--launcher requires a program")?.clone();
                    }
                    flag if flag.starts_with('-') => bail!("args: unknown option: {flag}"),
                    path if job.is_none() => job = Some(PathBuf::from(path)),
                    extra => bail!("args: unexpected argument: {extra}"),
                }
            }
            Ok(Invocation::Args {
                job: job.context("args: missing job file")?,
                launcher,
                expand,
                shell,
                json,
            })
        }
        unknown => bail!("unknown command: {unknown} (try 'rankpipe --help')"),
    }
}

/// Read a serde-encoded rank group.
pub fn load_job(path: &Path) -> Result<RankGroup> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read job file: {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid job file: {}", path.display()))
}

/// Execute a parsed invocation, printing results to stdout.
pub fn execute(invocation: Invocation) -> Result<ExitCode> {
    match invocation {
        Invocation::Help => {
            print_help();
            Ok(ExitCode::SUCCESS)
        }
        Invocation::Version => {
            println!(
                "rankpipe {} ({}, {})",
                env!("CARGO_PKG_VERSION"),
                env!("RANKPIPE_GIT_HASH"),
                env!("RANKPIPE_BUILD_PROFILE")
            );
            Ok(ExitCode::SUCCESS)
        }
        Invocation::Run { argv, opts } => {
            let command = Command::from_argv(argv)?;
            run_program(&command, &opts)
        }
        Invocation::Pipe { stages, opts } => {
            let mut chain = Chain::new();
            for stage in stages {
                chain = chain.then(Command::from_argv(stage)?);
            }
            run_program(&chain, &opts)
        }
        Invocation::Args {
            job,
            launcher,
            expand,
            shell,
            json,
        } => {
            let group = load_job(&job)?;
            let launcher = Launcher::mpiexec_style(launcher).expand(expand).to_shell(shell);
            let args = launcher.arg_list(&group)?;
            println!("{}", render_args(&args, json)?);
            Ok(ExitCode::SUCCESS)
        }
        Invocation::Mpi { job, launcher, opts } => {
            let group = load_job(&job)?;
            tracing::debug!(nranks = group.nranks(), ngroups = group.ngroups(), "loaded job");
            let launcher = Launcher::mpiexec_style(launcher);
            run_program(&launcher.bind(&group), &opts)
        }
    }
}

/// Run `program` to completion with Ctrl-C wired to the process registry.
///
/// The first Ctrl-C shuts the registry down, which makes the driver loop
/// SIGKILL stragglers after the kill grace and return. A second Ctrl-C kills
/// everything and exits on the spot.
fn run_program(program: &dyn ProgramDescription, opts: &RunOptions) -> Result<ExitCode> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let runtime = Runtime::new().context("failed to create tokio runtime")?;
    {
        let interrupted = interrupted.clone();
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            interrupted.store(true, Ordering::SeqCst);
            let signalled = ProcessRegistry::global().shutdown();
            tracing::info!(signalled, "interrupted; terminating children");

            if tokio::signal::ctrl_c().await.is_ok() {
                let killed = ProcessRegistry::global().kill_all(Signal::SIGKILL);
                tracing::warn!(killed, "interrupted again; exiting");
                std::process::exit(i32::from(EXIT_INTERRUPTED));
            }
        });
    }

    let mut config = ManageConfig::from_env();
    if let Some(grace) = opts.grace {
        config = config.with_force_close_after(grace);
    }
    let options = PipelineOptions::new().config(config).capture_stderr(opts.json);

    let mut pipeline = match Pipeline::with_options(program, options) {
        Ok(pipeline) => pipeline,
        Err(KernelError::NoMoreProcesses) => return Ok(ExitCode::from(EXIT_INTERRUPTED)),
        Err(e) => return Err(e).context("failed to launch"),
    };
    let captured = match pipeline.communicate() {
        Ok(captured) => captured.clone(),
        Err(KernelError::NoMoreProcesses) => return Ok(ExitCode::from(EXIT_INTERRUPTED)),
        Err(e) => return Err(e).context("pipeline failed"),
    };
    let status = pipeline.status();

    if interrupted.load(Ordering::SeqCst) {
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }

    if opts.json {
        println!("{}", Report::new(&captured, status).to_json()?);
    } else if let Some(out) = &captured.out {
        print!("{out}");
    }
    Ok(exit_code(status))
}

fn print_help() {
    println!(
        r#"rankpipe v{}

Usage:
  rankpipe run [OPTIONS] [--] PROGRAM [ARGS...]   Run one program
  rankpipe pipe [OPTIONS] 'STAGE' 'STAGE'...      Run stages chained stdout → stdin
  rankpipe args [ARGS OPTIONS] JOB.json           Print the launcher command line
  rankpipe mpi [OPTIONS] [--launcher PROG] JOB.json
                                                  Run a rank-group job

Options:
  --grace-ms <ms>        Force-close streams this long after the last child exits
                         (default: $RANKPIPE_FORCE_CLOSE_MS or 2000)
  --json                 Print {{out, err, code, status}} as JSON
  -h, --help             Show this help
  -V, --version          Show version

Args Options:
  --launcher <prog>      Launcher program (default: mpiexec)
  --expand               One segment per rank instead of per group
  --shell                Render each group as one shell-quoted command
  --json                 Print the argument list as a JSON array

Job files hold a serialized rank group, e.g.
  {{"mpmd": [{{"spmd": {{"rank": {{"args": ["a.out"]}}, "count": 3}}}},
             {{"rank": {{"args": ["b.out"], "threads": 2}}}}]}}

Examples:
  rankpipe run -- ls -l
  rankpipe pipe 'printf b\na\n' sort
  rankpipe args job.json          # mpiexec -n 3 a.out : -n 1 env OMP_NUM_THREADS=2 b.out
"#,
        env!("CARGO_PKG_VERSION")
    );
}
