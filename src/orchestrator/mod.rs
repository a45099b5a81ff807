use std::{
    fmt,
    path::PathBuf,
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::{DateTime, Local};
use serde::Serialize;
use subprocess::ExitStatus;

use crate::utils::external_prog::{CommandRunner, CommandSpec, Completion};

pub mod env;

use env::{Activation, EnvName, ManagedEnv};

/// The fixed sequence of steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    InstallEnv,
    Activate,
    InstallPackage,
    Search,
    Deactivate,
    RemoveEnv,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::InstallEnv => "install-env",
            StepKind::Activate => "activate",
            StepKind::InstallPackage => "install-package",
            StepKind::Search => "search",
            StepKind::Deactivate => "deactivate",
            StepKind::RemoveEnv => "remove-env",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Succeeded,
    Exited(u32),
    Signaled(u8),
    /// the program could not be started at all
    LaunchFailed(String),
    Failed(String),
    Interrupted,
    Skipped,
}

impl StepStatus {
    pub fn is_failure(&self) -> bool {
        !matches!(self, StepStatus::Succeeded | StepStatus::Skipped)
    }

    /// Process exit code this status maps to when it decides the run's outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            StepStatus::Succeeded | StepStatus::Skipped => 0,
            StepStatus::Exited(code) => (*code).clamp(1, 255) as i32,
            StepStatus::Signaled(sig) => 128 + *sig as i32,
            StepStatus::LaunchFailed(_) => 127,
            StepStatus::Failed(_) => 1,
            StepStatus::Interrupted => 130,
        }
    }
}

impl From<ExitStatus> for StepStatus {
    fn from(status: ExitStatus) -> Self {
        match status {
            ExitStatus::Exited(0) => StepStatus::Succeeded,
            ExitStatus::Exited(code) => StepStatus::Exited(code),
            ExitStatus::Signaled(sig) => StepStatus::Signaled(sig),
            ExitStatus::Other(x) => StepStatus::Failed(format!("abnormal exit status {}", x)),
            ExitStatus::Undetermined => StepStatus::Failed("undetermined exit status".to_string()),
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Exited(code) => write!(f, "exited with code {}", code),
            StepStatus::Signaled(sig) => write!(f, "killed by signal {}", sig),
            StepStatus::LaunchFailed(why) => write!(f, "failed to launch: {}", why),
            StepStatus::Failed(why) => write!(f, "failed: {}", why),
            StepStatus::Interrupted => write!(f, "interrupted"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Maps the result of running `cmd` onto a step status using the command's success predicate.
pub(crate) fn command_status(cmd: &CommandSpec, res: anyhow::Result<Completion>) -> StepStatus {
    match res {
        Ok(Completion::Interrupted) => StepStatus::Interrupted,
        Ok(Completion::Finished(st)) if cmd.is_success(&st) => StepStatus::Succeeded,
        Ok(Completion::Finished(ExitStatus::Exited(0))) => StepStatus::Exited(0),
        Ok(Completion::Finished(st)) => st.into(),
        Err(e) => StepStatus::LaunchFailed(format!("{:#}", e)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub step: StepKind,
    pub status: StepStatus,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub env_name: EnvName,
    pub started: DateTime<Local>,
    pub steps: Vec<StepRecord>,
}

impl RunReport {
    pub fn first_failure(&self) -> Option<&StepRecord> {
        self.steps.iter().find(|r| r.status.is_failure())
    }

    pub fn exit_code(&self, policy: ExitPolicy) -> i32 {
        match policy {
            ExitPolicy::AlwaysZero => 0,
            ExitPolicy::FirstFailure => self.first_failure().map_or(0, |r| r.status.exit_code()),
        }
    }
}

/// How the step outcomes are folded into the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExitPolicy {
    /// exit with the code of the first step that did not succeed
    FirstFailure,
    /// always exit with 0, whatever happened
    AlwaysZero,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub manager: String,
    pub shell: String,
    pub installer: PathBuf,
    pub project_dir: PathBuf,
    pub search_dir: PathBuf,
    pub search_script: String,
    pub search_args: Vec<String>,
    pub python: String,
    pub fail_fast: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            manager: "conda".to_string(),
            shell: "bash".to_string(),
            installer: PathBuf::from("scripts/install_deepchem_conda.sh"),
            project_dir: PathBuf::from("."),
            search_dir: PathBuf::from("examples/hyperparam_opt"),
            search_script: "tensor_graph_hyper_param_search.py".to_string(),
            search_args: vec![],
            python: "python".to_string(),
            fail_fast: false,
        }
    }
}

/// Collects step records and decides whether work steps still run.
struct Recorder {
    steps: Vec<StepRecord>,
    fail_fast: bool,
    halted: bool,
}

impl Recorder {
    fn new(fail_fast: bool) -> Self {
        Recorder {
            steps: vec![],
            fail_fast,
            halted: false,
        }
    }

    /// Runs a step that is skipped once the run has been halted.
    fn work(&mut self, step: StepKind, f: impl FnOnce() -> StepStatus) {
        if self.halted {
            info!("[{}] skipped", step);
            self.push(step, StepStatus::Skipped, Duration::ZERO);
            return;
        }

        let status = self.timed(step, f);
        if status == StepStatus::Interrupted {
            warn!("interrupted, skipping the remaining work and tearing down");
            self.halted = true;
        } else if self.fail_fast && status.is_failure() {
            warn!("--fail-fast is set, skipping the remaining work");
            self.halted = true;
        }
    }

    /// Runs a step unconditionally.
    fn teardown(&mut self, step: StepKind, f: impl FnOnce() -> StepStatus) {
        self.timed(step, f);
    }

    fn timed(&mut self, step: StepKind, f: impl FnOnce() -> StepStatus) -> StepStatus {
        info!("[{}] starting", step);
        let start = Instant::now();
        let status = f();
        let duration = start.elapsed();

        if status.is_failure() {
            warn!("[{}] {} after {:?}", step, status, duration);
        } else {
            info!("[{}] {} after {:?}", step, status, duration);
        }
        self.push(step, status.clone(), duration);
        status
    }

    fn push(&mut self, step: StepKind, status: StepStatus, duration: Duration) {
        self.steps.push(StepRecord {
            step,
            status,
            duration,
        });
    }
}

pub struct Orchestrator<R: CommandRunner> {
    config: RunConfig,
    runner: R,
}

impl<R: CommandRunner> Orchestrator<R> {
    pub fn new(config: RunConfig, runner: R) -> Self {
        Orchestrator { config, runner }
    }

    /// Provisions a freshly named environment, runs the search in it and removes it again.
    pub fn run(&mut self) -> anyhow::Result<RunReport> {
        let name = EnvName::generate().context("could not generate an environment name")?;
        Ok(self.run_with_name(name))
    }

    pub fn run_with_name(&mut self, name: EnvName) -> RunReport {
        let config = &self.config;
        let started = Local::now();
        info!("using environment {}", name);

        let mut env = ManagedEnv::new(&mut self.runner, &config.manager, name.clone());
        let mut rec = Recorder::new(config.fail_fast);
        let mut activation: Option<Activation> = None;

        rec.work(StepKind::InstallEnv, || {
            let cmd = CommandSpec::new(&config.shell)
                .arg(config.installer.to_string_lossy())
                .arg(name.as_str())
                .cwd(&config.project_dir);
            let res = env.runner().run(&cmd);
            command_status(&cmd, res)
        });

        rec.work(StepKind::Activate, || {
            let (status, act) = activate(env.runner(), &config.manager, &name);
            activation = act;
            status
        });

        let (python, overlay) = match &activation {
            Some(act) => (act.interpreter(&config.python), act.overlay()),
            None => (config.python.clone(), vec![]),
        };

        rec.work(StepKind::InstallPackage, || {
            let cmd = CommandSpec::new(&python)
                .args(["setup.py", "install"])
                .cwd(&config.project_dir)
                .envs(&overlay);
            let res = env.runner().run(&cmd);
            command_status(&cmd, res)
        });

        rec.work(StepKind::Search, || {
            let cmd = CommandSpec::new(&python)
                .arg(&config.search_script)
                .args(config.search_args.iter().cloned())
                .cwd(config.project_dir.join(&config.search_dir))
                .envs(&overlay);
            let res = env.runner().run(&cmd);
            command_status(&cmd, res)
        });

        rec.teardown(StepKind::Deactivate, || match activation.take() {
            Some(act) => {
                debug!("leaving {}", act.prefix.display());
                StepStatus::Succeeded
            }
            None => StepStatus::Skipped,
        });

        rec.teardown(StepKind::RemoveEnv, || env.remove());

        RunReport {
            env_name: name,
            started,
            steps: rec.steps,
        }
    }
}

fn activate<R: CommandRunner>(
    runner: &mut R,
    manager: &str,
    name: &EnvName,
) -> (StepStatus, Option<Activation>) {
    if runner.interrupted() {
        return (StepStatus::Interrupted, None);
    }

    let cmd = CommandSpec::new(manager).args(["env", "list", "--json"]);
    match runner.capture(&cmd) {
        Err(e) => (StepStatus::LaunchFailed(format!("{:#}", e)), None),
        Ok((status, _)) if !cmd.is_success(&status) => (status.into(), None),
        Ok((_, out)) => match Activation::resolve(name, &out) {
            Ok(act) => {
                debug!("environment {} lives in {}", name, act.prefix.display());
                (StepStatus::Succeeded, Some(act))
            }
            Err(e) => (StepStatus::Failed(format!("{:#}", e)), None),
        },
    }
}
