use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::{
    orchestrator::{env::EnvName, ExitPolicy, Orchestrator, RunConfig, RunReport},
    utils::{
        dump_file,
        external_prog::{CommandRunner, SubprocessRunner},
        report::write_csv,
        results_uploader::ResultHandler,
    },
};

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// environment manager executable
    #[arg(long, env = "ENVSWEEP_MANAGER", default_value = "conda")]
    manager: String,

    /// shell used to run the installer script
    #[arg(long, env = "ENVSWEEP_SHELL", default_value = "bash")]
    shell: String,

    /// script creating the environment, called with the environment name
    #[arg(
        long,
        env = "ENVSWEEP_INSTALLER",
        default_value = "scripts/install_deepchem_conda.sh"
    )]
    installer: PathBuf,

    /// root of the package to install, the installer runs from here too
    #[arg(long, env = "ENVSWEEP_PROJECT_DIR", default_value = ".")]
    project_dir: PathBuf,

    /// directory with the search script, relative to the project dir
    #[arg(long, env = "ENVSWEEP_SEARCH_DIR", default_value = "examples/hyperparam_opt")]
    search_dir: PathBuf,

    /// hyperparameter search script, run from the search dir
    #[arg(
        long,
        env = "ENVSWEEP_SEARCH_SCRIPT",
        default_value = "tensor_graph_hyper_param_search.py"
    )]
    search_script: String,

    /// interpreter name, resolved inside the environment once it is active
    #[arg(long, env = "ENVSWEEP_PYTHON", default_value = "python")]
    python: String,

    /// use this environment name instead of a random one
    #[arg(long)]
    name: Option<EnvName>,

    /// skip the remaining work after the first failed step (teardown still happens)
    #[arg(long, env = "ENVSWEEP_FAIL_FAST")]
    fail_fast: bool,

    /// how the step outcomes turn into our exit code; `always-zero` reproduces the old
    /// shell script, which never reported failures
    #[arg(long, value_enum, env = "ENVSWEEP_EXIT_POLICY", default_value_t = ExitPolicy::FirstFailure)]
    exit_policy: ExitPolicy,

    /// how long an interrupted child gets to exit before it is killed
    #[arg(long, default_value_t = 500)]
    grace_ms: u64,

    /// write a CSV report with the outcome of every step
    #[arg(long, action)]
    report: bool,

    /// where the CSV report goes
    #[arg(long, env = "ENVSWEEP_REPORT_DIR", default_value = ".")]
    report_dir: PathBuf,

    /// extra arguments for the search script
    #[arg(last = true)]
    search_args: Vec<String>,
}

impl RunArgs {
    /// Uploading needs a report file, so a push URL turns `--report` on.
    pub fn uploading_to(mut self, push_url: Option<&str>) -> Self {
        self.report |= push_url.is_some();
        self
    }

    fn config(&self) -> RunConfig {
        RunConfig {
            manager: self.manager.clone(),
            shell: self.shell.clone(),
            installer: self.installer.clone(),
            project_dir: self.project_dir.clone(),
            search_dir: self.search_dir.clone(),
            search_script: self.search_script.clone(),
            search_args: self.search_args.clone(),
            python: self.python.clone(),
            fail_fast: self.fail_fast,
        }
    }
}

pub fn run(args: RunArgs, handler: Box<dyn ResultHandler>) -> anyhow::Result<i32> {
    let runner = SubprocessRunner::new(Duration::from_millis(args.grace_ms))?;
    execute(&args, runner, handler.as_ref())
}

/// Runs the orchestration with the given runner and returns the process exit code.
pub fn execute<R: CommandRunner>(
    args: &RunArgs,
    runner: R,
    handler: &dyn ResultHandler,
) -> anyhow::Result<i32> {
    let mut orchestrator = Orchestrator::new(args.config(), runner);

    let report = match args.name.clone() {
        Some(name) => orchestrator.run_with_name(name),
        None => orchestrator.run()?,
    };

    log_summary(&report);

    if args.report {
        let path = args.report_dir.join(dump_file("envsweep_steps", "csv"));
        write_csv(&report, &path)?;
        _ = handler
            .handle_result(&path)
            .inspect_err(|e| warn!("report handling failed: {:#}", e));
    }

    let code = report.exit_code(args.exit_policy);
    if code == 0 && report.first_failure().is_some() {
        debug!("failures ignored because of --exit-policy always-zero");
    }
    Ok(code)
}

fn log_summary(report: &RunReport) {
    info!("environment {}:", report.env_name);
    for rec in &report.steps {
        info!("  {:<16} {} ({:?})", rec.step.as_str(), rec.status, rec.duration);
    }
    if let Some(failed) = report.first_failure() {
        warn!("first failing step: {} ({})", failed.step, failed.status);
    }
}
