use std::time::Duration;

use clap::Parser;

use crate::{
    orchestrator::env::{EnvName, ManagedEnv},
    utils::external_prog::{CommandRunner, SubprocessRunner},
};

#[derive(Parser, Debug)]
pub struct CleanupArgs {
    /// name of the leaked environment, as logged by `run`
    name: EnvName,

    /// environment manager executable
    #[arg(long, env = "ENVSWEEP_MANAGER", default_value = "conda")]
    manager: String,
}

pub fn run(args: CleanupArgs) -> anyhow::Result<i32> {
    let runner = SubprocessRunner::new(Duration::from_millis(500))?;
    Ok(remove(args, runner))
}

fn remove<R: CommandRunner>(args: CleanupArgs, runner: R) -> i32 {
    let mut env = ManagedEnv::new(runner, &args.manager, args.name);

    let status = env.remove();
    if status.is_failure() {
        error!("could not remove environment {}: {}", env.name(), status);
    } else {
        info!("environment {} removed", env.name());
    }
    status.exit_code()
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::AtomicBool, Arc};

    use super::*;

    fn runner() -> SubprocessRunner {
        SubprocessRunner::with_flag(Arc::new(AtomicBool::new(false)), Duration::from_millis(100))
    }

    fn args(manager: &str) -> CleanupArgs {
        CleanupArgs::try_parse_from(["cleanup", "abc123", "--manager", manager]).unwrap()
    }

    #[test]
    fn successful_removal_exits_zero() {
        assert_eq!(remove(args("true"), runner()), 0);
    }

    #[test]
    fn failed_removal_returns_its_exit_code() {
        assert_eq!(remove(args("false"), runner()), 1);
    }

    #[test]
    fn missing_manager_maps_to_127() {
        assert_eq!(remove(args("/nonexistent/envsweep-conda"), runner()), 127);
    }

    #[test]
    fn removal_is_issued_once_with_the_given_name() {
        let mut scripted = crate::utils::external_prog::scripted::ScriptedRunner::new();
        assert_eq!(remove(args("conda"), &mut scripted), 0);
        assert_eq!(
            scripted.command_lines(),
            vec!["conda remove --name abc123 --all --yes"]
        );
    }

    #[test]
    fn name_is_validated() {
        assert!(CleanupArgs::try_parse_from(["cleanup", "bad name"]).is_err());
    }
}
