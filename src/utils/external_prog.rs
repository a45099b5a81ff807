use std::{
    ffi::{OsStr, OsString},
    fmt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use subprocess::{unix::PopenExt, Exec, ExitStatus, Popen, PopenConfig, Redirection};

/// A single external program invocation, together with what counts as success for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// exit codes treated as success
    pub accepted_codes: Vec<u32>,
    /// whether SIGINT/SIGTERM received by us should stop this command. Uninterruptible
    /// commands also get their own process group, so a Ctrl+C on the terminal does not reach
    /// them either.
    pub interruptible: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        CommandSpec {
            program: program.into(),
            args: vec![],
            cwd: None,
            env: vec![],
            accepted_codes: vec![0],
            interruptible: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn envs(mut self, vars: &[(String, String)]) -> Self {
        self.env.extend_from_slice(vars);
        self
    }

    pub fn uninterruptible(mut self) -> Self {
        self.interruptible = false;
        self
    }

    pub fn is_success(&self, status: &ExitStatus) -> bool {
        match status {
            ExitStatus::Exited(code) => self.accepted_codes.contains(code),
            _ => false,
        }
    }

    fn to_exec(&self) -> Exec {
        let mut exec = Exec::cmd(&self.program).args(self.args.as_slice());
        if let Some(dir) = &self.cwd {
            exec = exec.cwd(dir);
        }
        for (key, value) in &self.env {
            exec = exec.env(key, value);
        }
        exec
    }

    /// Starts the command in a new process group, out of reach of terminal signals.
    fn popen_isolated(&self) -> Result<Popen, subprocess::PopenError> {
        let mut argv = vec![OsString::from(&self.program)];
        argv.extend(self.args.iter().map(OsString::from));

        let mut env = PopenConfig::current_env();
        for (key, value) in &self.env {
            env.retain(|(k, _)| k.as_os_str() != OsStr::new(key));
            env.push((key.into(), value.into()));
        }

        Popen::create(
            &argv,
            PopenConfig {
                cwd: self.cwd.as_ref().map(|d| d.as_os_str().to_owned()),
                env: Some(env),
                setpgid: true,
                ..Default::default()
            },
        )
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// How a blocking command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Finished(ExitStatus),
    Interrupted,
}

pub trait CommandRunner {
    /// Run the command to completion, output goes straight to our stdout/stderr.
    fn run(&mut self, cmd: &CommandSpec) -> anyhow::Result<Completion>;

    /// Run the command and collect its stdout.
    fn capture(&mut self, cmd: &CommandSpec) -> anyhow::Result<(ExitStatus, String)>;

    /// Has the user asked us to stop?
    fn interrupted(&self) -> bool;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &mut R {
    fn run(&mut self, cmd: &CommandSpec) -> anyhow::Result<Completion> {
        (**self).run(cmd)
    }

    fn capture(&mut self, cmd: &CommandSpec) -> anyhow::Result<(ExitStatus, String)> {
        (**self).capture(cmd)
    }

    fn interrupted(&self) -> bool {
        (**self).interrupted()
    }
}

pub struct SubprocessRunner {
    stop: Arc<AtomicBool>,
    grace: Duration,
    poll_interval: Duration,
}

impl SubprocessRunner {
    /// Creates a runner and hooks SIGINT and SIGTERM, so that they stop the running child
    /// instead of us.
    pub fn new(grace: Duration) -> anyhow::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))
            .context("registering SIGINT handler")?;
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop))
            .context("registering SIGTERM handler")?;
        Ok(Self::with_flag(stop, grace))
    }

    pub fn with_flag(stop: Arc<AtomicBool>, grace: Duration) -> Self {
        SubprocessRunner {
            stop,
            grace,
            poll_interval: Duration::from_millis(200),
        }
    }

    fn stop_child(&self, popen: &mut Popen) -> anyhow::Result<ExitStatus> {
        if let Some(st) = popen.poll() {
            return Ok(st);
        }

        _ = popen.send_signal(libc::SIGINT);
        let status = popen
            .wait_timeout(self.grace)
            .transpose()
            .unwrap_or_else(|| {
                warn!("child did not stop within {:?}, killing it", self.grace);
                _ = popen.kill();
                popen.wait()
            })
            .context("failed to stop the child process")?;
        Ok(status)
    }
}

impl CommandRunner for SubprocessRunner {
    fn run(&mut self, cmd: &CommandSpec) -> anyhow::Result<Completion> {
        if !cmd.interruptible {
            let mut popen = cmd
                .popen_isolated()
                .with_context(|| format!("failed to start `{}`", cmd))?;
            return Ok(Completion::Finished(popen.wait()?));
        }

        let mut popen = cmd
            .to_exec()
            .popen()
            .with_context(|| format!("failed to start `{}`", cmd))?;

        loop {
            if self.stop.load(Ordering::Relaxed) {
                let status = self.stop_child(&mut popen)?;
                debug!("`{}` stopped after interrupt with {:?}", cmd, status);
                return Ok(Completion::Interrupted);
            }
            if let Some(status) = popen.wait_timeout(self.poll_interval)? {
                // a terminal Ctrl+C hits the child and us at the same time
                if self.stop.load(Ordering::Relaxed) {
                    debug!("`{}` exited with {:?} while interrupted", cmd, status);
                    return Ok(Completion::Interrupted);
                }
                return Ok(Completion::Finished(status));
            }
        }
    }

    fn capture(&mut self, cmd: &CommandSpec) -> anyhow::Result<(ExitStatus, String)> {
        let data = cmd
            .to_exec()
            .stdout(Redirection::Pipe)
            .capture()
            .with_context(|| format!("failed to run `{}`", cmd))?;
        Ok((data.exit_status, data.stdout_str()))
    }

    fn interrupted(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

/// Runner replaying canned results, used to exercise the orchestration without real processes.
#[cfg(test)]
pub mod scripted {
    use std::collections::HashMap;

    use super::*;

    #[derive(Default)]
    pub struct ScriptedRunner {
        /// every command seen, in order
        pub calls: Vec<CommandSpec>,
        /// exit codes keyed by a substring of the command line
        pub exit_codes: HashMap<String, u32>,
        /// commands (by substring) that fail to launch
        pub unlaunchable: Vec<String>,
        /// command (by substring) during which the user "presses Ctrl+C"
        pub interrupt_on: Option<String>,
        pub captured_stdout: String,
        stopped: bool,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn exit_code(mut self, pattern: &str, code: u32) -> Self {
            self.exit_codes.insert(pattern.to_string(), code);
            self
        }

        pub fn stdout(mut self, out: &str) -> Self {
            self.captured_stdout = out.to_string();
            self
        }

        pub fn command_lines(&self) -> Vec<String> {
            self.calls.iter().map(|c| c.to_string()).collect()
        }

        fn record(&mut self, cmd: &CommandSpec) -> anyhow::Result<ExitStatus> {
            self.calls.push(cmd.clone());
            let line = cmd.to_string();
            if self.unlaunchable.iter().any(|p| line.contains(p.as_str())) {
                anyhow::bail!("no such file or directory: {}", cmd.program);
            }
            let code = self
                .exit_codes
                .iter()
                .find(|(p, _)| line.contains(p.as_str()))
                .map(|(_, c)| *c)
                .unwrap_or(0);
            Ok(ExitStatus::Exited(code))
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&mut self, cmd: &CommandSpec) -> anyhow::Result<Completion> {
            let status = self.record(cmd)?;
            let hit = self
                .interrupt_on
                .as_deref()
                .is_some_and(|p| cmd.to_string().contains(p));
            if hit {
                self.stopped = true;
            }
            if self.stopped && cmd.interruptible {
                return Ok(Completion::Interrupted);
            }
            Ok(Completion::Finished(status))
        }

        fn capture(&mut self, cmd: &CommandSpec) -> anyhow::Result<(ExitStatus, String)> {
            let status = self.record(cmd)?;
            Ok((status, self.captured_stdout.clone()))
        }

        fn interrupted(&self) -> bool {
            self.stopped
        }
    }
}
