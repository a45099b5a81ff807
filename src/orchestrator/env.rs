use std::{fmt, path::PathBuf, str::FromStr};

use anyhow::{bail, Context};
use rand::{rngs::OsRng, RngCore};
use serde::Deserialize;

use crate::utils::external_prog::{CommandRunner, CommandSpec};

use super::{command_status, StepStatus};

pub const ENV_NAME_LEN: usize = 16;

const ALPHABET: &[u8; 62] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Largest multiple of the alphabet size that fits in a byte. Bytes above it are rejected so
/// that every character is equally likely.
const REJECT_FROM: u8 = (256 / ALPHABET.len() * ALPHABET.len()) as u8;

/// Opaque identifier of the isolated environment owned by one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvName(String);

impl EnvName {
    /// Fresh name from the OS entropy source.
    pub fn generate() -> anyhow::Result<EnvName> {
        EnvName::from_rng(&mut OsRng)
    }

    pub fn from_rng<R: RngCore + ?Sized>(rng: &mut R) -> anyhow::Result<EnvName> {
        let mut name = String::with_capacity(ENV_NAME_LEN);
        let mut buf = [0u8; 2 * ENV_NAME_LEN];

        while name.len() < ENV_NAME_LEN {
            rng.try_fill_bytes(&mut buf)
                .context("failed to read from the entropy source")?;

            for b in buf.iter().filter(|b| **b < REJECT_FROM) {
                name.push(ALPHABET[*b as usize % ALPHABET.len()] as char);
                if name.len() == ENV_NAME_LEN {
                    break;
                }
            }
        }

        Ok(EnvName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for EnvName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            bail!("environment name must not be empty");
        }
        if let Some(c) = s.chars().find(|c| !c.is_ascii_alphanumeric()) {
            bail!("environment name '{}' contains invalid character {:?}", s, c);
        }
        Ok(EnvName(s.to_string()))
    }
}

impl fmt::Display for EnvName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Deserialize)]
struct EnvList {
    envs: Vec<PathBuf>,
}

/// Tool resolution switched to a named environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub name: EnvName,
    pub prefix: PathBuf,
}

impl Activation {
    /// Picks the environment out of `conda env list --json` output.
    pub fn resolve(name: &EnvName, env_list_json: &str) -> anyhow::Result<Activation> {
        let list: EnvList =
            serde_json::from_str(env_list_json).context("unexpected `env list` output")?;

        let prefix = list
            .envs
            .into_iter()
            .find(|p| p.file_name().is_some_and(|f| f == name.as_str()))
            .with_context(|| format!("environment '{}' does not exist", name))?;

        Ok(Activation {
            name: name.clone(),
            prefix,
        })
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.prefix.join("bin")
    }

    /// Path of `program` inside the environment.
    pub fn interpreter(&self, program: &str) -> String {
        self.bin_dir().join(program).to_string_lossy().into_owned()
    }

    /// Variables applied to every command while the environment is active.
    pub fn overlay(&self) -> Vec<(String, String)> {
        let mut paths = vec![self.bin_dir()];
        if let Some(current) = std::env::var_os("PATH") {
            paths.extend(std::env::split_paths(&current));
        }
        let path = std::env::join_paths(paths)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| self.bin_dir().to_string_lossy().into_owned());

        vec![
            ("PATH".to_string(), path),
            (
                "CONDA_PREFIX".to_string(),
                self.prefix.to_string_lossy().into_owned(),
            ),
            ("CONDA_DEFAULT_ENV".to_string(), self.name.to_string()),
        ]
    }
}

/// Owns the named environment for the duration of a run. The environment is removed exactly
/// once: either explicitly through [`ManagedEnv::remove`], or when the guard is dropped.
pub struct ManagedEnv<R: CommandRunner> {
    runner: R,
    manager: String,
    name: EnvName,
    removed: bool,
}

impl<R: CommandRunner> ManagedEnv<R> {
    pub fn new(runner: R, manager: &str, name: EnvName) -> Self {
        ManagedEnv {
            runner,
            manager: manager.to_string(),
            name,
            removed: false,
        }
    }

    pub fn name(&self) -> &EnvName {
        &self.name
    }

    pub fn runner(&mut self) -> &mut R {
        &mut self.runner
    }

    pub fn removal_command(&self) -> CommandSpec {
        CommandSpec::new(&self.manager)
            .args(["remove", "--name", self.name.as_str(), "--all", "--yes"])
            .uninterruptible()
    }

    pub fn remove(&mut self) -> StepStatus {
        if self.removed {
            return StepStatus::Skipped;
        }
        self.removed = true;

        let cmd = self.removal_command();
        info!("removing environment {}", self.name);
        let res = self.runner.run(&cmd);
        command_status(&cmd, res)
    }
}

impl<R: CommandRunner> Drop for ManagedEnv<R> {
    fn drop(&mut self) {
        if self.removed {
            return;
        }

        warn!("environment {} was not torn down, removing it now", self.name);
        let status = self.remove();
        if status.is_failure() {
            error!("failed to remove environment {}: {}", self.name, status);
        }
    }
}
