use clap::Parser;

use crate::orchestrator::env::EnvName;

#[derive(Parser, Debug)]
pub struct NameArgs {
    /// how many names to print
    #[arg(long, default_value_t = 1)]
    count: usize,
}

pub fn run(args: NameArgs) -> anyhow::Result<i32> {
    for _ in 0..args.count {
        println!("{}", EnvName::generate()?);
    }
    Ok(0)
}
