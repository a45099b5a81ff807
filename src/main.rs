#[macro_use]
extern crate log;

use clap::Parser;
use log::Level;
use utils::results_uploader::handler_for;

mod commands;
mod orchestrator;
mod utils;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// upload the step report to this URL (implies `run --report`)
    #[clap(long)]
    push_results_url: Option<String>,

    /// most verbose log level printed (error, warn, info, debug, trace)
    #[arg(long, env = "ENVSWEEP_LOG_LEVEL", default_value_t = Level::Info)]
    log_level: Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a hyperparameter search in a throwaway conda environment
    ///
    /// Creates a randomly named environment with the installer script, installs the
    /// package from the project directory into it, runs the search script and removes
    /// the environment again. The environment is removed even when a step fails or
    /// the run is interrupted with Ctrl+C / SIGTERM.
    Run(commands::run::RunArgs),

    /// Print freshly generated environment names
    Name(commands::name::NameArgs),

    /// Remove an environment left behind by a killed run
    Cleanup(commands::cleanup::CleanupArgs),
}

fn main() -> anyhow::Result<()> {
    // parse command line arguments
    let args = Args::parse();

    // init logging
    simple_logger::init_with_level(args.log_level)?;

    let code = dispatch(args)?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn dispatch(args: Args) -> anyhow::Result<i32> {
    match args.command {
        Commands::Run(ev) => {
            let ev = ev.uploading_to(args.push_results_url.as_deref());
            commands::run::run(ev, handler_for(args.push_results_url))
        }
        Commands::Name(ev) => commands::name::run(ev),
        Commands::Cleanup(ev) => commands::cleanup::run(ev),
    }
}
