pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

use crate::commands::transition::TransitionArgs;

#[derive(Debug, Parser)]
#[command(
    name = "labgate",
    about = "Experiment governance operator CLI",
    long_about = "Inspect and move experiments through their governed lifecycle, apply \
                  migrations, inspect configuration, and run smoke validation.",
    after_help = "Examples:\n  labgate migrate\n  labgate state checkout-test\n  \
                  labgate transition checkout-test pending_approval --actor dana\n  labgate smoke"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Show an experiment's current state and allowed next states")]
    State { experiment: String },
    #[command(about = "List an experiment's recorded transitions, oldest first")]
    History { experiment: String },
    #[command(about = "Request a lifecycle transition through policies and approval gates")]
    Transition(TransitionArgs),
    #[command(about = "Run end-to-end readiness checks with per-check timing details")]
    Smoke,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::State { experiment } => commands::state::run(&experiment),
        Command::History { experiment } => commands::history::run(&experiment),
        Command::Transition(args) => commands::transition::run(args),
        Command::Smoke => commands::smoke::run(),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};

    use super::{Cli, Command};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn transition_flags_parse() {
        let cli = Cli::try_parse_from([
            "labgate",
            "transition",
            "checkout-test",
            "running",
            "--actor",
            "dana",
            "--error-rate",
            "0.01",
            "--running-secs",
            "600",
        ])
        .expect("parse");

        let Command::Transition(args) = cli.command else {
            panic!("expected transition command");
        };
        assert_eq!(args.experiment, "checkout-test");
        assert_eq!(args.target, "running");
        assert_eq!(args.actor.as_deref(), Some("dana"));
        assert_eq!(args.error_rate, Some(0.01));
        assert_eq!(args.running_secs, Some(600));
        assert_eq!(args.traffic_pct, None);
    }
}
