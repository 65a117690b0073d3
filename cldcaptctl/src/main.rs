use clap::{crate_version, Parser};
use cldcaptapp::{cldcaptapp_run, AppFailure};
mod commands;
mod ui;
use commands::{list, update};

fn main() {
    match CliOptions::try_parse() {
        Ok(options) => {
            let vcount = options.verbose as usize;
            let code = cldcaptapp_run(|_| command_dispatch(options), vcount, true);
            std::process::exit(code);
        }
        Err(e) => {
            let message = e.to_string();
            println!("{}", message.replace("error:", "ERRO:"));
            println!();
            std::process::exit(1);
        }
    }
}

async fn command_dispatch(options: CliOptions) -> Result<(), AppFailure> {
    let result = match options.subcmd {
        TopCommands::Update(options) => update::update_command(options).await,
        TopCommands::Plan(options) => update::plan_command(options).await,
        TopCommands::List(top_options) => match top_options.subcmd {
            ListSubCommands::Snapshots(options) => list::list_snapshots(options).await,
            ListSubCommands::Backups(options) => list::list_backups(options).await,
        },
    };
    result.map_err(AppFailure::from)
}

#[derive(Parser)]
#[clap(version = crate_version!(), author = "rebeagle")]
struct CliOptions {
    /// Enable debug logs. Use twice to enable trace logs.
    #[clap(short, long, parse(from_occurrences))]
    verbose: i32,
    #[clap(subcommand)]
    subcmd: TopCommands,
}

#[derive(Parser)]
enum TopCommands {
    /// Plan and apply snapshot and backup changes.
    Update(update::UpdateOptions),
    /// Show the plan without applying anything.
    Plan(update::PlanOptions),
    /// Inspect local snapshots and remote backups.
    List(ListCommands),
}

#[derive(Parser)]
struct ListCommands {
    #[clap(subcommand)]
    subcmd: ListSubCommands,
}

#[derive(Parser)]
enum ListSubCommands {
    Snapshots(list::ListOptions),
    Backups(list::ListOptions),
}
