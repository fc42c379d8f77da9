//! CLI shell — a thin adapter that turns `clap` argument parsing into
//! `CommandArgs` and dispatches through the `command` registry, exactly the
//! way the teacher's `cli` helper modules wrap `client` calls to the running
//! daemon (`cli::client`). Unlike the teacher, which hand-writes one module
//! per subcommand, every subcommand here is declared once in
//! `command::handlers::all_commands` — the CLI just builds a `clap::Command`
//! from each `CommandSpec`'s parameter schema (`spec.md` §4.9, §6).

mod args;
mod format;

use std::sync::Arc;

use clap::{Arg, ArgAction, Command};
use serde_json::Value;

use crate::command::{CommandRegistry, ParamType};
use crate::EngineContext;

pub use format::OutputFormat;

/// Build the root `clap::Command`, one subcommand per registered command.
fn build_cli(registry: &CommandRegistry) -> Command {
    let mut root = Command::new("questload")
        .about("Lease-based task dispatch and orchestration engine")
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("print raw JSON instead of a human-readable summary"),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .global(true)
                .help("override the engine's data directory"),
        )
        .subcommand_required(true)
        .arg_required_else_help(true);

    for spec in registry.list() {
        let mut sub = Command::new(spec.cli_name).about(spec.description);
        for param in &spec.params {
            let mut arg = Arg::new(param.name);
            if param.positional {
                arg = arg.value_name(param.name);
            } else {
                arg = arg.long(kebab(param.name));
                if let Some(alias) = param.alias {
                    arg = arg.short(alias.chars().next().unwrap());
                }
            }
            if param.param_type == ParamType::Boolean {
                arg = arg.action(ArgAction::SetTrue);
            } else {
                arg = arg.action(ArgAction::Set);
            }
            if param.required {
                arg = arg.required(true);
            }
            if let Some(choices) = param.choices {
                arg = arg.value_parser(choices.to_vec());
            }
            arg = arg.help(param.description);
            sub = sub.arg(arg);
        }
        root = root.subcommand(sub);
    }
    root
}

fn kebab(name: &str) -> String {
    let mut out = String::new();
    for c in name.chars() {
        if c.is_uppercase() {
            out.push('-');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Parse `raw_args` (normally `std::env::args().skip(1)`), dispatch through
/// `registry`, print the result, and return the process exit code — 0 on
/// success, 1 otherwise (`spec.md` §6, "Exit codes").
pub async fn run(ctx: Arc<EngineContext>, registry: &CommandRegistry, raw_args: Vec<String>) -> i32 {
    let app = build_cli(registry);
    let matches = match app.try_get_matches_from(std::iter::once("questload".to_string()).chain(raw_args)) {
        Ok(m) => m,
        Err(e) => {
            e.print().ok();
            return if e.use_stderr() { 1 } else { 0 };
        }
    };

    let json_mode = matches.get_flag("json");
    let Some((cli_name, sub_matches)) = matches.subcommand() else {
        return 1;
    };
    let Some(spec) = registry.list().iter().find(|c| c.cli_name == cli_name) else {
        eprintln!("unknown command '{cli_name}'");
        return 1;
    };

    let command_args = match args::collect(spec, sub_matches) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };

    let result = registry.dispatch(ctx, spec.name, command_args).await;
    if json_mode {
        println!("{}", serde_json::to_string_pretty(&result).unwrap());
    } else {
        format::print_human(spec.name, &result);
    }
    if result.success {
        0
    } else {
        1
    }
}

/// Used by callers that already have a parsed JSON args blob (e.g. tests) and
/// want to skip `clap` entirely.
pub async fn dispatch_raw(
    ctx: Arc<EngineContext>,
    registry: &CommandRegistry,
    name: &str,
    args: Value,
) -> crate::command::CommandResult {
    registry.dispatch(ctx, name, args).await
}
