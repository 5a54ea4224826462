mod commands;
mod examples;
mod output;
mod theme;

use anyhow::Result;
use clap::{
    ColorChoice, Command, CommandFactory, FromArgMatches, Parser, Subcommand,
    builder::{
        Styles,
        styling::{AnsiColor, Color as ClapColor, Style},
    },
};
use colored::{Color as ThemeColor, Colorize, control::ShouldColorize};
use std::fmt::Write;

use commands::{
    ConnectionArgs,
    run::{RunArgs, handle_run},
    status::handle_status,
};
use examples::{ExampleGroup, command_examples};
use output::{GlobalOptions, OutputFormat, OutputManager};
use theme::{ICONS, THEME};

const ENVIRONMENT_VARIABLES: &[(&str, &str)] = &[
    ("DATABASE_URL", "Connection URL of the database to migrate"),
    ("STARTUP_MIGRATIONS_CONFIG", "Path to a TOML config file"),
    ("RUST_LOG", "Log filter (e.g. startup_migrations=debug)"),
];

#[derive(Parser)]
#[command(name = "startup-migrations")]
#[command(version)]
#[command(
    about = "Apply database migrations once per worker pool",
    long_about = r#"Runs pending migrations at service startup, safely from every worker:

• One worker per parent process applies the migrations
• The other workers wait until it is done, then continue
• A database that is still starting up is retried for a while

Commands:
  run      Apply pending migrations (or wait for the worker that does)
  status   Show applied and pending migrations
"#
)]
#[command(subcommand_required = true, arg_required_else_help = true)]
struct Cli {
    /// Output format
    #[arg(long, value_enum, default_value = "table", global = true)]
    output: OutputFormat,

    /// Suppress output (only errors will be shown)
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations, coordinating with sibling workers
    Run(RunArgs),

    /// Show which migrations are applied and which are pending
    Status(ConnectionArgs),
}

fn build_cli_command() -> Command {
    let use_color = ShouldColorize::from_env().should_colorize();
    let mut command = Cli::command()
        .after_long_help(render_top_level_appendix(use_color))
        .color(if use_color { ColorChoice::Auto } else { ColorChoice::Never })
        .styles(help_styles());

    for example in command_examples() {
        if let Some(subcommand) = command.find_subcommand_mut(example.name) {
            *subcommand = subcommand.clone().after_long_help(render_examples(example.groups, use_color));
        }
    }

    command
}

fn render_examples(groups: &[ExampleGroup], use_color: bool) -> String {
    let mut buffer = String::new();
    let _ = writeln!(buffer, "{}", stylize("Examples:", THEME.highlight, true, use_color));

    for (index, group) in groups.iter().enumerate() {
        let _ = writeln!(buffer, "  {}", stylize(group.title, THEME.primary, true, use_color));
        for command in group.commands {
            let arrow = stylize(ICONS.arrow, THEME.secondary, false, use_color);
            let command_text = stylize(command, THEME.secondary, false, use_color);
            let _ = writeln!(buffer, "    {arrow} {command_text}");
        }
        if index + 1 < groups.len() {
            buffer.push('\n');
        }
    }

    buffer
}

fn render_top_level_appendix(use_color: bool) -> String {
    let mut buffer = String::new();

    let _ = writeln!(buffer, "{}", stylize("Environment Variables:", THEME.highlight, true, use_color));
    for (key, description) in ENVIRONMENT_VARIABLES {
        let key_text = stylize(key, THEME.key, true, use_color);
        let value_text = stylize(description, THEME.value, false, use_color);
        let _ = writeln!(buffer, "  {key_text}  {value_text}");
    }

    buffer.push('\n');
    let tip = stylize(
        "Use 'startup-migrations <command> --help' to view examples for each command.",
        THEME.secondary,
        false,
        use_color,
    );
    let _ = writeln!(buffer, "{} {tip}", stylize("Tip:", THEME.highlight, true, use_color));

    buffer
}

fn stylize(text: &str, color: ThemeColor, bold: bool, use_color: bool) -> String {
    if !use_color {
        return text.to_string();
    }
    let styled = text.color(color);
    if bold { styled.bold().to_string() } else { styled.to_string() }
}

fn help_styles() -> Styles {
    Styles::styled()
        .usage(style_from_color(AnsiColor::BrightBlue).bold())
        .header(style_from_color(AnsiColor::Cyan).bold())
        .literal(style_from_color(AnsiColor::Magenta))
        .placeholder(style_from_color(AnsiColor::BrightBlack))
        .valid(style_from_color(AnsiColor::Green))
        .invalid(style_from_color(AnsiColor::Yellow))
        .error(style_from_color(AnsiColor::Red).bold())
}

fn style_from_color(color: AnsiColor) -> Style {
    Style::new().fg_color(Some(ClapColor::Ansi(color)))
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();
}

#[tokio::main]
async fn main() {
    let matches = build_cli_command().get_matches();
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(err) => err.exit(),
    };

    init_logging(cli.verbose);

    if let Err(err) = execute(cli).await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let output = OutputManager::new(GlobalOptions {
        output_format: cli.output,
        quiet: cli.quiet,
        no_color: cli.no_color,
    });

    match cli.command {
        Commands::Run(args) => handle_run(args, &output).await,
        Commands::Status(args) => handle_status(args, &output).await,
    }
}
