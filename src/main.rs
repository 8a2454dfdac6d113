use clap::{ArgAction, Parser, Subcommand};
use release_rail::commands;
use release_rail::core::context::RunContext;
use release_rail::core::error::{RailError, print_error};
use std::path::PathBuf;

/// Release one component to every registry, keep the dev branch in sync
#[derive(Parser)]
#[command(name = "release-rail")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(styles = get_styles())]
struct Cli {
  /// Run as if started in this directory
  #[arg(short = 'C', long, global = true)]
  directory: Option<PathBuf>,

  /// More diagnostics on stderr (-v info, -vv debug, -vvv trace)
  #[arg(short, long, action = ArgAction::Count, global = true)]
  verbose: u8,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Resolve, tag and publish a release across every channel
  Run {
    /// Trigger event JSON ({"ref": ..., "after": ...}); refused if stale
    #[arg(long)]
    event: Option<PathBuf>,
    /// Build and stage every channel but upload nothing
    #[arg(long)]
    dry_run: bool,
    /// Output the run report in JSON format
    #[arg(long)]
    json: bool,
  },

  /// Show the next version and the job graph without changing anything
  Plan {
    /// Output plan in JSON format
    #[arg(long)]
    json: bool,
  },

  /// Show the shard expansion of each channel
  Matrix {
    /// Only this channel
    #[arg(long)]
    channel: Option<String>,
    /// Output matrices in JSON format
    #[arg(long)]
    json: bool,
  },

  /// Validate rail.toml and every manifest pattern
  Check {
    /// Output results in JSON format
    #[arg(long)]
    json: bool,
  },
}

fn main() {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  let root = match cli.directory {
    Some(dir) => dir,
    None => match std::env::current_dir() {
      Ok(dir) => dir,
      Err(e) => {
        eprintln!("Error: Failed to get current directory: {}", e);
        std::process::exit(1);
      }
    },
  };

  let ctx = match RunContext::build(&root) {
    Ok(ctx) => ctx,
    Err(e) => handle_error(e),
  };

  let result = match cli.command {
    Commands::Run { event, dry_run, json } => commands::run_release(&ctx, event, dry_run, json),
    Commands::Plan { json } => commands::run_plan(&ctx, json).map(|_| 0),
    Commands::Matrix { channel, json } => commands::run_matrix(&ctx, channel, json).map(|_| 0),
    Commands::Check { json } => commands::run_check(&ctx, json).map(|_| 0),
  };

  match result {
    Ok(code) => std::process::exit(code),
    Err(err) => handle_error(err),
  }
}

fn init_tracing(verbose: u8) {
  let level = match verbose {
    0 => tracing::Level::WARN,
    1 => tracing::Level::INFO,
    2 => tracing::Level::DEBUG,
    _ => tracing::Level::TRACE,
  };

  tracing_subscriber::fmt()
    .with_max_level(level)
    .with_target(verbose > 2)
    .with_writer(std::io::stderr)
    .init();
}

fn handle_error(err: RailError) -> ! {
  print_error(&err);
  std::process::exit(err.exit_code().as_i32());
}

fn get_styles() -> clap::builder::Styles {
  clap::builder::Styles::styled()
    .usage(
      anstyle::Style::new()
        .bold()
        .underline()
        .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow))),
    )
    .header(
      anstyle::Style::new()
        .bold()
        .underline()
        .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Yellow))),
    )
    .literal(anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Green))))
    .invalid(
      anstyle::Style::new()
        .bold()
        .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Red))),
    )
    .error(
      anstyle::Style::new()
        .bold()
        .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Red))),
    )
    .valid(
      anstyle::Style::new()
        .bold()
        .underline()
        .fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::Green))),
    )
    .placeholder(anstyle::Style::new().fg_color(Some(anstyle::Color::Ansi(anstyle::AnsiColor::White))))
}
