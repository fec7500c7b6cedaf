//! sockshim - run a program with its IP sockets moved onto Unix domain
//! sockets.

mod rules;
mod spawn;

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, ArgGroup, Parser};

use rules::RuleSource;

#[derive(Parser, Debug)]
#[command(name = "sockshim")]
#[command(version, about = "Run a program with its IP sockets moved onto Unix domain sockets")]
#[command(group(ArgGroup::new("source").required(true).args(["file", "data", "rules"])))]
struct Cli {
    /// Increase verbosity (-v debug, -vv trace); also applies to the agent
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Print the rules before running the program
    #[arg(short, long)]
    print: bool,

    /// Only check the rules, don't run a program
    #[arg(short, long)]
    check: bool,

    /// YAML or JSON rule file
    #[arg(short = 'f', long = "rules-file", value_name = "FILE")]
    file: Option<PathBuf>,

    /// YAML or JSON rule document given inline
    #[arg(short = 'F', long = "rules-data", value_name = "DATA")]
    data: Option<String>,

    /// A rule, e.g. "in,tcp,port=80,path=/run/web.sock" (repeatable)
    #[arg(short = 'r', long = "rule", value_name = "RULE")]
    rules: Vec<String>,

    /// Program to run, followed by its arguments
    #[arg(
        trailing_var_arg = true,
        required_unless_present = "check",
        conflicts_with = "check"
    )]
    program: Vec<String>,
}

impl Cli {
    fn source(&self) -> RuleSource {
        if let Some(file) = &self.file {
            RuleSource::File(file.clone())
        } else if let Some(data) = &self.data {
            RuleSource::Data(data.clone())
        } else {
            RuleSource::Args(self.rules.clone())
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let rules = rules::load(&cli.source())?;
    if cli.print {
        // Keep the program's stdout to itself.
        let text = rules::format_rules(&rules);
        if cli.check {
            print!("{}", text);
        } else {
            eprint!("{}", text);
        }
    }
    if cli.check {
        return Ok(());
    }

    spawn::exec_with_agent(&cli.program, &rules, cli.verbose)
}
