use std::path::PathBuf;

use clap::builder::Styles;
use clap::builder::styling::{AnsiColor, Effects};
use clap::{Args, Parser, Subcommand, ValueEnum, crate_description, crate_version};
use clap_complete::Shell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DecompileModeCli {
    Script,
    Disasm,
    Dot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SyntaxCli {
    Lua,
    C,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LabelModeCli {
    Required,
    EveryGroup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineCli {
    Stackvm,
}

#[derive(Parser)]
#[command(name = "defield",
    version = crate_version!(),
    about = crate_description!(),
    styles = Styles::styled()
        .header(AnsiColor::BrightGreen.on_default() | Effects::BOLD | Effects::UNDERLINE)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightCyan.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Cyan.on_default()))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<TopLevel>,
}

#[derive(Subcommand)]
pub enum TopLevel {
    /// Decompiles field script bytecode
    Decompile {
        #[command(subcommand)]
        command: DecompileCommand,
    },
    /// Generate shell completion
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum DecompileCommand {
    /// Decompiles one script and prints the result
    File {
        /// Path to the script bytecode
        path: PathBuf,

        #[command(flatten)]
        options: DecompileArgs,
    },
    /// Decompiles many scripts into a directory, skipping the ones that fail
    Batch {
        /// Paths to the script bytecode files
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Directory receiving one output file per script
        #[arg(long)]
        out_dir: PathBuf,

        #[command(flatten)]
        options: DecompileArgs,
    },
}

#[derive(Debug, Args)]
pub struct DecompileArgs {
    /// Function table, one `entity function start [end] [args=N] [returns]` per line
    #[arg(long)]
    pub functions: Option<PathBuf>,

    /// Output mode
    #[arg(long, value_enum, default_value_t = DecompileModeCli::Script)]
    pub mode: DecompileModeCli,

    /// Output language
    #[arg(long, value_enum, default_value_t = SyntaxCli::Lua)]
    pub syntax: SyntaxCli,

    /// Where to place labels
    #[arg(long, value_enum, default_value_t = LabelModeCli::Required)]
    pub labels: LabelModeCli,

    /// Address of the first byte of the script (decimal or 0x hex)
    #[arg(long, value_parser = parse_address, default_value = "0")]
    pub base: u32,

    /// Instruction set of the script
    #[arg(long, value_enum, default_value_t = EngineCli::Stackvm)]
    pub engine: EngineCli,

    /// File whose contents are printed before the generated code
    #[arg(long)]
    pub before: Option<PathBuf>,

    /// File whose contents are printed after the generated code
    #[arg(long)]
    pub after: Option<PathBuf>,

    /// Log pipeline details to stderr
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

fn parse_address(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address `{s}`: {e}"))
}
