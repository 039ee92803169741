use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser};
use defield_lib::engines::StackVm;
use defield_lib::{
    DecompileMode, DecompileOptions, DecompiledScript, DefaultFormatter, Engine, FunctionSpec,
    LabelMode, SyntaxKind,
};

use crate::cli::{
    Cli, DecompileArgs, DecompileCommand, DecompileModeCli, EngineCli, LabelModeCli, SyntaxCli,
    TopLevel,
};

mod cli;

/// Everything shared by the scripts of one invocation.
struct Job {
    options: DecompileOptions,
    functions: Vec<FunctionSpec>,
    engine: &'static dyn Engine,
    before: String,
    after: String,
}

impl Job {
    fn from_args(args: &DecompileArgs) -> Result<Self, String> {
        let mode = match args.mode {
            DecompileModeCli::Script => DecompileMode::Script,
            DecompileModeCli::Disasm => DecompileMode::Disasm,
            DecompileModeCli::Dot => DecompileMode::Dot,
        };
        let syntax = match args.syntax {
            SyntaxCli::Lua => SyntaxKind::Lua,
            SyntaxCli::C => SyntaxKind::C,
        };
        let labels = match args.labels {
            LabelModeCli::Required => LabelMode::Required,
            LabelModeCli::EveryGroup => LabelMode::EveryGroup,
        };
        let engine: &'static dyn Engine = match args.engine {
            EngineCli::Stackvm => &StackVm,
        };
        let functions = match &args.functions {
            Some(path) => defield_lib::parse_function_table(&read_text(path)?)
                .map_err(|e| format!("{path:?}: {e}"))?,
            None => Vec::new(),
        };
        Ok(Self {
            options: DecompileOptions {
                mode,
                syntax,
                labels,
                base_address: args.base,
            },
            functions,
            engine,
            before: args.before.as_deref().map(read_text).transpose()?.unwrap_or_default(),
            after: args.after.as_deref().map(read_text).transpose()?.unwrap_or_default(),
        })
    }

    fn run(&self, path: &Path) -> Result<DecompiledScript, String> {
        let bytes = std::fs::read(path).map_err(|e| format!("failed to read {path:?}: {e}"))?;
        let name = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        defield_lib::decompile_with_options(
            &name,
            &bytes,
            &self.functions,
            self.engine,
            &DefaultFormatter,
            &self.before,
            &self.after,
            self.options,
        )
        .map_err(|e| format!("decompile error: {e}"))
    }

    fn extension(&self) -> &'static str {
        match (self.options.mode, self.options.syntax) {
            (DecompileMode::Script, SyntaxKind::Lua) => "lua",
            (DecompileMode::Script, SyntaxKind::C) => "c",
            (DecompileMode::Disasm, _) => "asm",
            (DecompileMode::Dot, _) => "dot",
        }
    }
}

fn read_text(path: &Path) -> Result<String, String> {
    std::fs::read_to_string(path).map_err(|e| format!("failed to read {path:?}: {e}"))
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .init();
}

fn decompile_file(path: &Path, args: &DecompileArgs) -> Result<(), String> {
    let job = Job::from_args(args)?;
    let out = job.run(path)?;
    print!("{}", out.text);
    Ok(())
}

fn decompile_batch(paths: &[PathBuf], out_dir: &Path, args: &DecompileArgs) -> Result<(), String> {
    let job = Job::from_args(args)?;
    std::fs::create_dir_all(out_dir).map_err(|e| format!("failed to create {out_dir:?}: {e}"))?;
    let mut failed = 0usize;
    for path in paths {
        let result = job.run(path).and_then(|out| {
            let stem = path.file_stem().unwrap_or(path.as_os_str());
            let target = out_dir.join(stem).with_extension(job.extension());
            std::fs::write(&target, out.text)
                .map_err(|e| format!("failed to write {target:?}: {e}"))
        });
        match result {
            Ok(()) => log::info!("decompiled {path:?}"),
            Err(e) => {
                log::error!("{path:?}: {e}");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        return Err(format!("{failed} of {} scripts failed", paths.len()));
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(TopLevel::Decompile { command }) => {
            let result = match &command {
                DecompileCommand::File { path, options } => {
                    init_logging(options.verbose);
                    decompile_file(path, options)
                }
                DecompileCommand::Batch { paths, out_dir, options } => {
                    init_logging(options.verbose);
                    decompile_batch(paths, out_dir, options)
                }
            };
            if let Err(e) = result {
                eprintln!("{e}");
                std::process::exit(1);
            }
        }
        Some(TopLevel::Completion { shell }) => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        }
        None => {
            let _ = Cli::command().print_help();
        }
    }
}
