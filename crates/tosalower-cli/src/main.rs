//! tosalower CLI - Command-line interface for lowering exported programs to TOSA
//!
//! Compiles an exported program (JSON) for a TOSA target and inspects the
//! pipelines and visitors available for a target.

mod cli;
mod config;
mod output;

use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::io::Read;
use tracing_subscriber::EnvFilter;

use tosalower_compiler::{compile, select_annotation_pipeline, select_pipeline, VisitorRegistry};
use tosalower_ir::ExportedProgram;

use cli::{Cli, Commands, ConfigCommand};
use config::{parse_spec, Config};
use output::{enable_colors, print_compilation_success, print_error, print_header, print_pipeline};

fn main() {
    if let Err(e) = run() {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.no_config {
        Config::default()
    } else {
        Config::load_default()?
    };
    if cli.no_color {
        config.colored = false;
    }
    enable_colors(config.colored);
    init_tracing(cli.verbose, &config.log_level);

    match &cli.command {
        Commands::Compile {
            program,
            spec,
            output,
            validate_each_pass,
            dump_after,
            quiet,
        } => {
            if *validate_each_pass {
                config.validate_each_pass = true;
            }
            config.dump_graph_after.extend(dump_after.iter().cloned());
            let compilation = config.compilation_config(spec.as_deref())?;

            let exported = read_program(program)?;
            let tosa = compile(exported, &compilation)
                .with_context(|| format!("Lowering for {} failed", compilation.spec))?;
            let json = tosa.to_json_pretty().context("Failed to serialize TOSA program")?;

            match output {
                Some(path) => fs::write(path, json)
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => println!("{json}"),
            }
            if !quiet {
                print_compilation_success(&tosa);
            }
            Ok(())
        }
        Commands::Pipeline { spec, annotation } => {
            let spec = parse_spec(spec)?;
            let pipeline = if *annotation {
                select_annotation_pipeline(&spec)
            } else {
                select_pipeline(&spec)?
            };
            print_pipeline(&pipeline);
            Ok(())
        }
        Commands::Visitors { spec } => {
            let spec = parse_spec(spec)?;
            let registry = VisitorRegistry::with_builtin_visitors()?;
            let mut targets = registry.supported_targets(&spec);
            targets.sort_unstable();
            print_header(&format!("{} visitors for {}", targets.len(), spec));
            for target in targets {
                println!("  {target}");
            }
            Ok(())
        }
        Commands::Config { command } => handle_config_command(command, &config),
    }
}

/// RUST_LOG wins; otherwise `-v` raises the configured level.
fn init_tracing(verbose: u8, configured: &str) {
    let level = match verbose {
        0 => configured,
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_program(input: &str) -> Result<ExportedProgram> {
    let content = if input == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read program from stdin")?;
        buffer
    } else {
        fs::read_to_string(input).with_context(|| format!("Failed to read {input}"))?
    };
    ExportedProgram::from_json(&content).with_context(|| format!("Failed to parse {input}"))
}

/// `config` is the configuration already resolved for this run, so `show`
/// honours `--no-config`.
fn handle_config_command(command: &ConfigCommand, config: &Config) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let toml_str = toml::to_string_pretty(config)?;
            println!("{}", toml_str);
        }
        ConfigCommand::Path => {
            let path = Config::config_path();
            println!("{}", path.display());
        }
        ConfigCommand::Init => {
            let path = Config::create_default()?;
            output::print_success(&format!("Created config file: {}", path.display()));
        }
    }

    Ok(())
}
