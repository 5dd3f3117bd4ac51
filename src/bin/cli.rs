//! node-toolkit CLI - run and inspect experiments

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use node_toolkit::{
    init_logging, nn::Module, registry, run_experiment, version, ExperimentConfig, LoggingConfig, MHDNet, NodeResult,
};

#[derive(Parser)]
#[command(name = "node-toolkit")]
#[command(about = "Train hypergraph networks over multi-node volumes")]
#[command(version = version())]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment
    Train {
        /// Experiment configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Override the number of epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Log at debug level
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a configuration and build its model without training
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// List the exported names usable in experiment files
    Symbols,
}

fn logging(config: Option<&ExperimentConfig>, verbose: bool) -> LoggingConfig {
    let mut logging = config.map(|c| c.logging.clone()).unwrap_or_default();
    if verbose {
        logging.level = "debug".to_string();
    }
    logging
}

fn run(cli: Cli) -> NodeResult<()> {
    match cli.command {
        Commands::Train { config, epochs, verbose } => {
            let mut experiment = ExperimentConfig::load(&config)?;
            init_logging(&logging(Some(&experiment), verbose))?;
            if let Some(epochs) = epochs {
                experiment.training.num_epochs = epochs;
            }
            let log = run_experiment(&experiment)?;
            match (log.best_epoch, log.best_val_loss) {
                (Some(epoch), Some(loss)) => info!("Best val loss {:.4} at epoch {}", loss, epoch + 1),
                _ => info!("No validation epoch was run"),
            }
        }
        Commands::Check { config } => {
            let experiment = ExperimentConfig::load(&config)?;
            init_logging(&logging(Some(&experiment), false))?;
            experiment.validate()?;
            let mut model = MHDNet::new(experiment.model.clone(), experiment.seed)?;
            println!("Configuration {} is valid", config.display());
            println!("  Sub-networks:     {}", model.execution_order().join(" -> "));
            println!("  Input nodes:      {}", model.in_nodes().join(", "));
            println!("  Output nodes:     {}", model.out_nodes().join(", "));
            println!("  Parameters:       {}", model.num_parameters());
            println!("  Tasks:            {}", experiment.tasks.keys().cloned().collect::<Vec<_>>().join(", "));
        }
        Commands::Symbols => {
            for symbol in registry::all_symbols() {
                println!("{:<28} {:<8} {}", symbol.name, symbol.item.kind(), symbol.module);
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(code = ?e.code(), "{}", e);
            eprintln!("Error: {}", e.user_message());
            if e.is_recoverable() {
                eprintln!("\nFix the files on disk and run again.");
            }
            ExitCode::from(e.code().exit_status())
        }
    }
}
