use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use training::{Trainer, TrainingConfig, TrainingError};

fn main() {
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Variational autoencoder training CLI", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to training config file")]
    config: PathBuf,

    #[arg(long, value_name = "DIR", help = "Override the image dataset root")]
    data_root: Option<PathBuf>,

    #[arg(long, value_name = "N", help = "Override the number of training epochs")]
    epochs: Option<usize>,

    #[arg(long, value_name = "SEED", help = "Override the run seed")]
    seed: Option<u64>,

    #[arg(long, help = "Resume from the latest checkpoint if available")]
    resume: bool,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if let Some(root) = args.data_root {
        config.data.root = root;
    }
    if let Some(epochs) = args.epochs {
        config.runtime.epochs = epochs;
    }
    if let Some(seed) = args.seed {
        config.runtime.seed = seed;
    }
    config.validate()?;

    let mut trainer = Trainer::new(config)?;

    if args.resume {
        if let Some(descriptor) = trainer.resume_from_latest()? {
            println!(
                "resumed from checkpoint {} (epoch {})",
                descriptor.directory.display(),
                descriptor.manifest.epoch
            );
        }
    }

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    trainer.train_with_shutdown(|| shutdown_flag.load(Ordering::Relaxed))?;

    Ok(())
}
