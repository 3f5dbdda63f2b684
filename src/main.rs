//! Command-line front end for the deconvolution pipeline.
//!
//! The binary is a thin orchestrator around the library: it parses
//! arguments, loads the run configuration and the raw tally, and fans the
//! per-location deconvolution out across a rayon pool. Locations are
//! independent by construction (each task reads only the shared immutable
//! tally and produces its own records), so the final table is keyed by
//! (date, location) rather than by completion order.

use clap::{Parser, ValueEnum};
use rayon::prelude::*;
use std::path::PathBuf;
use std::process;

use wwdeconv::config::{ConfintKind, DeconvConfig, KernelKind, RegressorKind};
use wwdeconv::confint::ConfintScale;
use wwdeconv::data::{load_tally, preprocess};
use wwdeconv::engine::{DeconvRecord, KernelDeconv};

#[derive(Clone, Copy, ValueEnum)]
enum KernelCli {
    Gaussian,
    Box,
}

#[derive(Clone, Copy, ValueEnum)]
enum RegressorCli {
    Nnls,
    Robust,
}

#[derive(Clone, Copy, ValueEnum)]
enum ScaleCli {
    Linear,
    Logit,
}

/// Deconvolve time-varying variant proportions from a wastewater mutation
/// tally.
#[derive(Parser)]
#[command(name = "wwdeconv", version)]
struct Args {
    /// Path to the tab-separated mutation tally
    tally: PathBuf,

    /// Path to the TOML run configuration
    #[arg(long)]
    config: PathBuf,

    /// Output CSV path for the long-format records
    #[arg(long, short)]
    output: PathBuf,

    /// Override the configured kernel bandwidth (days)
    #[arg(long)]
    bandwidth: Option<f64>,

    /// Override the configured kernel family
    #[arg(long, value_enum)]
    kernel: Option<KernelCli>,

    /// Override the configured regressor
    #[arg(long, value_enum)]
    regressor: Option<RegressorCli>,

    /// Override the configured confidence-interval scale
    #[arg(long, value_enum)]
    confint_scale: Option<ScaleCli>,

    /// Disable confidence-interval computation (NaN bounds are emitted)
    #[arg(long)]
    no_confint: bool,
}

fn apply_overrides(config: &mut DeconvConfig, args: &Args) {
    if let Some(bandwidth) = args.bandwidth {
        config.kernel.bandwidth = bandwidth;
    }
    if let Some(kernel) = args.kernel {
        config.kernel.kind = match kernel {
            KernelCli::Gaussian => KernelKind::Gaussian,
            KernelCli::Box => KernelKind::Box,
        };
    }
    if let Some(regressor) = args.regressor {
        config.regressor.kind = match regressor {
            RegressorCli::Nnls => RegressorKind::Nnls,
            RegressorCli::Robust => RegressorKind::Robust,
        };
    }
    if let Some(scale) = args.confint_scale {
        config.confint.scale = match scale {
            ScaleCli::Linear => ConfintScale::Linear,
            ScaleCli::Logit => ConfintScale::Logit,
        };
    }
    if args.no_confint {
        config.confint.kind = ConfintKind::Null;
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = DeconvConfig::load(&args.config)?;
    apply_overrides(&mut config, args);

    log::info!("loading tally from {}", args.tally.display());
    let df = load_tally(&args.tally)?;

    log::info!("preprocessing {} raw rows", df.height());
    let mut table = preprocess(&df, &config.preprocess)?;
    table.filter_mutations(&config.filters);
    log::info!(
        "{} rows retained across {} variants",
        table.rows.len(),
        table.n_tracked()
    );

    let locations = if config.locations.is_empty() {
        table.locations()
    } else {
        config.locations.clone()
    };
    log::info!("deconvolving {} locations", locations.len());

    let records: Vec<DeconvRecord> = locations
        .par_iter()
        .flat_map(|location| {
            let (x, y, dates) = table.design_matrix(location);
            if y.is_empty() {
                log::warn!("location '{location}' has no retained observations");
                return Vec::new();
            }
            let deconv = KernelDeconv::new(
                x,
                y,
                dates,
                table.variant_names.clone(),
                config.kernel.build(),
                config.regressor.build(),
                config.confint.build(),
            )
            .with_min_tol(config.min_tol)
            .with_renormalize(config.renormalize);
            deconv.deconv_all().records(location)
        })
        .collect();

    log::info!("writing {} records to {}", records.len(), args.output.display());
    let mut writer = csv::Writer::from_path(&args.output)?;
    for record in &records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(err) = run(&args) {
        eprintln!("error: {err}");
        process::exit(1);
    }
}
