use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use parsec_core::{Sample, Simulation};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "parsec")]
#[command(about = "Parsec - run continuous-time ODE models", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a model and print the recorded outputs
    Run {
        /// Path to the model JSON file
        model: PathBuf,
        /// Simulated time to run (defaults to the model's solver duration)
        #[arg(long, conflicts_with = "steps")]
        duration: Option<f64>,
        /// Number of ticks to run
        #[arg(long)]
        steps: Option<u64>,
        /// Record a sample every N ticks (overrides the model's output_every)
        #[arg(long, value_name = "N")]
        every: Option<u64>,
        /// Input value applied before the first tick, as NAME=VALUE
        #[arg(long = "input", value_parser = parse_input)]
        inputs: Vec<(String, f64)>,
        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Csv)]
        format: Format,
    },
    /// Compile a model and report skipped equations and stuck variables
    Check {
        /// Path to the model JSON file
        model: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Csv,
    Json,
}

fn parse_input(arg: &str) -> Result<(String, f64)> {
    let (name, value) = arg
        .split_once('=')
        .ok_or_else(|| anyhow!("expected NAME=VALUE, got '{}'", arg))?;
    let value = value
        .trim()
        .parse::<f64>()
        .with_context(|| format!("invalid value for input '{}'", name.trim()))?;
    Ok((name.trim().to_string(), value))
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr).without_time())
        .init();

    let result = match cli.command {
        Commands::Run {
            model,
            duration,
            steps,
            every,
            inputs,
            format,
        } => run(&model, duration, steps, every, &inputs, format),
        Commands::Check { model } => check(&model),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(
    path: &Path,
    duration: Option<f64>,
    steps: Option<u64>,
    every: Option<u64>,
    inputs: &[(String, f64)],
    format: Format,
) -> Result<()> {
    let mut sim = Simulation::load_file(path)?;
    if let Some(every) = every {
        sim.set_output_every(every)?;
    }
    for (name, value) in inputs {
        sim.set_input(name, *value)?;
        tracing::debug!(input = %name, value, "input applied");
    }

    let summary = match (steps, duration) {
        (Some(steps), _) => sim.run_steps(steps),
        (None, Some(duration)) => sim.run_for(duration)?,
        (None, None) => sim.run()?,
    };
    tracing::info!(
        model = %sim.model().name,
        ticks = summary.ticks,
        time = sim.time(),
        samples = sim.samples().len(),
        "run complete"
    );
    if !summary.is_clean() {
        tracing::warn!(
            degraded = summary.degraded,
            skipped = summary.skipped,
            "some ticks used fallback derivatives"
        );
    }

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    match format {
        Format::Csv => write_csv(&mut out, sim.outputs(), sim.samples())?,
        Format::Json => write_json_lines(&mut out, sim.samples())?,
    }
    out.flush()?;
    Ok(())
}

fn check(path: &Path) -> Result<()> {
    let sim = Simulation::load_file(path)?;
    let diagnostics = sim.diagnostics();
    if diagnostics.is_empty() {
        println!(
            "{}: {} equation(s) compiled, no problems found",
            sim.model().name,
            sim.engine().equations().len()
        );
        return Ok(());
    }
    for diagnostic in diagnostics {
        println!("{}", diagnostic);
    }
    tracing::error!(model = %sim.model().name, problems = diagnostics.len(), "check failed");
    bail!("{} problem(s) found in {}", diagnostics.len(), path.display())
}

fn write_csv(out: &mut impl Write, columns: &[String], samples: &[Sample]) -> Result<()> {
    write!(out, "time")?;
    for column in columns {
        write!(out, ",{}", column)?;
    }
    writeln!(out)?;
    for sample in samples {
        write!(out, "{}", sample.time)?;
        for column in columns {
            match sample.values.get(column) {
                Some(value) => write!(out, ",{}", value)?,
                None => write!(out, ",")?,
            }
        }
        writeln!(out)?;
    }
    Ok(())
}

fn write_json_lines(out: &mut impl Write, samples: &[Sample]) -> Result<()> {
    for sample in samples {
        serde_json::to_writer(&mut *out, sample)?;
        writeln!(out)?;
    }
    Ok(())
}
