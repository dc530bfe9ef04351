//! CLI entry point for wipekit pipelines.

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use polars::io::csv::read::CsvReadOptions;
use polars::prelude::*;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, info, warn};
use wipekit::backend::Combine;
use wipekit::{
    Dataset, DriftReport, EagerBackend, ExecutionBackend, FittedPipeline, MapPlan,
    PartitionedBackend, Pipeline, PipelineConfig, Schema, SchemaRegistry, SerializedPipeline,
    StageConfig, StageRegistry,
};

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Stateful preprocessing pipelines with drift monitoring",
    long_about = "Fit preprocessing pipelines on CSV data, apply them to later batches and \
                  check those batches for drift.\n\n\
                  EXAMPLES:\n  \
                  # Infer a schema\n  \
                  wipekit infer -i train.csv -o schema.json\n\n  \
                  # Fit the stages listed in stages.json\n  \
                  wipekit fit -i train.csv --stages stages.json -o pipeline.json\n\n  \
                  # Apply a fitted pipeline using 8 partitions\n  \
                  wipekit transform -i batch.csv -p pipeline.json -o out.csv --partitions 8\n\n  \
                  # Compare a batch against the training reference\n  \
                  wipekit drift -i batch.csv -p pipeline.json --fail-on-drift"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Suppress progress output (only show warnings and errors)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Infer a schema from a CSV file
    Infer {
        #[command(flatten)]
        input: InputArgs,

        /// Pipeline configuration JSON (inference thresholds)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Write the schema here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Fit a pipeline and write it as JSON
    Fit {
        #[command(flatten)]
        input: InputArgs,

        /// JSON array of stage configurations
        #[arg(short, long)]
        stages: PathBuf,

        /// Declared input schema JSON; inferred when omitted
        #[arg(long)]
        schema: Option<PathBuf>,

        /// Pipeline configuration JSON
        #[arg(long)]
        config: Option<PathBuf>,

        /// Where to write the fitted pipeline
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Apply a fitted pipeline to a CSV file
    Transform {
        #[command(flatten)]
        input: InputArgs,

        /// Fitted pipeline JSON
        #[arg(short, long)]
        pipeline: PathBuf,

        /// Where to write the transformed CSV
        #[arg(short, long)]
        output: PathBuf,

        /// Undo the pipeline instead of applying it
        #[arg(long)]
        inverse: bool,
    },

    /// Compare a CSV batch against a pipeline's drift reference
    Drift {
        #[command(flatten)]
        input: InputArgs,

        /// Fitted pipeline JSON carrying a reference snapshot
        #[arg(short, long)]
        pipeline: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Exit with status 2 when any column drifted
        #[arg(long)]
        fail_on_drift: bool,

        /// Write a copy of the pipeline with its reference rebuilt from this batch
        #[arg(long)]
        recalibrate: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct InputArgs {
    /// Input file: .csv, .tsv, .parquet, .json or .ndjson/.jsonl
    #[arg(short, long)]
    input: PathBuf,

    /// Split the input into this many partitions and process them in parallel
    #[arg(long)]
    partitions: Option<usize>,
}

/// Initialize the tracing subscriber for logging.
///
/// `RUST_LOG` takes precedence over `--log-level`; `--quiet` lowers the
/// default to warnings.
fn init_logging(level: &str, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    let effective_level = if quiet { "warn" } else { level };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(effective_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.quiet);

    match cli.command {
        Command::Infer {
            input,
            config,
            output,
        } => {
            let config = load_config(config.as_deref())?;
            let schema = with_backend(&input, &config, |dataset, backend| {
                Ok(SchemaRegistry::new(config.inference.clone()).infer(dataset, backend)?)
            })?;
            write_json_or_print(output.as_deref(), &serde_json::to_string_pretty(&schema)?)?;
        }

        Command::Fit {
            input,
            stages,
            schema,
            config,
            output,
        } => {
            let config = load_config(config.as_deref())?;
            let stages: Vec<StageConfig> = read_json(&stages)?;
            let mut builder = Pipeline::builder().stages(stages).config(config.clone());
            if let Some(path) = schema {
                builder = builder.schema(read_json::<Schema>(&path)?);
            }
            let pipeline = builder.build()?;
            let fitted = with_backend(&input, &config, |dataset, backend| {
                Ok(pipeline.fit(dataset, backend)?)
            })?;
            std::fs::write(&output, fitted.serialize().to_json()?)
                .with_context(|| format!("writing {}", output.display()))?;
            info!(
                stages = fitted.stages().len(),
                path = %output.display(),
                "Pipeline written"
            );
        }

        Command::Transform {
            input,
            pipeline,
            output,
            inverse,
        } => {
            let fitted = load_pipeline(&pipeline)?;
            let config = PipelineConfig::default();
            let mut df = with_backend(&input, &config, |dataset, backend| {
                let result = if inverse {
                    fitted.inverse_transform(dataset, backend)?
                } else {
                    fitted.transform(dataset, backend)?
                };
                Ok(result.collect()?)
            })?;
            write_csv(&output, &mut df)?;
        }

        Command::Drift {
            input,
            pipeline,
            json,
            fail_on_drift,
            recalibrate,
        } => {
            let fitted = load_pipeline(&pipeline)?;
            let config = PipelineConfig::default();
            let (report, recalibrated) = with_backend(&input, &config, |dataset, backend| {
                let report = fitted.check_drift(dataset, backend)?;
                let recalibrated = match &recalibrate {
                    Some(_) => Some(fitted.recalibrate(dataset, backend)?),
                    None => None,
                };
                Ok((report, recalibrated))
            })?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_drift_report(&report);
            }
            if let (Some(path), Some(recalibrated)) = (recalibrate, recalibrated) {
                std::fs::write(&path, recalibrated.serialize().to_json()?)
                    .with_context(|| format!("writing {}", path.display()))?;
                info!(path = %path.display(), "Recalibrated pipeline written");
            }
            if report.any_drift() {
                warn!(columns = ?report.drifted_columns(), "Drift detected");
                if fail_on_drift {
                    return Ok(ExitCode::from(2));
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Backend chosen on the command line.
enum Backend {
    Eager(EagerBackend),
    Partitioned(PartitionedBackend),
}

impl ExecutionBackend for Backend {
    fn name(&self) -> &'static str {
        match self {
            Self::Eager(b) => b.name(),
            Self::Partitioned(b) => b.name(),
        }
    }

    fn aggregate<A, F>(&self, dataset: &Dataset, map: F) -> wipekit::WipekitResult<A>
    where
        A: Combine,
        F: Fn(&DataFrame) -> wipekit::WipekitResult<A> + Sync,
    {
        match self {
            Self::Eager(b) => b.aggregate(dataset, map),
            Self::Partitioned(b) => b.aggregate(dataset, map),
        }
    }

    fn map_partitions<F>(
        &self,
        dataset: &Dataset,
        plan: &MapPlan,
        task: F,
    ) -> wipekit::WipekitResult<Dataset>
    where
        F: Fn(&DataFrame, Option<&DataFrame>) -> wipekit::WipekitResult<DataFrame> + Sync,
    {
        match self {
            Self::Eager(b) => b.map_partitions(dataset, plan, task),
            Self::Partitioned(b) => b.map_partitions(dataset, plan, task),
        }
    }
}

/// Load the input and run `work` on the backend chosen by `--partitions`.
fn with_backend<T, F>(input: &InputArgs, config: &PipelineConfig, work: F) -> Result<T>
where
    F: FnOnce(&Dataset, &Backend) -> Result<T>,
{
    let df = load_dataset(&input.input)?;
    info!(rows = df.height(), columns = df.width(), "Dataset loaded");
    match input.partitions {
        Some(0) => Err(anyhow!("--partitions must be at least 1")),
        Some(count) => {
            let dataset = Dataset::from_frame_partitioned(&df, count)?;
            let backend = PartitionedBackend::from_config(&config.execution)?;
            debug!(partitions = count, threads = backend.parallelism(), "Partitioned backend");
            work(&dataset, &Backend::Partitioned(backend))
        }
        None => work(&Dataset::eager(df), &Backend::Eager(EagerBackend::new())),
    }
}

/// Tabular file formats the CLI reads, chosen by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputFormat {
    Csv,
    Tsv,
    Parquet,
    Json,
    JsonLines,
}

impl InputFormat {
    fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "csv" | "txt" => Ok(Self::Csv),
            "tsv" | "tab" => Ok(Self::Tsv),
            "parquet" | "pq" => Ok(Self::Parquet),
            "json" => Ok(Self::Json),
            "ndjson" | "jsonl" => Ok(Self::JsonLines),
            other => Err(anyhow!(
                "Unsupported input format '{}' for {} (expected csv, tsv, parquet, json, ndjson)",
                other,
                path.display()
            )),
        }
    }
}

fn load_dataset(path: &Path) -> Result<DataFrame> {
    if !path.exists() {
        return Err(anyhow!("Input file not found: {}", path.display()));
    }
    let format = InputFormat::from_path(path)?;
    debug!(?format, path = %path.display(), "Reading input");
    let df = match format {
        InputFormat::Csv => load_delimited(path, b',')?,
        InputFormat::Tsv => load_delimited(path, b'\t')?,
        InputFormat::Parquet => ParquetReader::new(std::fs::File::open(path)?).finish()?,
        InputFormat::Json => JsonReader::new(std::fs::File::open(path)?)
            .with_json_format(JsonFormat::Json)
            .finish()?,
        InputFormat::JsonLines => JsonReader::new(std::fs::File::open(path)?)
            .with_json_format(JsonFormat::JsonLines)
            .finish()?,
    };
    Ok(df)
}

fn load_delimited(path: &Path, separator: u8) -> Result<DataFrame> {
    CsvReadOptions::default()
        .with_infer_schema_length(Some(100))
        .with_has_header(true)
        .with_parse_options(
            CsvParseOptions::default()
                .with_separator(separator)
                .with_quote_char(Some(b'"')),
        )
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()
        .with_context(|| format!("reading {}", path.display()))
}

fn write_csv(path: &Path, df: &mut DataFrame) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(path)?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .with_separator(b',')
        .with_quote_char(b'"')
        .finish(df)?;
    info!(rows = df.height(), path = %path.display(), "Dataset saved");
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => read_json::<PipelineConfig>(path)?,
        None => PipelineConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn load_pipeline(path: &Path) -> Result<FittedPipeline> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let serialized = SerializedPipeline::from_json(&text)?;
    Ok(FittedPipeline::deserialize(serialized, &StageRegistry::with_defaults())?)
}

fn write_json_or_print(path: Option<&Path>, json: &str) -> Result<()> {
    match path {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
            info!(path = %path.display(), "Written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

/// Print the drift report as a table.
///
/// Uses `println!` intentionally: this is the command's output, not a log.
fn print_drift_report(report: &DriftReport) {
    println!(
        "{:<24} {:<10} {:>12} {:>12}  {}",
        "Column", "Statistic", "Value", "Threshold", "Drifted"
    );
    println!("{}", "-".repeat(70));
    for (name, drift) in &report.columns {
        println!(
            "{:<24} {:<10} {:>12.6} {:>12.4}  {}",
            truncate_str(name, 23),
            format!("{:?}", drift.statistic),
            drift.value,
            drift.threshold,
            if drift.drifted { "yes" } else { "no" }
        );
    }
}

fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_format_from_extension() {
        assert_eq!(InputFormat::from_path(Path::new("a.csv")).unwrap(), InputFormat::Csv);
        assert_eq!(InputFormat::from_path(Path::new("a.TSV")).unwrap(), InputFormat::Tsv);
        assert_eq!(
            InputFormat::from_path(Path::new("dir/a.parquet")).unwrap(),
            InputFormat::Parquet
        );
        assert_eq!(InputFormat::from_path(Path::new("a.json")).unwrap(), InputFormat::Json);
        assert_eq!(
            InputFormat::from_path(Path::new("a.jsonl")).unwrap(),
            InputFormat::JsonLines
        );
        assert!(InputFormat::from_path(Path::new("a.xlsx")).is_err());
        assert!(InputFormat::from_path(Path::new("noext")).is_err());
    }

    #[test]
    fn test_load_tsv_and_json_lines() {
        let dir = std::env::temp_dir().join(format!("wipekit-cli-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let tsv = dir.join("rows.tsv");
        std::fs::write(&tsv, "x\tcity\n1\tOslo\n2\tRome\n").unwrap();
        let df = load_dataset(&tsv).unwrap();
        assert_eq!(df.shape(), (2, 2));
        assert_eq!(df.column("city").unwrap().as_materialized_series().str().unwrap().get(1), Some("Rome"));

        let ndjson = dir.join("rows.ndjson");
        std::fs::write(&ndjson, "{\"x\":1,\"city\":\"Oslo\"}\n{\"x\":2,\"city\":\"Rome\"}\n")
            .unwrap();
        let df = load_dataset(&ndjson).unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.column("x").unwrap().as_materialized_series().i64().unwrap().get(1), Some(2));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_truncate_str_is_char_safe() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("détérioration", 8), "détér...");
    }
}
