use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use nnir::{
    deserialize, estimate_static_ranges,
    quantization::{default_range, NamedRanges},
    quantize_graph, serialize, serialization::serialize_into, translate_model, Graph,
    QuantizationScheme, QuantizerOptions, RangeTracker, SourceModel, TranslatorOptions,
};
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Log as JSON lines
    #[arg(long, env = "NNIR_LOG_JSON", global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Translate a JSON source model into a serialized graph
    Translate {
        #[arg(short = 'm', long)]
        model: PathBuf,

        #[arg(short = 'o', long)]
        output: PathBuf,

        /// Keep operators the translator does not know as StandIn layers
        #[arg(long, env = "NNIR_STAND_IN")]
        stand_in: bool,
    },
    /// Quantize a serialized graph
    Quantize {
        #[arg(short = 'i', long)]
        input: PathBuf,

        #[arg(short = 'o', long)]
        output: PathBuf,

        #[arg(long, env = "NNIR_SCHEME", default_value = "qasymmu8")]
        scheme: QuantizationScheme,

        /// Keep float inputs and outputs, quantizing at the boundaries
        #[arg(long)]
        preserve_type: bool,

        /// JSON map from layer name to the observed range of each of its outputs. Slots it
        /// does not cover use statically estimated ranges.
        #[arg(short = 'r', long)]
        ranges: Option<PathBuf>,
    },
    /// Print a JSON summary of a serialized graph
    Inspect {
        #[arg(short = 'i', long)]
        input: PathBuf,
    },
}

fn setup_logging(json: bool) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    if json {
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_level(true)
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .context("setting up logging failed")?;
    } else {
        let subscriber = tracing_subscriber::fmt()
            .compact()
            .with_level(true)
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .context("setting up logging failed")?;
    }
    Ok(())
}

fn read_graph(path: &Path) -> Result<Graph> {
    let buffer = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    deserialize(&buffer).with_context(|| format!("deserializing {}", path.display()))
}

fn write_graph(graph: &Graph, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut sink = BufWriter::new(file);
    serialize_into(graph, &mut sink).context("serializing graph")?;
    sink.flush()
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn run_translate(model: &Path, output: &Path, stand_in: bool) -> Result<()> {
    let json =
        std::fs::read_to_string(model).with_context(|| format!("reading {}", model.display()))?;
    let model = SourceModel::from_json(&json).context("parsing source model")?;
    let graph = translate_model(
        &model,
        TranslatorOptions {
            stand_in_for_unsupported: stand_in,
        },
    )
    .context("translating source model")?;
    write_graph(&graph, output)?;
    info!("wrote {} layers to {}", graph.num_layers(), output.display());
    Ok(())
}

/// Named ranges first, static estimates for every slot they leave out.
fn collect_ranges(graph: &Graph, named: Option<&Path>) -> Result<RangeTracker> {
    let estimated = estimate_static_ranges(graph).context("estimating ranges")?;
    let Some(path) = named else {
        return Ok(estimated);
    };
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let named: NamedRanges = serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("parsing ranges from {}", path.display()))?;
    let mut tracker = RangeTracker::new().with_default_range(default_range());
    tracker.record_named(graph, &named)?;
    for (_, layer) in graph.layers() {
        for slot in 0..layer.outputs().len() {
            if tracker.has_range(layer.guid(), slot) {
                continue;
            }
            if let Some((min, max)) = estimated.range(layer.guid(), slot) {
                tracker.set_range(layer.guid(), slot, min, max)?;
            }
        }
    }
    info!("{} named range entries loaded", named.0.len());
    Ok(tracker)
}

fn run_quantize(
    input: &Path,
    output: &Path,
    options: QuantizerOptions,
    ranges: Option<&Path>,
) -> Result<()> {
    let graph = read_graph(input)?;
    let tracker = collect_ranges(&graph, ranges)?;
    let quantized = quantize_graph(&graph, &tracker, options).context("quantizing graph")?;
    write_graph(&quantized, output)
}

fn summary(graph: &Graph) -> serde_json::Value {
    let layers = graph
        .topological_order()
        .into_iter()
        .map(|id| {
            let layer = &graph[id];
            let outputs = layer
                .outputs()
                .iter()
                .map(|slot| match slot.tensor_info() {
                    Some(info) => serde_json::json!({
                        "shape": info.shape().dims(),
                        "type": info.data_type().to_string(),
                        "scale": info.scale(),
                        "offset": info.offset(),
                    }),
                    None => serde_json::Value::Null,
                })
                .collect::<Vec<_>>();
            serde_json::json!({
                "name": layer.name(),
                "kind": layer.kind().name(),
                "outputs": outputs,
            })
        })
        .collect::<Vec<_>>();
    serde_json::json!({
        "inputs": graph.input_bindings(),
        "outputs": graph.output_bindings(),
        "layers": layers,
    })
}

fn run_inspect(input: &Path) -> Result<serde_json::Value> {
    let graph = read_graph(input)?;
    // the buffer must survive being written again
    serialize(&graph).context("reserializing graph")?;
    Ok(summary(&graph))
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.json)?;
    match args.command {
        Command::Translate {
            model,
            output,
            stand_in,
        } => run_translate(&model, &output, stand_in),
        Command::Quantize {
            input,
            output,
            scheme,
            preserve_type,
            ranges,
        } => run_quantize(
            &input,
            &output,
            QuantizerOptions {
                scheme,
                preserve_type,
            },
            ranges.as_deref(),
        ),
        Command::Inspect { input } => {
            let summary = run_inspect(&input)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = r#"{
        "tensors": [
            {"name": "x", "shape": [1, 4], "type": "FLOAT32"},
            {"name": "y", "shape": [1, 4], "type": "FLOAT32"},
            {"name": "z", "shape": [1, 4], "type": "FLOAT32"}
        ],
        "operators": [
            {"op": "RELU", "inputs": [0], "outputs": [1]},
            {"op": "LOGISTIC", "inputs": [1], "outputs": [2]}
        ],
        "inputs": [0],
        "outputs": [2]
    }"#;

    #[test]
    fn test_translate_quantize_inspect() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let model = dir.path().join("model.json");
        let float = dir.path().join("float.nnir");
        let quantized = dir.path().join("quantized.nnir");
        let ranges = dir.path().join("ranges.json");
        std::fs::write(&model, MODEL)?;
        std::fs::write(&ranges, r#"{"x": [[-2.0, 2.0]]}"#)?;

        run_translate(&model, &float, false)?;
        let float_summary = run_inspect(&float)?;
        assert_eq!(float_summary["layers"].as_array().map(Vec::len), Some(4));
        assert_eq!(float_summary["outputs"][0], 2 << 8);

        run_quantize(
            &float,
            &quantized,
            QuantizerOptions::default(),
            Some(ranges.as_path()),
        )?;
        let summary = run_inspect(&quantized)?;
        let input = &summary["layers"][0];
        assert_eq!(input["name"], "x");
        assert_eq!(input["outputs"][0]["type"], "QAsymmU8");
        // [-2, 2] over 255 steps
        let scale = input["outputs"][0]["scale"].as_f64().unwrap_or_default();
        assert!((scale - 4.0 / 255.0).abs() < 1e-6, "scale {scale}");
        Ok(())
    }

    #[test]
    fn test_unknown_range_layer_is_reported() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let model = dir.path().join("model.json");
        let float = dir.path().join("float.nnir");
        let ranges = dir.path().join("ranges.json");
        std::fs::write(&model, MODEL)?;
        std::fs::write(&ranges, r#"{"nope": [[0.0, 1.0]]}"#)?;
        run_translate(&model, &float, false)?;
        let result = run_quantize(
            &float,
            &dir.path().join("out.nnir"),
            QuantizerOptions::default(),
            Some(ranges.as_path()),
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "nnir", "--json", "quantize", "-i", "a", "-o", "b", "--scheme", "qsymm16",
        ])
        .unwrap();
        assert!(args.json);
        let Command::Quantize { scheme, .. } = args.command else {
            panic!("expected the quantize command");
        };
        assert_eq!(scheme, QuantizationScheme::QSymmS16);
    }
}
