// main.rs

// --- External Crate Imports ---
use anyhow::{anyhow, Context, Error, Result};
use clap::Parser;
use env_logger;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use ndarray::Array2;
use std::{
    collections::{HashMap, HashSet},
    path::Path,
    time::Instant,
};

// --- Main Function ---
fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting dnam-age with args: {:?}", cli_args);

    if cli_args.chunk_size == 0 {
        return Err(anyhow!("--chunk-size must be at least 1."));
    }

    // --- 1. Load Coefficient Table ---
    info!(
        "Loading model coefficients from: {}",
        cli_args.coefficients.display()
    );
    let table = coefficients::CoefficientTable::from_path(&cli_args.coefficients)?;
    info!(
        "Coefficient table loaded: {} probes, {} model(s): {:?}",
        table.probe_ids.len(),
        table.model_names.len(),
        table.model_names
    );

    let selected_models = select_models(&table, cli_args.models.as_deref())?;
    info!("Estimating DNAm age for {} model(s).", selected_models.len());

    // --- 2. Extract Sample Metadata ---
    info!(
        "Extracting sample metadata from: {} (control marker: '{}')",
        cli_args.metadata.display(),
        cli_args.control_marker
    );
    let samples = metadata::extract_from_path(&cli_args.metadata, &cli_args.control_marker)?;
    if samples.is_empty() {
        return Err(anyhow!(
            "No samples matched control marker '{}' in {}.",
            cli_args.control_marker,
            cli_args.metadata.display()
        ));
    }
    let n_with_age = samples.iter().filter(|s| s.age.is_some()).count();
    info!(
        "Retained {} control sample(s); {} with known chronological age.",
        samples.len(),
        n_with_age
    );

    // --- 3. Stream and Filter the Methylation Matrix ---
    info!(
        "Streaming methylation matrix from: {} (chunk size: {} rows)",
        cli_args.matrix.display(),
        cli_args.chunk_size
    );
    let pb_style = ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {msg}")
        .map_err(|e| anyhow!("Failed to create progress style: {}", e))?;
    let pb = ProgressBar::new_spinner().with_style(pb_style);

    let keep_probes: HashSet<String> = table.probe_ids.iter().cloned().collect();
    let keep_samples: Vec<String> = samples.iter().map(|s| s.id.clone()).collect();
    let matrix = methylation::load_filtered_gz(
        &cli_args.matrix,
        &keep_probes,
        &keep_samples,
        cli_args.chunk_size,
        Some(&pb),
    )?;
    pb.finish_with_message("Matrix streaming complete.");
    info!(
        "Filtered matrix: {} probe(s) x {} sample(s) retained.",
        matrix.probe_ids.len(),
        matrix.sample_ids.len()
    );

    // --- 4. Predict Ages, Summarize, Plot ---
    let ages: Vec<f64> = samples
        .iter()
        .map(|s| s.age.unwrap_or(f64::NAN))
        .collect();

    let mut predictions = Vec::with_capacity(selected_models.len());
    let mut summaries = Vec::with_capacity(selected_models.len());
    for &model_idx in &selected_models {
        let prediction = predictor::predict_model(&table, model_idx, &matrix, cli_args.adult_age);
        if prediction.n_probes_missing > 0 {
            warn!(
                "Model '{}': {} of {} referenced probe(s) absent from the matrix; \
                 prediction coverage degraded.",
                prediction.model,
                prediction.n_probes_missing,
                prediction.n_probes_missing + prediction.n_probes_used
            );
        }

        let r = stats::pearson_correlation(&ages, &prediction.ages);
        let mae = stats::median_abs_error(&ages, &prediction.ages);
        let n_complete = stats::complete_pairs(&ages, &prediction.ages).len();
        info!(
            "Model '{}': r = {}, MAE = {} over {} complete sample(s) ({} probe(s) used).",
            prediction.model,
            r.map_or("n/a".to_string(), |v| format!("{:.3}", v)),
            mae.map_or("n/a".to_string(), |v| format!("{:.2} years", v)),
            n_complete,
            prediction.n_probes_used
        );

        summaries.push(plot::PanelSummary { r, mae, n_complete });
        predictions.push(prediction);
    }

    info!("Rendering figure to: {}", cli_args.out.display());
    plot::render_figure(&cli_args.out, &ages, &predictions, &summaries)?;

    if let Some(pred_path) = &cli_args.predictions_out {
        info!("Writing prediction table to: {}", pred_path.display());
        output_writer::write_predictions(pred_path, &samples, &predictions)?;
    }

    info!(
        "dnam-age finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

/// Resolves the requested model subset against the coefficient table,
/// preserving coefficient-column order so panel layout stays deterministic.
fn select_models(
    table: &coefficients::CoefficientTable,
    requested: Option<&[String]>,
) -> Result<Vec<usize>> {
    let Some(requested) = requested else {
        return Ok((0..table.model_names.len()).collect());
    };
    for name in requested {
        if !table.model_names.iter().any(|m| m == name) {
            return Err(anyhow!(
                "Unknown model '{}'. Available models: {:?}.",
                name,
                table.model_names
            ));
        }
    }
    Ok(table
        .model_names
        .iter()
        .enumerate()
        .filter(|(_, m)| requested.iter().any(|r| r == *m))
        .map(|(i, _)| i)
        .collect())
}

// --- Module Implementations ---

mod cli {
    use clap::Parser; // For the derive macro to find Parser
    use std::path::PathBuf;

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Estimate DNAm age from methylation beta-value matrices.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        /// Semicolon-delimited coefficient table (probe column + one column per model).
        #[arg(short = 'c', long = "coefficients", required = true)]
        pub(crate) coefficients: PathBuf,

        /// Tab-separated sample descriptor table (sample_id, title, characteristics, age).
        #[arg(short = 'm', long = "metadata", required = true)]
        pub(crate) metadata: PathBuf,

        /// Gzip-compressed comma-separated beta-value matrix.
        #[arg(short = 'x', long = "matrix", required = true)]
        pub(crate) matrix: PathBuf,

        /// Output path for the composed figure (PNG).
        #[arg(short = 'o', long = "out", required = true)]
        pub(crate) out: PathBuf,

        /// Subset of model columns to evaluate (default: all).
        #[arg(long, value_delimiter = ',')]
        pub(crate) models: Option<Vec<String>>,

        /// Rows per streamed chunk when filtering the matrix.
        #[arg(long, default_value_t = 10_000)]
        pub(crate) chunk_size: usize,

        /// Adult-age anchor of the piecewise back-transform.
        #[arg(long, default_value_t = 20.0)]
        pub(crate) adult_age: f64,

        /// Substring marking retained samples in the characteristics field.
        #[arg(long, default_value = "Control")]
        pub(crate) control_marker: String,

        /// Optional TSV of per-sample predictions.
        #[arg(long)]
        pub(crate) predictions_out: Option<PathBuf>,

        #[arg(long, default_value = "Info")]
        pub(crate) log_level: String,
    }
}

mod coefficients {
    use super::{Array2, Context, HashMap, Path, Result};
    use std::io::Read;
    use thiserror::Error;

    /// Row label of the intercept entry, as written by lm-style coefficient exports.
    pub(crate) const INTERCEPT_SENTINEL: &str = "(Intercept)";

    #[derive(Debug, Error)]
    pub(crate) enum CoefficientError {
        #[error("failed to read coefficient table: {0}")]
        Read(#[from] csv::Error),
        #[error("coefficient table has no model columns")]
        NoModels,
        #[error("coefficient table has no probe rows")]
        Empty,
        #[error("row {row}: expected {expected} fields, found {found}")]
        RowWidth {
            row: usize,
            expected: usize,
            found: usize,
        },
        #[error("row {row} ('{probe}'): unparsable coefficient '{value}' for model '{model}'")]
        BadCoefficient {
            row: usize,
            probe: String,
            model: String,
            value: String,
        },
        #[error("duplicate probe identifier '{0}' in coefficient table")]
        DuplicateProbe(String),
        #[error("coefficient table has no '(Intercept)' row")]
        MissingIntercept,
    }

    /// Per-probe linear model coefficients for one or more named model
    /// variants, plus one intercept per model. Immutable after load.
    #[derive(Debug)]
    pub(crate) struct CoefficientTable {
        pub(crate) model_names: Vec<String>,
        /// Non-intercept probes, in file order.
        pub(crate) probe_ids: Vec<String>,
        pub(crate) probe_index: HashMap<String, usize>,
        /// probes x models. Zero means "probe unused by this model".
        pub(crate) coefficients: Array2<f64>,
        pub(crate) intercepts: Vec<f64>,
    }

    impl CoefficientTable {
        pub(crate) fn from_path(path: &Path) -> Result<Self> {
            let file = std::fs::File::open(path)
                .with_context(|| format!("Failed to open coefficient table {}", path.display()))?;
            let table = Self::load(file)
                .with_context(|| format!("Failed to parse coefficient table {}", path.display()))?;
            Ok(table)
        }

        pub(crate) fn load<R: Read>(reader: R) -> Result<Self, CoefficientError> {
            let mut rdr = csv::ReaderBuilder::new()
                .delimiter(b';')
                .has_headers(true)
                .flexible(true)
                .from_reader(reader);

            let headers = rdr
                .headers()?
                .iter()
                .map(|s| s.trim().to_string())
                .collect::<Vec<_>>();
            if headers.len() < 2 {
                return Err(CoefficientError::NoModels);
            }
            let model_names = headers[1..].to_vec();
            let expected = headers.len();

            let mut probe_ids = Vec::new();
            let mut probe_index: HashMap<String, usize> = HashMap::new();
            let mut rows: Vec<Vec<f64>> = Vec::new();
            let mut intercepts: Option<Vec<f64>> = None;

            for (row_idx, record) in rdr.records().enumerate() {
                let record = record?;
                let row = row_idx + 2; // 1-based, counting the header line
                if record.len() != expected {
                    return Err(CoefficientError::RowWidth {
                        row,
                        expected,
                        found: record.len(),
                    });
                }
                let probe = record[0].trim().to_string();
                let mut values = Vec::with_capacity(model_names.len());
                for (j, model) in model_names.iter().enumerate() {
                    let raw = record[j + 1].trim();
                    let value =
                        raw.parse::<f64>()
                            .map_err(|_| CoefficientError::BadCoefficient {
                                row,
                                probe: probe.clone(),
                                model: model.clone(),
                                value: raw.to_string(),
                            })?;
                    values.push(value);
                }

                if probe == INTERCEPT_SENTINEL {
                    if intercepts.is_some() {
                        return Err(CoefficientError::DuplicateProbe(probe));
                    }
                    intercepts = Some(values);
                    continue;
                }
                if probe_index.contains_key(&probe) {
                    return Err(CoefficientError::DuplicateProbe(probe));
                }
                probe_index.insert(probe.clone(), probe_ids.len());
                probe_ids.push(probe);
                rows.push(values);
            }

            let intercepts = intercepts.ok_or(CoefficientError::MissingIntercept)?;
            if probe_ids.is_empty() {
                return Err(CoefficientError::Empty);
            }

            let mut coefficients = Array2::<f64>::zeros((probe_ids.len(), model_names.len()));
            for (i, values) in rows.iter().enumerate() {
                for (j, &v) in values.iter().enumerate() {
                    coefficients[[i, j]] = v;
                }
            }

            Ok(Self {
                model_names,
                probe_ids,
                probe_index,
                coefficients,
                intercepts,
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::io::Cursor;

        const GOOD: &str = "probe;Horvath;Hannum\n\
                            (Intercept);0.696;12.4\n\
                            cg0001;0.5;0.0\n\
                            cg0002;-0.25;1.5\n";

        #[test]
        fn test_load_parses_models_probes_and_intercepts() {
            let table = CoefficientTable::load(Cursor::new(GOOD)).unwrap();
            assert_eq!(table.model_names, vec!["Horvath", "Hannum"]);
            assert_eq!(table.probe_ids, vec!["cg0001", "cg0002"]);
            assert_eq!(table.intercepts, vec![0.696, 12.4]);
            assert_eq!(table.coefficients[[0, 0]], 0.5);
            assert_eq!(table.coefficients[[1, 1]], 1.5);
            assert_eq!(table.probe_index["cg0002"], 1);
        }

        #[test]
        fn test_missing_intercept_row_is_an_error() {
            let input = "probe;M\ncg0001;0.5\n";
            let err = CoefficientTable::load(Cursor::new(input)).unwrap_err();
            assert!(matches!(err, CoefficientError::MissingIntercept));
        }

        #[test]
        fn test_ragged_row_is_an_error() {
            let input = "probe;M\n(Intercept);0.1\ncg0001;0.5;9.0\n";
            let err = CoefficientTable::load(Cursor::new(input)).unwrap_err();
            assert!(matches!(err, CoefficientError::RowWidth { row: 3, .. }));
        }

        #[test]
        fn test_unparsable_coefficient_names_the_record() {
            let input = "probe;M\n(Intercept);0.1\ncg0001;abc\n";
            let err = CoefficientTable::load(Cursor::new(input)).unwrap_err();
            match err {
                CoefficientError::BadCoefficient {
                    probe,
                    model,
                    value,
                    ..
                } => {
                    assert_eq!(probe, "cg0001");
                    assert_eq!(model, "M");
                    assert_eq!(value, "abc");
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[test]
        fn test_duplicate_probe_is_an_error() {
            let input = "probe;M\n(Intercept);0.1\ncg0001;0.5\ncg0001;0.7\n";
            let err = CoefficientTable::load(Cursor::new(input)).unwrap_err();
            assert!(matches!(err, CoefficientError::DuplicateProbe(p) if p == "cg0001"));
        }
    }
}

mod metadata {
    use super::{debug, Context, Path, Result};
    use std::io::Read;
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub(crate) enum MetadataError {
        #[error("failed to read sample descriptors: {0}")]
        Read(#[from] csv::Error),
        #[error("descriptor table is missing required column '{0}'")]
        MissingColumn(&'static str),
        #[error("row {row}: expected {expected} fields, found {found}")]
        RowWidth {
            row: usize,
            expected: usize,
            found: usize,
        },
        #[error("sample '{sample}': age field '{value}' has no ':' delimiter")]
        MissingAgeDelimiter { sample: String, value: String },
        #[error("sample '{sample}': non-numeric age '{value}'")]
        BadAge { sample: String, value: String },
    }

    /// One retained sample. `age` is `None` when the descriptor carries no
    /// chronological age; such a sample still receives predictions but is
    /// excluded from summary statistics.
    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct SampleRecord {
        pub(crate) id: String,
        pub(crate) name: String,
        pub(crate) age: Option<f64>,
    }

    pub(crate) fn extract_from_path(
        path: &Path,
        control_marker: &str,
    ) -> Result<Vec<SampleRecord>> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open sample descriptors {}", path.display()))?;
        let samples = extract(file, control_marker)
            .with_context(|| format!("Failed to parse sample descriptors {}", path.display()))?;
        Ok(samples)
    }

    /// Parses the descriptor table and keeps only samples whose
    /// characteristics field contains `control_marker`.
    pub(crate) fn extract<R: Read>(
        reader: R,
        control_marker: &str,
    ) -> Result<Vec<SampleRecord>, MetadataError> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let headers = rdr
            .headers()?
            .iter()
            .map(|s| s.trim().to_ascii_lowercase())
            .collect::<Vec<_>>();
        let col = |name: &'static str| -> Result<usize, MetadataError> {
            headers
                .iter()
                .position(|h| h.as_str() == name)
                .ok_or(MetadataError::MissingColumn(name))
        };
        let id_col = col("sample_id")?;
        let title_col = col("title")?;
        let characteristics_col = col("characteristics")?;
        let age_col = col("age")?;
        let expected = headers.len();

        let mut samples = Vec::new();
        for (row_idx, record) in rdr.records().enumerate() {
            let record = record?;
            let row = row_idx + 2;
            if record.len() != expected {
                return Err(MetadataError::RowWidth {
                    row,
                    expected,
                    found: record.len(),
                });
            }

            let id = record[id_col].trim().to_string();
            let characteristics = record[characteristics_col].trim();
            if !characteristics.contains(control_marker) {
                debug!(
                    "Sample '{}' dropped (characteristics '{}' lacks marker '{}').",
                    id, characteristics, control_marker
                );
                continue;
            }

            let title = record[title_col].trim();
            // Display name is the token before the first space; a title
            // with no space is used whole.
            let name = title.split(' ').next().unwrap_or(title).to_string();

            let age_field = record[age_col].trim();
            let age = if age_field.is_empty() {
                None
            } else {
                let (_, value) = age_field.split_once(':').ok_or_else(|| {
                    MetadataError::MissingAgeDelimiter {
                        sample: id.clone(),
                        value: age_field.to_string(),
                    }
                })?;
                let parsed = value
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| MetadataError::BadAge {
                        sample: id.clone(),
                        value: age_field.to_string(),
                    })?;
                Some(parsed)
            };

            samples.push(SampleRecord { id, name, age });
        }
        Ok(samples)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::io::Cursor;

        const HEADER: &str = "sample_id\ttitle\tcharacteristics\tage\n";

        #[test]
        fn test_control_sample_is_retained_and_parsed() {
            let input =
                format!("{HEADER}GSM1\tSample 12 [whatever]\tdisease state: Control\tage: 34\n");
            let samples = extract(Cursor::new(input), "Control").unwrap();
            assert_eq!(
                samples,
                vec![SampleRecord {
                    id: "GSM1".to_string(),
                    name: "Sample".to_string(),
                    age: Some(34.0),
                }]
            );
        }

        #[test]
        fn test_non_control_sample_is_dropped() {
            let input = format!(
                "{HEADER}GSM1\tS1\tdisease state: Tumor\tage: 60\n\
                 GSM2\tS2\tdisease state: Control\tage: 41\n"
            );
            let samples = extract(Cursor::new(input), "Control").unwrap();
            assert_eq!(samples.len(), 1);
            assert_eq!(samples[0].id, "GSM2");
        }

        #[test]
        fn test_spaceless_title_is_used_whole() {
            let input = format!("{HEADER}GSM1\tliver_03\tControl\tage: 55.5\n");
            let samples = extract(Cursor::new(input), "Control").unwrap();
            assert_eq!(samples[0].name, "liver_03");
            assert_eq!(samples[0].age, Some(55.5));
        }

        #[test]
        fn test_empty_age_is_missing_not_error() {
            let input = format!("{HEADER}GSM1\tS1\tControl\t\n");
            let samples = extract(Cursor::new(input), "Control").unwrap();
            assert_eq!(samples[0].age, None);
        }

        #[test]
        fn test_garbled_age_fails_loudly() {
            let input = format!("{HEADER}GSM1\tS1\tControl\tage: unknown\n");
            let err = extract(Cursor::new(input), "Control").unwrap_err();
            assert!(matches!(err, MetadataError::BadAge { sample, .. } if sample == "GSM1"));
        }

        #[test]
        fn test_age_without_delimiter_fails_loudly() {
            let input = format!("{HEADER}GSM1\tS1\tControl\t34\n");
            let err = extract(Cursor::new(input), "Control").unwrap_err();
            assert!(matches!(err, MetadataError::MissingAgeDelimiter { .. }));
        }

        #[test]
        fn test_missing_column_is_reported() {
            let input = "sample_id\ttitle\tage\nGSM1\tS1\tage: 3\n";
            let err = extract(Cursor::new(input), "Control").unwrap_err();
            assert!(matches!(
                err,
                MetadataError::MissingColumn("characteristics")
            ));
        }
    }
}

mod methylation {
    use super::{debug, Array2, Context, HashMap, HashSet, Path, ProgressBar, Result};
    use flate2::read::MultiGzDecoder;
    use std::io::{BufReader, Read};
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub(crate) enum MatrixError {
        #[error("failed to read methylation matrix: {0}")]
        Read(#[from] csv::Error),
        #[error("matrix header is empty")]
        EmptyHeader,
        #[error("sample '{0}' not present in the matrix header")]
        UnknownSample(String),
        #[error("line {line} ('{probe}'): expected {expected} fields, found {found}")]
        RowWidth {
            line: u64,
            probe: String,
            expected: usize,
            found: usize,
        },
        #[error("line {line} ('{probe}'): unparsable beta-value '{value}' for sample '{sample}'")]
        BadValue {
            line: u64,
            probe: String,
            sample: String,
            value: String,
        },
        #[error("duplicate probe row '{0}' in matrix")]
        DuplicateProbe(String),
    }

    /// Probes x samples beta-values, restricted to model-referenced probes
    /// and retained samples. `NaN` marks a missing measurement.
    #[derive(Debug)]
    pub(crate) struct MethylationMatrix {
        pub(crate) probe_ids: Vec<String>,
        pub(crate) probe_index: HashMap<String, usize>,
        pub(crate) sample_ids: Vec<String>,
        pub(crate) betas: Array2<f64>,
    }

    pub(crate) fn load_filtered_gz(
        path: &Path,
        keep_probes: &HashSet<String>,
        keep_samples: &[String],
        chunk_size: usize,
        progress: Option<&ProgressBar>,
    ) -> Result<MethylationMatrix> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open methylation matrix {}", path.display()))?;
        let decoder = MultiGzDecoder::new(BufReader::new(file));
        let matrix = load_filtered(decoder, keep_probes, keep_samples, chunk_size, progress)
            .with_context(|| format!("Failed to load methylation matrix {}", path.display()))?;
        Ok(matrix)
    }

    /// Streams the matrix in chunks of `chunk_size` rows, keeping only
    /// `keep_probes` rows and `keep_samples` columns. Chunking bounds peak
    /// memory; any chunk size produces the same matrix as loading the
    /// whole file at once.
    pub(crate) fn load_filtered<R: Read>(
        reader: R,
        keep_probes: &HashSet<String>,
        keep_samples: &[String],
        chunk_size: usize,
        progress: Option<&ProgressBar>,
    ) -> Result<MethylationMatrix, MatrixError> {
        assert!(chunk_size >= 1, "chunk_size must be at least 1");
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(b',')
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let headers = rdr
            .headers()?
            .iter()
            .map(|s| s.trim().to_string())
            .collect::<Vec<_>>();
        if headers.is_empty() {
            return Err(MatrixError::EmptyHeader);
        }
        let expected = headers.len();

        // Column projection is fixed once from the header: one matrix
        // column position per kept sample, in kept-sample order.
        let mut position_by_sample: HashMap<&str, usize> = HashMap::new();
        for (pos, name) in headers.iter().enumerate().skip(1) {
            position_by_sample.entry(name.as_str()).or_insert(pos);
        }
        let mut col_map = Vec::with_capacity(keep_samples.len());
        for sample in keep_samples {
            let pos = position_by_sample
                .get(sample.as_str())
                .ok_or_else(|| MatrixError::UnknownSample(sample.clone()))?;
            col_map.push(*pos);
        }

        let mut kept_rows: Vec<(String, Vec<f64>)> = Vec::new();
        let mut seen_probes: HashSet<String> = HashSet::new();
        let mut chunk: Vec<csv::StringRecord> = Vec::with_capacity(chunk_size);
        let mut rows_scanned: u64 = 0;
        let mut chunks_done: u64 = 0;

        for record in rdr.records() {
            chunk.push(record?);
            if chunk.len() == chunk_size {
                rows_scanned += chunk.len() as u64;
                filter_chunk(
                    &chunk,
                    expected,
                    &col_map,
                    keep_probes,
                    keep_samples,
                    &mut seen_probes,
                    &mut kept_rows,
                )?;
                chunk.clear();
                chunks_done += 1;
                if let Some(pb) = progress {
                    pb.set_message(format!(
                        "chunk {}: {} row(s) scanned, {} kept",
                        chunks_done,
                        rows_scanned,
                        kept_rows.len()
                    ));
                    pb.tick();
                }
            }
        }
        if !chunk.is_empty() {
            rows_scanned += chunk.len() as u64;
            filter_chunk(
                &chunk,
                expected,
                &col_map,
                keep_probes,
                keep_samples,
                &mut seen_probes,
                &mut kept_rows,
            )?;
            chunks_done += 1;
            if let Some(pb) = progress {
                pb.set_message(format!(
                    "chunk {}: {} row(s) scanned, {} kept",
                    chunks_done,
                    rows_scanned,
                    kept_rows.len()
                ));
                pb.tick();
            }
        }
        debug!(
            "Matrix scan complete: {} row(s) scanned, {} kept.",
            rows_scanned,
            kept_rows.len()
        );

        let mut probe_ids = Vec::with_capacity(kept_rows.len());
        let mut probe_index = HashMap::with_capacity(kept_rows.len());
        let mut betas = Array2::<f64>::zeros((kept_rows.len(), keep_samples.len()));
        for (i, (probe, values)) in kept_rows.into_iter().enumerate() {
            for (j, v) in values.into_iter().enumerate() {
                betas[[i, j]] = v;
            }
            probe_index.insert(probe.clone(), i);
            probe_ids.push(probe);
        }

        Ok(MethylationMatrix {
            probe_ids,
            probe_index,
            sample_ids: keep_samples.to_vec(),
            betas,
        })
    }

    fn filter_chunk(
        chunk: &[csv::StringRecord],
        expected: usize,
        col_map: &[usize],
        keep_probes: &HashSet<String>,
        keep_samples: &[String],
        seen_probes: &mut HashSet<String>,
        kept_rows: &mut Vec<(String, Vec<f64>)>,
    ) -> Result<(), MatrixError> {
        for record in chunk {
            let line = record.position().map_or(0, |p| p.line());
            let probe = record.get(0).unwrap_or("").trim().to_string();
            // Width is checked before the probe filter: a malformed row
            // fails the run even when its probe is outside the model set.
            if record.len() != expected {
                return Err(MatrixError::RowWidth {
                    line,
                    probe,
                    expected,
                    found: record.len(),
                });
            }
            if !keep_probes.contains(&probe) {
                continue;
            }
            if !seen_probes.insert(probe.clone()) {
                return Err(MatrixError::DuplicateProbe(probe));
            }

            let mut values = Vec::with_capacity(col_map.len());
            for (j, &pos) in col_map.iter().enumerate() {
                let raw = record[pos].trim();
                // Blank cell means a missing beta-value.
                if raw.is_empty() {
                    values.push(f64::NAN);
                    continue;
                }
                let value = raw.parse::<f64>().map_err(|_| MatrixError::BadValue {
                    line,
                    probe: probe.clone(),
                    sample: keep_samples[j].clone(),
                    value: raw.to_string(),
                })?;
                values.push(value);
            }
            kept_rows.push((probe, values));
        }
        Ok(())
    }

}

mod predictor {
    use super::{coefficients::CoefficientTable, methylation::MethylationMatrix};

    /// Per-sample predicted ages for one model variant. `NaN` marks a
    /// sample whose prediction is missing (some usable probe lacked a
    /// beta-value).
    #[derive(Debug)]
    pub(crate) struct ModelPrediction {
        pub(crate) model: String,
        pub(crate) ages: Vec<f64>,
        pub(crate) n_probes_used: usize,
        pub(crate) n_probes_missing: usize,
    }

    /// Piecewise back-transform from the linear predictor to the age
    /// scale. Strictly negative raw values take the exponential branch;
    /// zero and positive values the linear one, so transform(0) == adult_age.
    pub(crate) fn transform_age(raw: f64, adult_age: f64) -> f64 {
        if raw < 0.0 {
            (1.0 + adult_age) * raw.exp() - 1.0
        } else {
            (1.0 + adult_age) * raw + adult_age
        }
    }

    /// Computes intercept + dot(coefficients, betas) per sample, then
    /// back-transforms. Usable probes are the intersection of the model's
    /// non-zero-coefficient probes and the matrix's available probes; a
    /// referenced probe absent from the matrix degrades coverage rather
    /// than failing the run.
    pub(crate) fn predict_model(
        table: &CoefficientTable,
        model_idx: usize,
        matrix: &MethylationMatrix,
        adult_age: f64,
    ) -> ModelPrediction {
        let mut usable: Vec<(usize, f64)> = Vec::new();
        let mut n_probes_missing = 0usize;
        for (i, probe) in table.probe_ids.iter().enumerate() {
            let coeff = table.coefficients[[i, model_idx]];
            if coeff == 0.0 {
                continue;
            }
            match matrix.probe_index.get(probe) {
                Some(&row) => usable.push((row, coeff)),
                None => n_probes_missing += 1,
            }
        }

        let intercept = table.intercepts[model_idx];
        let n_samples = matrix.sample_ids.len();
        let mut ages = Vec::with_capacity(n_samples);
        for col in 0..n_samples {
            let mut raw = intercept;
            for &(row, coeff) in &usable {
                // A NaN beta propagates through the sum and the transform.
                raw += coeff * matrix.betas[[row, col]];
            }
            ages.push(transform_age(raw, adult_age));
        }

        ModelPrediction {
            model: table.model_names[model_idx].clone(),
            ages,
            n_probes_used: usable.len(),
            n_probes_missing,
        }
    }

}

mod stats {
    /// Pairs where both values are finite; missing observations on either
    /// side are excluded (pairwise-complete).
    pub(crate) fn complete_pairs(x: &[f64], y: &[f64]) -> Vec<(f64, f64)> {
        x.iter()
            .zip(y.iter())
            .filter(|(a, b)| a.is_finite() && b.is_finite())
            .map(|(&a, &b)| (a, b))
            .collect()
    }

    /// Pearson correlation over complete pairs. `None` when fewer than two
    /// pairs remain or either side is constant.
    pub(crate) fn pearson_correlation(x: &[f64], y: &[f64]) -> Option<f64> {
        let pairs = complete_pairs(x, y);
        if pairs.len() < 2 {
            return None;
        }

        let n = pairs.len() as f64;
        let mean_x = pairs.iter().map(|(a, _)| a).sum::<f64>() / n;
        let mean_y = pairs.iter().map(|(_, b)| b).sum::<f64>() / n;

        let (mut num, mut denom_x, mut denom_y) = (0.0, 0.0, 0.0);
        for &(a, b) in &pairs {
            let dx = a - mean_x;
            let dy = b - mean_y;
            num += dx * dy;
            denom_x += dx * dx;
            denom_y += dy * dy;
        }

        let denom = denom_x.sqrt() * denom_y.sqrt();
        if denom == 0.0 {
            return None;
        }
        Some(num / denom)
    }

    /// Median of |x - y| over complete pairs; even-length medians average
    /// the two central values. `None` when no complete pair exists.
    pub(crate) fn median_abs_error(x: &[f64], y: &[f64]) -> Option<f64> {
        let mut errors: Vec<f64> = complete_pairs(x, y)
            .into_iter()
            .map(|(a, b)| (a - b).abs())
            .collect();
        if errors.is_empty() {
            return None;
        }
        errors.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = errors.len() / 2;
        if errors.len() % 2 == 1 {
            Some(errors[mid])
        } else {
            Some((errors[mid - 1] + errors[mid]) / 2.0)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_pearson_on_perfectly_linear_data() {
            let x = [1.0, 2.0, 3.0, 4.0];
            let y = [2.0, 4.0, 6.0, 8.0];
            let r = pearson_correlation(&x, &y).unwrap();
            assert!((r - 1.0).abs() < 1e-12);
        }

        #[test]
        fn test_pearson_ignores_incomplete_pairs() {
            // Complete pairs are (1,2), (2,4), (3,6): exactly linear.
            let x = [1.0, 2.0, f64::NAN, 3.0, 10.0];
            let y = [2.0, 4.0, 5.0, 6.0, f64::NAN];
            let r = pearson_correlation(&x, &y).unwrap();
            assert!((r - 1.0).abs() < 1e-12);
        }

        #[test]
        fn test_pearson_hand_computed_value() {
            let x = [1.0, 2.0, 3.0];
            let y = [1.0, 3.0, 2.0];
            // num = 1, denom = sqrt(2)*sqrt(2) -> r = 0.5
            let r = pearson_correlation(&x, &y).unwrap();
            assert!((r - 0.5).abs() < 1e-12);
        }

        #[test]
        fn test_pearson_constant_side_is_none() {
            let x = [1.0, 1.0, 1.0];
            let y = [2.0, 3.0, 4.0];
            assert!(pearson_correlation(&x, &y).is_none());
        }

        #[test]
        fn test_mae_odd_count() {
            let x = [10.0, 20.0, 30.0];
            let y = [11.0, 25.0, 33.0];
            // sorted errors: 1, 3, 5 -> median 3
            assert_eq!(median_abs_error(&x, &y), Some(3.0));
        }

        #[test]
        fn test_mae_even_count_averages_middle() {
            let x = [10.0, 20.0, 30.0, 40.0];
            let y = [11.0, 22.0, 33.0, 44.0];
            // errors: 1, 2, 3, 4 -> (2+3)/2
            assert_eq!(median_abs_error(&x, &y), Some(2.5));
        }

        #[test]
        fn test_mae_ignores_missing_entries() {
            let x = [10.0, f64::NAN, 30.0];
            let y = [11.0, 20.0, f64::NAN];
            assert_eq!(median_abs_error(&x, &y), Some(1.0));
        }

        #[test]
        fn test_no_complete_pairs_is_none() {
            let x = [f64::NAN, 1.0];
            let y = [1.0, f64::NAN];
            assert!(pearson_correlation(&x, &y).is_none());
            assert!(median_abs_error(&x, &y).is_none());
        }
    }
}

mod plot {
    use super::{anyhow, predictor::ModelPrediction, stats, Path, Result};
    use plotters::prelude::*;

    const PANEL_WIDTH: u32 = 640;
    const PANEL_HEIGHT: u32 = 480;
    const FONT_SIZE_TITLE: u32 = 28;
    const FONT_SIZE_ANNOTATION: u32 = 18;
    const PLOT_MARGIN: u32 = 10;
    const AGE_AXIS_MIN: f64 = 0.0;
    const AGE_AXIS_MAX: f64 = 100.0;

    /// Summary statistics shown in one panel's annotation.
    #[derive(Debug, Clone, Copy)]
    pub(crate) struct PanelSummary {
        pub(crate) r: Option<f64>,
        pub(crate) mae: Option<f64>,
        pub(crate) n_complete: usize,
    }

    /// Panel grid for `n` models: squarish, filled row by row.
    pub(crate) fn panel_grid(n: usize) -> (usize, usize) {
        assert!(n > 0);
        let cols = (n as f64).sqrt().ceil() as usize;
        let rows = n.div_ceil(cols);
        (rows, cols)
    }

    fn annotation_label(summary: &PanelSummary) -> String {
        let r = summary.r.map_or("n/a".to_string(), |v| format!("{:.3}", v));
        let mae = summary
            .mae
            .map_or("n/a".to_string(), |v| format!("{:.1} y", v));
        format!("r = {}, MAE = {} (n = {})", r, mae, summary.n_complete)
    }

    /// Renders one chronological-vs-predicted scatter per model, composed
    /// into a single image. Panel order follows coefficient-column order.
    pub(crate) fn render_figure(
        path: &Path,
        chronological_ages: &[f64],
        predictions: &[ModelPrediction],
        summaries: &[PanelSummary],
    ) -> Result<()> {
        if predictions.is_empty() {
            return Err(anyhow!("No model predictions to plot."));
        }
        draw(path, chronological_ages, predictions, summaries)
            .map_err(|e| anyhow!("Failed to render figure {}: {}", path.display(), e))
    }

    fn draw(
        path: &Path,
        chronological_ages: &[f64],
        predictions: &[ModelPrediction],
        summaries: &[PanelSummary],
    ) -> Result<(), Box<dyn std::error::Error>> {
        let (rows, cols) = panel_grid(predictions.len());
        let figure_size = (cols as u32 * PANEL_WIDTH, rows as u32 * PANEL_HEIGHT);
        let root_area = BitMapBackend::new(path, figure_size).into_drawing_area();
        root_area.fill(&WHITE)?;
        let panels = root_area.split_evenly((rows, cols));

        for ((prediction, summary), panel) in
            predictions.iter().zip(summaries.iter()).zip(panels.iter())
        {
            let mut chart = ChartBuilder::on(panel)
                .margin(PLOT_MARGIN)
                .caption(&prediction.model, ("sans-serif", FONT_SIZE_TITLE))
                .x_label_area_size(40)
                .y_label_area_size(50)
                .build_cartesian_2d(AGE_AXIS_MIN..AGE_AXIS_MAX, AGE_AXIS_MIN..AGE_AXIS_MAX)?;

            chart
                .configure_mesh()
                .disable_mesh()
                .x_desc("Chronological age (years)")
                .y_desc("DNAm age (years)")
                .draw()?;

            // 1:1 reference line
            chart.draw_series(LineSeries::new(
                vec![(AGE_AXIS_MIN, AGE_AXIS_MIN), (AGE_AXIS_MAX, AGE_AXIS_MAX)],
                &RED,
            ))?;

            let points = stats::complete_pairs(chronological_ages, &prediction.ages);
            chart.draw_series(
                points
                    .iter()
                    .map(|&(x, y)| Circle::new((x, y), 3, BLUE.filled())),
            )?;

            chart.draw_series(std::iter::once(Text::new(
                annotation_label(summary),
                (5.0, 95.0),
                ("sans-serif", FONT_SIZE_ANNOTATION),
            )))?;
        }

        root_area.present()?;
        Ok(())
    }

}

mod output_writer {
    use super::{anyhow, metadata::SampleRecord, predictor::ModelPrediction, Path, Result};
    use std::fs::File;
    use std::io::{BufWriter, Write};

    /// Writes one row per retained sample: identifier, display name,
    /// chronological age, and one predicted-age column per model. Missing
    /// values are written as NA.
    pub(crate) fn write_predictions(
        path: &Path,
        samples: &[SampleRecord],
        predictions: &[ModelPrediction],
    ) -> Result<()> {
        let file = File::create(path)
            .map_err(|e| anyhow!("Failed to create output file {}: {}", path.display(), e))?;
        let mut writer = BufWriter::new(file);

        write!(writer, "sample_id\tname\tage")?;
        for prediction in predictions {
            write!(writer, "\t{}", prediction.model)?;
        }
        writeln!(writer)?;

        for (sample_idx, sample) in samples.iter().enumerate() {
            write!(writer, "{}\t{}", sample.id, sample.name)?;
            match sample.age {
                Some(age) => write!(writer, "\t{}", age)?,
                None => write!(writer, "\tNA")?,
            }
            for prediction in predictions {
                let value = prediction.ages[sample_idx];
                if value.is_finite() {
                    write!(writer, "\t{:.3}", value)?;
                } else {
                    write!(writer, "\tNA")?;
                }
            }
            writeln!(writer)?;
        }
        Ok(())
    }

}
