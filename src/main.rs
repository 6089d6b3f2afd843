use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, Receiver, Sender};
use csv::Writer;
use glob::glob;
use indicatif::{ProgressBar, ProgressStyle};
use lazy_static::lazy_static;
use log::{debug, error, info, warn, LevelFilter};
use rayon::prelude::*;
use regex::Regex;
use roxmltree::Document;
use simple_logger::SimpleLogger;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::env;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use time::macros::format_description;

#[derive(Parser)]
#[command(name = "Machine Vision Report Parser")]
#[command(about = "Extract well measurement records from machine vision inspection reports into per-lot CSV files")]
#[command(version = "1.0")]
struct Cli {
    #[arg(short, long, help = "Directory searched recursively for report files", required = true)]
    input: String,

    #[arg(short, long, help = "Output directory for the per-lot CSV files (defaults to the input directory)")]
    output: Option<String>,

    #[arg(long, help = "Write the per-lot CSV files to the current working directory")]
    cwd: bool,

    #[arg(short, long, help = "Suppress progress and status output")]
    silent: bool,

    #[arg(short, long, default_value = "INFO", help = "Logging level (DEBUG, INFO, WARN, ERROR)")]
    log_level: String,

    #[arg(short, long, default_value = "0", help = "Number of worker threads to use (0 for auto)")]
    threads: usize,
}

const REPORT_FILE_NAME: &str = "details.xml";
const DETAILS_ITEM_TAG: &str = "InspectionDetailsItem";
const BARCODE_ITEM: &str = "Bar Code";
const RESULTS_ITEM: &str = "Results";
const RECORD_MARKER: &str = "<td>";
const WELL_COLUMN: &str = "Well";
const LOT_COLUMN: &str = "Lot";
const OPTICAL_PREFIX: &str = "Optical_";
const SPOT_PREFIX: &str = "Spot_";
const PORT_PREFIX: &str = "Port_";
const BARCODE_MIN_LEN: usize = 11;

lazy_static! {
    // The well label sits in a bolded, centered cell at the top of each sub-report.
    static ref WELL_RE: Regex = Regex::new(r"<center><b>([A-Za-z]+\d+)</b></center>").unwrap();
    static ref WELL_PARTS_RE: Regex = Regex::new(r"([A-Za-z]+)(\d+)").unwrap();
    // Anchor phrases framing the three measurement sections of a sub-report.
    static ref OPTICAL_SECTION_RE: Regex = Regex::new(r"Optical Window(.*?)Spot 1").unwrap();
    static ref SPOT_SECTION_RE: Regex = Regex::new(r"Spot 1(.*?)Ports").unwrap();
    static ref PORTS_SECTION_RE: Regex = Regex::new(r"Ports(.*)").unwrap();
    static ref TAG_RE: Regex = Regex::new(r"<[^>]*>").unwrap();
    // Downstream consumers rely on the exact value class, so keep it as [\d\.\-].
    static ref PAIR_RE: Regex = Regex::new(r"([^:]+):\s*([\d\.\-]+)").unwrap();
    static ref KEY_SEPARATOR_RE: Regex = Regex::new(r"[\s-]").unwrap();
    static ref PORT_RE: Regex = Regex::new(r"Port (\d+), diameter:\s*([\d\.\-]+)").unwrap();
}

/// Lot identifier derived from a report's barcode; groups output files.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct Lot(String);

/// One well record: column name to value, as extracted from a single fragment.
type Row = HashMap<String, String>;

struct RunConfig {
    search_root: PathBuf,
    output_root: PathBuf,
    silent: bool,
}

/// The two item values pulled from a report's envelope. Either may be empty
/// when the corresponding entry is absent.
#[derive(Debug, Default)]
struct RawDetails {
    barcode: String,
    results: String,
}

/// Complete per-file output, sent once to the collector. The file index is the
/// position in the sorted discovery list and fixes the cross-file tiebreak.
#[derive(Debug, Clone)]
struct RowBatch {
    file_index: usize,
    rows: Vec<Row>,
}

struct ProcessedFileResult {
    rows_extracted: usize,
    error: Option<anyhow::Error>,
    filepath: PathBuf,
}

struct PipelineOutcome {
    files_ok: usize,
    files_failed: Vec<PathBuf>,
    rows_extracted: usize,
    outputs: Vec<PathBuf>,
}

/// Recursively locates every report file under `root` by exact base name.
/// The returned list is sorted so downstream file indices are reproducible
/// regardless of traversal order.
fn find_report_files(root: &Path) -> Result<Vec<PathBuf>> {
    fs::metadata(root)
        .with_context(|| format!("Search directory not accessible: {}", root.display()))?;

    let pattern = root.join("**").join(REPORT_FILE_NAME);
    let pattern_str = pattern.to_string_lossy();
    info!("Searching for {} files under: {}", REPORT_FILE_NAME, root.display());

    let mut files = Vec::new();
    for entry in
        glob(&pattern_str).with_context(|| format!("Invalid search pattern: {}", pattern_str))?
    {
        let path = entry.context("Failed to read a directory entry during the search")?;
        files.push(path);
    }
    files.sort();

    if files.is_empty() {
        warn!("No files found matching the pattern: {}", pattern_str);
    }
    Ok(files)
}

fn element_text(item: roxmltree::Node<'_, '_>, name: &str) -> String {
    item.children()
        .find(|child| child.has_tag_name(name))
        .map(|child| {
            child
                .children()
                .filter(|grandchild| grandchild.is_text())
                .filter_map(|grandchild| grandchild.text())
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Decodes one report file into its barcode and results strings. The item list
/// may contain any number of unrelated entries in any order; only the entries
/// named "Bar Code" and "Results" are consumed.
fn extract_report_details(path: &Path) -> Result<RawDetails> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read report file: {}", path.display()))?;
    let document = Document::parse(&contents)
        .with_context(|| format!("Failed to parse report XML: {}", path.display()))?;

    let mut details = RawDetails::default();
    for item in document
        .descendants()
        .filter(|node| node.has_tag_name(DETAILS_ITEM_TAG))
    {
        match element_text(item, "Name").as_str() {
            BARCODE_ITEM => details.barcode = element_text(item, "Details"),
            RESULTS_ITEM => details.results = element_text(item, "Details"),
            _ => {}
        }
    }
    Ok(details)
}

/// Splits the results blob into one fragment per well sub-report. The piece
/// before the first marker is preamble; whitespace-only pieces carry nothing.
fn split_well_fragments(results: &str) -> Vec<&str> {
    results
        .split(RECORD_MARKER)
        .skip(1)
        .filter(|fragment| !fragment.trim().is_empty())
        .collect()
}

/// Normalizes a raw well label so the numeric part is at least two digits
/// (`A5` becomes `A05`). Labels that do not look like a well pass through.
fn zero_pad_well(label: &str) -> String {
    match WELL_PARTS_RE.captures(label) {
        Some(caps) => {
            let letters = &caps[1];
            let number = &caps[2];
            if number.len() == 1 {
                format!("{}0{}", letters, number)
            } else {
                format!("{}{}", letters, number)
            }
        }
        None => label.to_string(),
    }
}

fn extract_labeled_values(text: &str, prefix: &str, row: &mut Row) {
    let clean_text = TAG_RE.replace_all(text, "");
    for caps in PAIR_RE.captures_iter(&clean_text) {
        let label = KEY_SEPARATOR_RE.replace_all(caps[1].trim(), "_");
        row.insert(format!("{}{}", prefix, label), caps[2].trim().to_string());
    }
}

fn extract_port_diameters(text: &str, row: &mut Row) {
    let clean_text = TAG_RE.replace_all(text, "");
    for caps in PORT_RE.captures_iter(&clean_text) {
        row.insert(
            format!("Port_{}_diameter", &caps[1]),
            caps[2].trim().to_string(),
        );
    }
}

/// Parses one fragment into a row via four independent sub-extractions. A
/// missing anchor phrase means that section contributes nothing; a fragment
/// with no matches at all yields an empty row.
fn extract_well_row(fragment: &str) -> Row {
    let mut row = Row::new();

    if let Some(well) = WELL_RE.captures(fragment).and_then(|caps| caps.get(1)) {
        row.insert(WELL_COLUMN.to_string(), zero_pad_well(well.as_str()));
    }
    if let Some(section) = OPTICAL_SECTION_RE
        .captures(fragment)
        .and_then(|caps| caps.get(1))
    {
        extract_labeled_values(section.as_str(), OPTICAL_PREFIX, &mut row);
    }
    if let Some(section) = SPOT_SECTION_RE
        .captures(fragment)
        .and_then(|caps| caps.get(1))
    {
        extract_labeled_values(section.as_str(), SPOT_PREFIX, &mut row);
    }
    if let Some(section) = PORTS_SECTION_RE
        .captures(fragment)
        .and_then(|caps| caps.get(1))
    {
        extract_port_diameters(section.as_str(), &mut row);
    }
    row
}

/// Derives lot/type/serial metadata from a barcode. Identifiers shorter than
/// eleven characters yield an empty map; that is a normal outcome, not an
/// error. Characters beyond index eleven are ignored.
fn decompose_barcode(barcode: &str) -> Row {
    let chars: Vec<char> = barcode.chars().collect();
    let mut meta = Row::new();
    if chars.len() < BARCODE_MIN_LEN {
        return meta;
    }

    let kind: String = chars[0].to_string();
    let serial: String = chars[1..6].iter().collect();
    let lot_suffix: String = chars[6..11].iter().collect();

    meta.insert("Type".to_string(), kind.clone());
    meta.insert(
        "SN".to_string(),
        serial.trim_start_matches('0').to_string(),
    );
    meta.insert(LOT_COLUMN.to_string(), format!("{}{}", kind, lot_suffix));
    meta
}

/// Runs decode -> segment -> extract -> decompose for one report file and
/// sends the complete per-file batch to the collector. Decode failures are
/// reported back to the caller; grammar misses never fail the file.
fn process_report_file(
    filepath: &Path,
    file_index: usize,
    sender: &Sender<RowBatch>,
) -> ProcessedFileResult {
    let details = match extract_report_details(filepath) {
        Ok(details) => details,
        Err(e) => {
            return ProcessedFileResult {
                rows_extracted: 0,
                error: Some(e),
                filepath: filepath.to_path_buf(),
            }
        }
    };

    let barcode_meta = decompose_barcode(&details.barcode);
    if barcode_meta.is_empty() {
        debug!(
            "No usable barcode in {} (length {})",
            filepath.display(),
            details.barcode.len()
        );
    }

    let fragments = split_well_fragments(&details.results);
    let fragments_seen = fragments.len();

    let mut rows = Vec::with_capacity(fragments_seen);
    for fragment in fragments {
        let extracted = extract_well_row(fragment);
        if extracted.is_empty() {
            // Nothing recognizable in this fragment; skip it rather than emit an empty row.
            continue;
        }
        let mut row = barcode_meta.clone();
        row.extend(extracted);
        rows.push(row);
    }
    let rows_extracted = rows.len();

    if sender.send(RowBatch { file_index, rows }).is_err() {
        let err = anyhow::anyhow!(
            "Collector channel closed unexpectedly on file {}",
            filepath.display()
        );
        return ProcessedFileResult {
            rows_extracted,
            error: Some(err),
            filepath: filepath.to_path_buf(),
        };
    }

    debug!(
        "Finished processing {}: {} fragments, {} rows extracted",
        filepath.display(),
        fragments_seen,
        rows_extracted
    );

    ProcessedFileResult {
        rows_extracted,
        error: None,
        filepath: filepath.to_path_buf(),
    }
}

/// Merges per-file batches into per-lot tables. Batches are ordered by their
/// discovery index so task completion order never shows in the output, and
/// each table is stable-sorted ascending by well code (equal wells keep file
/// order, then fragment order).
fn build_lot_tables(mut batches: Vec<RowBatch>) -> BTreeMap<Lot, Vec<Row>> {
    batches.sort_by_key(|batch| batch.file_index);

    let mut tables: BTreeMap<Lot, Vec<Row>> = BTreeMap::new();
    for batch in batches {
        for row in batch.rows {
            let lot = Lot(row.get(LOT_COLUMN).cloned().unwrap_or_default());
            tables.entry(lot).or_default().push(row);
        }
    }

    for rows in tables.values_mut() {
        rows.sort_by(|a, b| a.get(WELL_COLUMN).cmp(&b.get(WELL_COLUMN)));
    }

    tables
}

/// Computes the canonical column list for one output group: the union of all
/// keys, ordered bare fields, `Optical_*`, `Spot_*`, `Port_*` (alphabetical
/// within each group) with `Well` last.
fn ordered_columns(rows: &[Row]) -> Vec<String> {
    let mut all_keys: BTreeSet<&str> = BTreeSet::new();
    for row in rows {
        for key in row.keys() {
            all_keys.insert(key);
        }
    }

    let mut bare = Vec::new();
    let mut optical = Vec::new();
    let mut spot = Vec::new();
    let mut port = Vec::new();
    let mut has_well = false;
    for key in all_keys {
        if key == WELL_COLUMN {
            has_well = true;
        } else if key.starts_with(OPTICAL_PREFIX) {
            optical.push(key.to_string());
        } else if key.starts_with(SPOT_PREFIX) {
            spot.push(key.to_string());
        } else if key.starts_with(PORT_PREFIX) {
            port.push(key.to_string());
        } else {
            bare.push(key.to_string());
        }
    }

    let mut columns = bare;
    columns.extend(optical);
    columns.extend(spot);
    columns.extend(port);
    if has_well {
        columns.push(WELL_COLUMN.to_string());
    }
    columns
}

/// Projects a row onto the reconciled column list, filling absent columns
/// with empty strings. The input row is not mutated.
fn project_row(row: &Row, columns: &[String]) -> Vec<String> {
    columns
        .iter()
        .map(|column| row.get(column).cloned().unwrap_or_default())
        .collect()
}

fn write_lot_csv(path: &Path, rows: &[Row], columns: &[String]) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create output file: {}", path.display()))?;
    let mut writer = Writer::from_writer(file);

    writer
        .write_record(columns)
        .with_context(|| format!("Failed to write header to: {}", path.display()))?;
    for row in rows {
        writer
            .write_record(project_row(row, columns))
            .with_context(|| format!("Failed to write record to: {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to flush output file: {}", path.display()))?;
    Ok(())
}

fn write_lot_tables(output_root: &Path, tables: &BTreeMap<Lot, Vec<Row>>) -> Result<Vec<PathBuf>> {
    let mut outputs = Vec::with_capacity(tables.len());
    for (lot, rows) in tables {
        let columns = ordered_columns(rows);
        let output_path = output_root.join(format!("{}_MV.csv", lot.0));
        write_lot_csv(&output_path, rows, &columns)?;
        info!(
            "Wrote {} rows ({} columns) for lot '{}' to {}",
            rows.len(),
            columns.len(),
            lot.0,
            output_path.display()
        );
        outputs.push(output_path);
    }
    Ok(outputs)
}

/// Processes every located file in parallel and funnels the per-file batches
/// to a single collector thread that owns the corpus, groups it by lot and
/// writes the lot tables. A file that fails to decode is logged and skipped;
/// an output write failure is fatal to the run.
fn run_extraction_pipeline(config: &RunConfig, files: Vec<PathBuf>) -> Result<PipelineOutcome> {
    let progress_bar = if config.silent {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(files.len() as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta} @ {per_sec}) {msg}")
                .expect("Failed to create progress bar template")
                .progress_chars("=> "),
        );
        bar
    };
    progress_bar.set_message("Starting processing...");

    let channel_capacity = (rayon::current_num_threads() * 4).max(8);
    let (batch_sender, batch_receiver): (Sender<RowBatch>, Receiver<RowBatch>) =
        bounded(channel_capacity);
    debug!("Using collector channel with capacity: {}", channel_capacity);

    let output_root = config.output_root.clone();
    let collector_thread = thread::spawn(move || -> Result<Vec<PathBuf>> {
        debug!("Collector thread started.");
        let mut batches = Vec::new();
        for batch in batch_receiver {
            batches.push(batch);
        }
        let tables = build_lot_tables(batches);
        write_lot_tables(&output_root, &tables)
    });

    info!("Starting parallel file processing...");
    let processing_results: Vec<ProcessedFileResult> = files
        .par_iter()
        .enumerate()
        .map(|(file_index, filepath)| {
            let sender_clone = batch_sender.clone();
            let pb_clone = progress_bar.clone();
            let process_start_time = Instant::now();

            let result = process_report_file(filepath, file_index, &sender_clone);
            let duration = process_start_time.elapsed();

            // Every report file shares the same base name, so the parent
            // directory is the part worth showing.
            let file_name_msg = filepath
                .parent()
                .map(|parent| parent.display().to_string())
                .unwrap_or_else(|| filepath.display().to_string());

            pb_clone.inc(1);
            if result.error.is_some() {
                pb_clone.set_message(format!(
                    "ERR: {} ({})",
                    file_name_msg,
                    format_elapsed(duration)
                ));
            } else {
                pb_clone.set_message(format!(
                    "OK: {} ({} rows, {})",
                    file_name_msg,
                    result.rows_extracted,
                    format_elapsed(duration)
                ));
            }
            result
        })
        .collect();

    drop(batch_sender);

    let mut files_ok = 0;
    let mut rows_extracted = 0;
    let mut files_failed = Vec::new();
    for result in processing_results {
        match result.error {
            Some(e) => {
                error!("Error processing file {}: {}", result.filepath.display(), e);
                files_failed.push(result.filepath);
            }
            None => {
                files_ok += 1;
                rows_extracted += result.rows_extracted;
            }
        }
    }

    progress_bar.finish_with_message(format!(
        "Processing finished. {} files OK, {} errors.",
        files_ok,
        files_failed.len()
    ));

    debug!("Waiting for the collector thread to write the lot tables...");
    let outputs = match collector_thread.join() {
        Ok(result) => result?,
        Err(panic) => return Err(anyhow::anyhow!("Collector thread panicked: {:?}", panic)),
    };

    Ok(PipelineOutcome {
        files_ok,
        files_failed,
        rows_extracted,
        outputs,
    })
}

fn setup_logging(log_level_str: &str, silent: bool) -> Result<()> {
    let mut log_level = match log_level_str.to_uppercase().as_str() {
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARN" | "WARNING" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        other => {
            eprintln!("Invalid log level '{}', defaulting to INFO.", other);
            LevelFilter::Info
        }
    };
    // Silent mode drops status chatter; warnings and errors always get through.
    if silent && log_level > LevelFilter::Warn {
        log_level = LevelFilter::Warn;
    }

    SimpleLogger::new()
        .with_level(log_level)
        .with_timestamp_format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        ))
        .init()?;

    Ok(())
}

fn setup_thread_pool(thread_count: usize) -> Result<usize> {
    let num_threads = if thread_count == 0 {
        let cores = num_cpus::get();
        info!("Auto-detected {} CPU cores. Using {} threads.", cores, cores);
        cores
    } else {
        info!("Using specified {} threads.", thread_count);
        thread_count
    };

    if let Err(e) = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()
    {
        error!("Failed to build global thread pool: {}. Proceeding with default.", e);
    }

    Ok(num_threads)
}

/// Validates the search root and resolves the output directory: an explicit
/// path wins, then the current working directory when requested, otherwise
/// output lands next to the input. The output directory is created up front.
fn resolve_config(cli: &Cli) -> Result<RunConfig> {
    let search_root = PathBuf::from(&cli.input);
    let metadata = fs::metadata(&search_root)
        .with_context(|| format!("Search directory not accessible: {}", search_root.display()))?;
    if !metadata.is_dir() {
        return Err(anyhow::anyhow!(
            "Search path is not a directory: {}",
            search_root.display()
        ));
    }

    let output_root = if let Some(output) = &cli.output {
        PathBuf::from(output)
    } else if cli.cwd {
        env::current_dir().context("Failed to resolve current working directory")?
    } else {
        search_root.clone()
    };
    fs::create_dir_all(&output_root)
        .with_context(|| format!("Failed to create output directory: {}", output_root.display()))?;

    Ok(RunConfig {
        search_root,
        output_root,
        silent: cli.silent,
    })
}

fn format_elapsed(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    let millis = elapsed.subsec_millis();

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}.{:03}s", seconds, millis)
    }
}

fn print_final_summary(
    start_time: Instant,
    files_count: usize,
    outcome: &PipelineOutcome,
    config: &RunConfig,
) {
    info!("-------------------- FINAL SUMMARY --------------------");
    info!("Total execution time: {}", format_elapsed(start_time.elapsed()));
    info!("Report files found: {}", files_count);
    info!("Files processed successfully: {}", outcome.files_ok);
    if !outcome.files_failed.is_empty() {
        warn!("Files with processing errors: {}", outcome.files_failed.len());
        for failed in outcome.files_failed.iter().take(10) {
            warn!("  - {}", failed.display());
        }
        if outcome.files_failed.len() > 10 {
            warn!("  ... (and {} more)", outcome.files_failed.len() - 10);
        }
    }
    info!("Well rows extracted: {}", outcome.rows_extracted);
    if outcome.outputs.is_empty() {
        info!("No rows extracted; no lot files written.");
    } else {
        info!("Lot files written to {}:", config.output_root.display());
        for output in &outcome.outputs {
            info!("  - {}", output.display());
        }
    }
    info!("-------------------------------------------------------");
}

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();

    setup_logging(&cli.log_level, cli.silent)?;
    info!("Starting Machine Vision Report Parser");

    setup_thread_pool(cli.threads)?;
    let config = resolve_config(&cli)?;

    let files = find_report_files(&config.search_root)?;
    if files.is_empty() {
        warn!(
            "No {} files found under {}. Exiting.",
            REPORT_FILE_NAME,
            config.search_root.display()
        );
        return Ok(());
    }

    let files_count = files.len();
    let outcome = run_extraction_pipeline(&config, files)?;
    print_final_summary(start_time, files_count, &outcome, &config);

    Ok(())
}
