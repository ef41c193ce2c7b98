//! markgrid CLI — template authoring, sheet decoding and batch grading.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use markgrid::batch::{grade_batch, SheetCapture};
use markgrid::scoring::{AnswerKey, AnswerKeyDefinition, ScoredResult};
use markgrid::sheet_layout::{GridLayoutSpec, SheetTemplate};
use markgrid::stats::{self, ExamStatistics};
use markgrid::store::InMemoryResultStore;
use markgrid::ResultStore;
use markgrid::{OmrConfig, OmrProcessor, Orientation};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "markgrid")]
#[command(about = "Decode and grade scanned multiple-choice answer sheets")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a grid answer-sheet template (JSON).
    MakeTemplate(MakeTemplateArgs),

    /// Print a template summary.
    TemplateInfo {
        /// Path to the template JSON.
        #[arg(long)]
        template: PathBuf,
    },

    /// Validate a template definition document.
    ValidateTemplate {
        /// Path to the template JSON.
        #[arg(long)]
        template: PathBuf,
    },

    /// Decode one scanned sheet into mark readings (JSON).
    Decode(DecodeArgs),

    /// Grade a batch of scanned sheets and report exam statistics.
    Grade(GradeArgs),

    /// Recompute exam statistics from a grade results file.
    Stats {
        /// Path to a grade results JSON file.
        #[arg(long)]
        results: PathBuf,
    },
}

#[derive(Debug, Clone, Args)]
struct MakeTemplateArgs {
    /// Path to write the template JSON.
    #[arg(long)]
    out: PathBuf,

    /// Template identifier.
    #[arg(long, default_value = "grid")]
    template_id: String,

    /// Number of questions.
    #[arg(long, default_value = "20")]
    questions: usize,

    /// Options per question.
    #[arg(long, default_value = "4")]
    options: usize,
}

#[derive(Debug, Clone, Args)]
struct DecodeArgs {
    /// Path to the scanned sheet image.
    #[arg(long)]
    image: PathBuf,

    /// Path to the template JSON.
    #[arg(long)]
    template: PathBuf,

    /// Path to write mark readings (JSON); stdout when omitted.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Capture orientation of the image.
    #[arg(long, value_enum, default_value_t = OrientationArg::Upright)]
    orientation: OrientationArg,

    #[command(flatten)]
    thresholds: ThresholdArgs,
}

#[derive(Debug, Clone, Args)]
struct GradeArgs {
    /// Scanned sheet images; each file stem becomes the sheet id.
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Path to the template JSON.
    #[arg(long)]
    template: PathBuf,

    /// Path to the answer key JSON.
    #[arg(long)]
    key: PathBuf,

    /// Path to write results + statistics (JSON); stdout when omitted.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Worker threads for the batch.
    #[arg(long, default_value = "4")]
    jobs: usize,

    #[command(flatten)]
    thresholds: ThresholdArgs,
}

#[derive(Debug, Clone, Args, Default)]
struct ThresholdArgs {
    /// Fill ratio at or above which an option reads as marked.
    #[arg(long)]
    high_threshold: Option<f32>,

    /// Fill ratio at or below which an option reads as unmarked.
    #[arg(long)]
    low_threshold: Option<f32>,

    /// Minimum fill separation before the darker of two marks wins.
    #[arg(long)]
    min_margin: Option<f32>,
}

impl ThresholdArgs {
    fn to_config(&self) -> OmrConfig {
        let mut cfg = OmrConfig::default();
        if let Some(v) = self.high_threshold {
            cfg.high_threshold = v;
        }
        if let Some(v) = self.low_threshold {
            cfg.low_threshold = v;
        }
        if let Some(v) = self.min_margin {
            cfg.min_margin_between_options = v;
        }
        cfg.normalized()
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OrientationArg {
    Upright,
    QuarterTurn,
    HalfTurn,
    ThreeQuarterTurn,
}

impl OrientationArg {
    fn to_core(self) -> Orientation {
        match self {
            Self::Upright => Orientation::Upright,
            Self::QuarterTurn => Orientation::QuarterTurn,
            Self::HalfTurn => Orientation::HalfTurn,
            Self::ThreeQuarterTurn => Orientation::ThreeQuarterTurn,
        }
    }
}

/// Grade output document: per-sheet results plus derived statistics.
#[derive(serde::Serialize, serde::Deserialize)]
struct GradeDocument {
    results: Vec<ScoredResult>,
    statistics: ExamStatistics,
    failed_sheets: Vec<String>,
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::MakeTemplate(args) => cmd_make_template(&args),
        Commands::TemplateInfo { template } => cmd_template_info(&template),
        Commands::ValidateTemplate { template } => cmd_validate_template(&template),
        Commands::Decode(args) => cmd_decode(&args),
        Commands::Grade(args) => cmd_grade(&args),
        Commands::Stats { results } => cmd_stats(&results),
    }
}

fn cmd_make_template(args: &MakeTemplateArgs) -> CliResult<()> {
    let template = GridLayoutSpec {
        template_id: args.template_id.clone(),
        questions: args.questions,
        options_per_question: args.options,
        ..GridLayoutSpec::default()
    }
    .generate()?;

    let json = serde_json::to_string_pretty(&template.to_definition())?;
    std::fs::write(&args.out, json)?;
    println!(
        "wrote template '{}' ({} questions x {} options) to {}",
        template.id(),
        args.questions,
        args.options,
        args.out.display()
    );
    Ok(())
}

fn cmd_template_info(path: &Path) -> CliResult<()> {
    let template = SheetTemplate::from_json_file(path)?;
    let [w, h] = template.sheet_size_mm();
    println!("template:  {}", template.id());
    println!("page:      {w:.0}mm x {h:.0}mm");
    println!("anchors:   {}", template.anchors().len());
    println!("questions: {}", template.question_count());
    if let Some(first) = template.questions().first() {
        let labels: Vec<&str> = first.options.iter().map(|o| o.label.as_str()).collect();
        println!("options:   {}", labels.join(", "));
    }
    Ok(())
}

fn cmd_validate_template(path: &Path) -> CliResult<()> {
    let template = SheetTemplate::from_json_file(path)?;
    println!(
        "ok: '{}' is valid ({} questions)",
        template.id(),
        template.question_count()
    );
    Ok(())
}

fn cmd_decode(args: &DecodeArgs) -> CliResult<()> {
    let template = SheetTemplate::from_json_file(&args.template)?;
    let image = load_gray(&args.image)?;
    let processor = OmrProcessor::with_config(args.thresholds.to_config());

    let marks = processor.decode_oriented(&image, args.orientation.to_core(), &template)?;
    write_json(args.out.as_deref(), &marks)
}

fn cmd_grade(args: &GradeArgs) -> CliResult<()> {
    let template = SheetTemplate::from_json_file(&args.template)?;
    let key = load_key(&args.key)?;
    let processor = OmrProcessor::with_config(args.thresholds.to_config());

    let mut captures = Vec::with_capacity(args.images.len());
    for path in &args.images {
        let sheet_id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| format!("cannot derive a sheet id from {}", path.display()))?;
        captures.push(SheetCapture::upright(sheet_id, load_gray(path)?));
    }

    let store = Arc::new(InMemoryResultStore::new());
    let report = grade_batch(
        &captures,
        &template,
        &key,
        &processor,
        store.as_ref(),
        args.jobs,
        &AtomicBool::new(false),
    );

    for failure in &report.failures {
        eprintln!("sheet '{}' failed: {}", failure.sheet_id, failure.error);
    }
    if report.scored.is_empty() {
        return Err(format!("all {} sheets failed", args.images.len()).into());
    }

    let statistics = stats::compute(key.exam_id(), &store.read_all_for_exam(key.exam_id())?);
    print_statistics(&statistics);

    let document = GradeDocument {
        failed_sheets: report.failures.iter().map(|f| f.sheet_id.clone()).collect(),
        results: report.scored,
        statistics,
    };
    write_json(args.out.as_deref(), &document)
}

fn cmd_stats(path: &Path) -> CliResult<()> {
    let data = std::fs::read_to_string(path)?;
    let document: GradeDocument = serde_json::from_str(&data)?;
    let exam_id = document
        .results
        .first()
        .map(|r| r.exam_id.clone())
        .unwrap_or_else(|| document.statistics.exam_id.clone());
    let statistics = stats::compute(&exam_id, &document.results);
    print_statistics(&statistics);
    Ok(())
}

fn print_statistics(statistics: &ExamStatistics) {
    println!("exam:    {}", statistics.exam_id);
    println!("sheets:  {}", statistics.sheet_count);
    println!("average: {:.1}%", statistics.average_percent);
    println!("median:  {:.1}%", statistics.median_percent);
    println!("top:     {:.1}%", statistics.top_percent);
}

fn load_gray(path: &Path) -> CliResult<image::GrayImage> {
    Ok(image::open(path)
        .map_err(|e| format!("cannot read image {}: {e}", path.display()))?
        .to_luma8())
}

fn load_key(path: &Path) -> CliResult<AnswerKey> {
    let data = std::fs::read_to_string(path)?;
    let def: AnswerKeyDefinition = serde_json::from_str(&data)?;
    AnswerKey::from_definition(def).map_err(Into::into)
}

fn write_json<T: serde::Serialize>(out: Option<&Path>, value: &T) -> CliResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    match out {
        Some(path) => std::fs::write(path, json)?,
        None => println!("{json}"),
    }
    Ok(())
}
