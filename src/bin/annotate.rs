//! annotate - run sparse detection over a video or image sequence, write
//! annotated frames and log every detection to SQLite.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use inference_log::{
    open_sink, open_source, BackendRegistry, DetectorSettings, FlushMode, Frame, FrameSink,
    NullSink, Orchestrator, PipelineParts, PipelineSettings, SinkError, SqlitePersistenceSink,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Video file, image directory, single image or stub:// URL.
    input: Option<String>,
    /// Annotated output: video file (.mp4/.avi/.mkv/.mov), image path or directory.
    #[arg(long, short)]
    output: Option<String>,
    /// SQLite database for the detection log.
    #[arg(long, env = "INFERENCE_LOG_DB_PATH")]
    db_path: Option<String>,
    /// Detector backend name (see --list-detectors).
    #[arg(long)]
    detector: Option<String>,
    /// ONNX model for the tract backend.
    #[arg(long)]
    model: Option<PathBuf>,
    /// Minimum confidence for a detection to be kept.
    #[arg(long)]
    confidence: Option<f32>,
    /// Run the detector every N frames instead of once per second of media.
    #[arg(long)]
    frame_skip: Option<u32>,
    /// Frame rate to assume instead of the source's own.
    #[arg(long)]
    frame_rate: Option<f64>,
    /// Box outline width in pixels.
    #[arg(long)]
    line_width: Option<u32>,
    /// Label glyph scale.
    #[arg(long)]
    font_size: Option<f32>,
    /// Seconds between detection log commits.
    #[arg(long)]
    commit_interval: Option<f64>,
    /// Flush mode (inline|background).
    #[arg(long)]
    flush_mode: Option<FlushMode>,
    /// Print the registered detector backends and exit.
    #[arg(long)]
    list_detectors: bool,
    /// Print the run summary as JSON on stdout.
    #[arg(long)]
    summary_json: bool,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let settings = {
        let _stage = ui.stage("Load settings");
        let mut settings = PipelineSettings::load()?;
        apply_args(&mut settings, &args)?;
        settings.validate()?;
        settings
    };

    let mut registry = build_registry(&settings.detector)?;
    if args.list_detectors {
        for name in registry.list() {
            println!("{}", name);
        }
        return Ok(());
    }
    let input = args
        .input
        .clone()
        .ok_or_else(|| anyhow!("an input path is required"))?;

    let detector = registry.take(&settings.detector.backend)?;
    let source = {
        let _stage = ui.stage("Open source");
        open_source(&input).with_context(|| format!("failed to open source {}", input))?
    };
    let frame_rate = settings.frame_rate_override.or_else(|| source.frame_rate());
    let sink: Box<dyn FrameSink> = match &args.output {
        Some(path) => {
            let _stage = ui.stage("Open output");
            open_sink(path, frame_rate).with_context(|| format!("failed to open output {}", path))?
        }
        None => {
            log::info!("no --output given; annotated frames are discarded");
            Box::new(NullSink::new())
        }
    };
    let store = {
        let _stage = ui.stage("Open detection log");
        SqlitePersistenceSink::open(&settings.db_path)
            .with_context(|| format!("failed to open database {}", settings.db_path))?
    };

    let progress = ui.frames("annotating");
    let config = settings.pipeline_config(&input);
    log::info!(
        "logging detections from {} to {} (table {})",
        input,
        settings.db_path,
        config.table_id
    );
    let mut orchestrator = Orchestrator::new(
        config,
        PipelineParts {
            source,
            sink: Box::new(ProgressSink {
                inner: sink,
                progress: progress.clone(),
            }),
            detector,
            store: Box::new(store),
        },
    );

    let stop = orchestrator.stop_signal();
    ctrlc::set_handler(move || {
        log::warn!("interrupt received, draining");
        stop.trigger();
    })
    .context("error setting Ctrl-C handler")?;

    let result = orchestrator.run();
    progress.finish();

    if args.summary_json {
        println!("{}", serde_json::to_string_pretty(orchestrator.summary())?);
    }
    result?;
    Ok(())
}

fn apply_args(settings: &mut PipelineSettings, args: &Args) -> Result<()> {
    if let Some(path) = &args.db_path {
        settings.db_path = path.clone();
    }
    if let Some(name) = &args.detector {
        settings.detector.backend = name.clone();
    }
    if let Some(model) = &args.model {
        settings.detector.model_path = Some(model.clone());
    }
    if let Some(v) = args.confidence {
        settings.confidence_threshold = v;
    }
    if let Some(v) = args.frame_skip {
        settings.frame_skip = Some(v);
    }
    if let Some(v) = args.frame_rate {
        settings.frame_rate_override = Some(v);
    }
    if let Some(v) = args.line_width {
        settings.line_width = v;
    }
    if let Some(v) = args.font_size {
        settings.font_size = v;
    }
    if let Some(secs) = args.commit_interval {
        if !(secs.is_finite() && secs > 0.0) {
            return Err(anyhow!("--commit-interval must be greater than zero"));
        }
        settings.commit_interval = Duration::from_secs_f64(secs);
    }
    if let Some(mode) = args.flush_mode {
        settings.flush_mode = mode;
    }
    Ok(())
}

fn build_registry(detector: &DetectorSettings) -> Result<BackendRegistry> {
    let mut registry = BackendRegistry::with_builtin();
    match &detector.model_path {
        #[cfg(feature = "backend-tract")]
        Some(path) => {
            let backend = inference_log::TractBackend::new(
                path,
                detector.input_size,
                detector.input_size,
                detector.class_names.clone(),
            )?;
            registry.register(backend);
        }
        #[cfg(not(feature = "backend-tract"))]
        Some(path) => {
            if detector.backend == "tract" {
                return Err(anyhow!(
                    "model {} needs the backend-tract feature",
                    path.display()
                ));
            }
            log::warn!("ignoring model {}: built without backend-tract", path.display());
        }
        None => {}
    }
    Ok(registry)
}

/// Advances the progress display on every written frame.
struct ProgressSink {
    inner: Box<dyn FrameSink>,
    progress: ui::FrameProgress,
}

impl FrameSink for ProgressSink {
    fn write(&mut self, frame: &Frame) -> Result<(), SinkError> {
        self.inner.write(frame)?;
        self.progress.inc();
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.inner.finish()
    }
}
