//! Handlers shared by every training stage: checkpoints, metric logs, plots,
//! timing, output directories and graceful shutdown on interrupt.

pub mod checkpoint;
pub mod plot;

pub use checkpoint::{ModelCheckpoint, NetworkSet};
pub use plot::{create_plots, read_metrics_log, MetricsTable};

use crate::engine::{Engine, EngineError, EngineState, Event, Process};
use anyhow::{Context, Result};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

pub const CKPT_PREFIX: &str = "networks";
pub const LOGS_FNAME: &str = "logs.tsv";
pub const PLOT_FNAME: &str = "plot.svg";

/// Settings consumed by [`attach_common_handlers`].
#[derive(Clone, Debug)]
pub struct CommonOptions {
    pub output_dir: PathBuf,
    pub epochs: usize,
    pub print_freq: usize,
    pub save_interval: usize,
    pub n_saved: usize,
    /// Output file templates relative to `output_dir`; their parent
    /// directories are created when the run starts.
    pub output_templates: Vec<String>,
}

/// Register the standard handler set on `engine`.
///
/// `add_message` extends the progress line written every `print_freq`
/// iterations with stage-specific metrics.
pub fn attach_common_handlers<P, F>(
    engine: &mut Engine<P>,
    options: &CommonOptions,
    add_message: F,
) -> Result<()>
where
    P: Process + NetworkSet + 'static,
    F: Fn(&EngineState) -> String + 'static,
{
    let output_dir = options.output_dir.clone();
    let logs_path = output_dir.join(LOGS_FNAME);
    let plot_path = output_dir.join(PLOT_FNAME);
    let checkpoint = Rc::new(RefCell::new(ModelCheckpoint::new(
        &output_dir,
        CKPT_PREFIX,
        options.save_interval,
        options.n_saved,
    )?));

    {
        let checkpoint = checkpoint.clone();
        engine.add_event_handler(Event::EpochCompleted, move |ctx| {
            checkpoint
                .borrow_mut()
                .on_epoch_completed(ctx.state, ctx.process)?;
            Ok(())
        });
    }

    {
        let logs_path = logs_path.clone();
        let plot_path = plot_path.clone();
        engine.add_event_handler(Event::EpochCompleted, move |_| {
            plot_best_effort(&logs_path, &plot_path);
            Ok(())
        });
    }

    {
        let checkpoint = checkpoint.clone();
        let logs_path = logs_path.clone();
        let plot_path = plot_path.clone();
        engine.add_exception_handler(move |ctx, err| {
            if !EngineError::is_interrupt(&err) || ctx.state.iteration < 1 {
                return Err(err);
            }
            ctx.terminate();
            log::warn!(
                "interrupt caught at iteration {}, exiting gracefully",
                ctx.state.iteration
            );
            plot_best_effort(&logs_path, &plot_path);
            checkpoint
                .borrow_mut()
                .save(ctx.state, ctx.process, "exception_")?;
            Ok(())
        });
    }

    {
        let output_dir = output_dir.clone();
        let templates = options.output_templates.clone();
        engine.add_event_handler(Event::Started, move |_| make_dirs(&output_dir, &templates));
    }

    let timer = Rc::new(RefCell::new(Timer::new()));
    {
        let timer = timer.clone();
        engine.add_event_handler(Event::EpochStarted, move |_| {
            timer.borrow_mut().reset();
            Ok(())
        });
    }
    {
        let timer = timer.clone();
        engine.add_event_handler(Event::IterationStarted, move |_| {
            timer.borrow_mut().resume();
            Ok(())
        });
    }
    {
        let timer = timer.clone();
        engine.add_event_handler(Event::IterationCompleted, move |_| {
            let mut timer = timer.borrow_mut();
            timer.pause();
            timer.step();
            Ok(())
        });
    }
    engine.add_event_handler(Event::EpochCompleted, move |ctx| {
        let mut timer = timer.borrow_mut();
        log::info!(
            "Epoch {} done. Time: {:.3}[s/batch]*{}[batch] = {:.3}[s]",
            ctx.state.epoch,
            timer.value(),
            timer.steps(),
            timer.value() * timer.steps() as f64
        );
        timer.reset();
        Ok(())
    });

    let epochs = options.epochs;
    let print_freq = options.print_freq.max(1);
    engine.add_event_handler(Event::IterationCompleted, move |ctx| {
        if (ctx.state.iteration - 1) % print_freq != 0 {
            return Ok(());
        }
        append_metrics_row(&logs_path, &ctx.state.metrics)?;
        log::info!(
            "[{}/{}][{}]{}",
            ctx.state.epoch,
            epochs,
            ctx.state.iteration,
            add_message(ctx.state)
        );
        Ok(())
    });

    Ok(())
}

fn plot_best_effort(logs_path: &Path, plot_path: &Path) {
    if let Err(err) = create_plots(logs_path, plot_path) {
        log::warn!("failed to create {}: {err:#}", plot_path.display());
    }
}

/// Create the parent directory of every output template under `output_dir`.
pub fn make_dirs(output_dir: &Path, templates: &[String]) -> Result<()> {
    for template in templates {
        let folder = match Path::new(template).parent() {
            Some(parent) => output_dir.join(parent),
            None => output_dir.to_path_buf(),
        };
        if !folder.exists() {
            log::info!("mkdir {}", folder.display());
            std::fs::create_dir_all(&folder)
                .with_context(|| format!("failed to create {}", folder.display()))?;
        }
    }
    Ok(())
}

/// Append one TSV row of metric values, preceded by the sorted names when the
/// file is new or empty.
pub fn append_metrics_row(path: &Path, metrics: &BTreeMap<String, f64>) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let is_empty = file
        .metadata()
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len()
        == 0;

    let mut text = String::new();
    if is_empty {
        let names: Vec<&str> = metrics.keys().map(String::as_str).collect();
        text.push_str(&names.join("\t"));
        text.push('\n');
    }
    let values: Vec<String> = metrics
        .values()
        .map(|value| round5(*value).to_string())
        .collect();
    text.push_str(&values.join("\t"));
    text.push('\n');

    file.write_all(text.as_bytes())
        .with_context(|| format!("failed to append to {}", path.display()))
}

fn round5(value: f64) -> f64 {
    (value * 1e5).round() / 1e5
}

/// Accumulates time only while resumed; `value` is the mean per step.
#[derive(Debug, Default)]
pub struct Timer {
    elapsed: Duration,
    resumed_at: Option<Instant>,
    steps: usize,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resume(&mut self) {
        if self.resumed_at.is_none() {
            self.resumed_at = Some(Instant::now());
        }
    }

    pub fn pause(&mut self) {
        if let Some(start) = self.resumed_at.take() {
            self.elapsed += start.elapsed();
        }
    }

    pub fn step(&mut self) {
        self.steps += 1;
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Mean seconds per step, 0 before the first step.
    pub fn value(&self) -> f64 {
        let mut elapsed = self.elapsed;
        if let Some(start) = self.resumed_at {
            elapsed += start.elapsed();
        }
        if self.steps == 0 {
            return 0.0;
        }
        elapsed.as_secs_f64() / self.steps as f64
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
