//! Event-driven run loop that repeatedly applies a [`Process`] to batches.
//!
//! Handlers subscribe to lifecycle [`Event`]s and run in registration order with
//! mutable access to the shared [`EngineState`]. Faults raised while running are
//! offered to the exception handlers; an unresolved fault is returned from
//! [`Engine::run`] with the counters left as they were.

use crate::metrics::{MetricsAggregator, MetricsRecord};
use anyhow::{Context, Result};
use burn::train::Interrupter;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Lifecycle events dispatched by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    Started,
    EpochStarted,
    IterationStarted,
    IterationCompleted,
    EpochCompleted,
    Completed,
}

/// Faults raised by the engine itself rather than by the process or handlers.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("training interrupted by user")]
    Interrupted,
}

impl EngineError {
    /// Whether `err` is (or wraps) a user interrupt.
    pub fn is_interrupt(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<EngineError>(), Some(EngineError::Interrupted))
    }
}

/// Counters and smoothed metrics visible to every handler.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EngineState {
    pub epoch: usize,
    pub iteration: usize,
    pub max_epochs: usize,
    pub metrics: BTreeMap<String, f64>,
}

impl EngineState {
    pub fn metric(&self, name: &str) -> f64 {
        self.metrics.get(name).copied().unwrap_or(f64::NAN)
    }
}

/// Route Ctrl-C to `interrupter`.
///
/// The OS handler can only be installed once per process; reuse the same
/// interrupter for every run instead of installing a new one.
pub fn install_interrupt_handler(interrupter: &Interrupter) -> Result<()> {
    let interrupter = interrupter.clone();
    ctrlc::set_handler(move || interrupter.stop(Some("ctrl-c")))
        .context("failed to install Ctrl-C handler")
}

/// The unit of work applied to every batch.
pub trait Process {
    type Input;
    type Output: MetricsRecord;

    fn step(&mut self, state: &EngineState, input: Self::Input) -> Result<Self::Output>;
}

/// Supplier of batches, one pass per epoch.
pub trait SampleProvider {
    type Item;

    /// Batches of the next epoch. Pulling an item may block.
    fn epoch(&mut self) -> Result<Box<dyn Iterator<Item = Result<Self::Item>> + '_>>;
}

/// What a handler sees while an event is being dispatched.
pub struct EventContext<'a, P> {
    pub state: &'a mut EngineState,
    pub process: &'a P,
    terminate: &'a mut bool,
}

impl<P> EventContext<'_, P> {
    /// Stop after the current iteration; no further batches are pulled.
    pub fn terminate(&mut self) {
        *self.terminate = true;
    }
}

type Handler<P> = Box<dyn FnMut(&mut EventContext<'_, P>) -> Result<()>>;
type ExceptionHandler<P> = Box<dyn FnMut(&mut EventContext<'_, P>, anyhow::Error) -> Result<()>>;

pub struct Engine<P: Process> {
    process: P,
    state: EngineState,
    aggregator: MetricsAggregator,
    handlers: HashMap<Event, Vec<Handler<P>>>,
    exception_handlers: Vec<ExceptionHandler<P>>,
    interrupter: Interrupter,
    should_terminate: bool,
}

impl<P: Process> Engine<P> {
    pub fn new(process: P) -> Self {
        Self {
            process,
            state: EngineState::default(),
            aggregator: MetricsAggregator::new(None),
            handlers: HashMap::new(),
            exception_handlers: Vec::new(),
            interrupter: Interrupter::new(),
            should_terminate: false,
        }
    }

    /// Smooth metrics over the last `window` iterations instead of all of them.
    pub fn with_smoothing_window(mut self, window: Option<usize>) -> Self {
        self.aggregator = MetricsAggregator::new(window);
        self
    }

    pub fn add_event_handler<F>(&mut self, event: Event, handler: F)
    where
        F: FnMut(&mut EventContext<'_, P>) -> Result<()> + 'static,
    {
        self.handlers.entry(event).or_default().push(Box::new(handler));
    }

    /// Register a handler for faults raised during [`Engine::run`].
    ///
    /// Returning `Ok` resolves the fault; returning `Err` hands it to the next
    /// exception handler, and out of `run` after the last one.
    pub fn add_exception_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&mut EventContext<'_, P>, anyhow::Error) -> Result<()> + 'static,
    {
        self.exception_handlers.push(Box::new(handler));
    }

    pub fn handler_count(&self, event: Event) -> usize {
        self.handlers.get(&event).map_or(0, Vec::len)
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn process(&self) -> &P {
        &self.process
    }

    pub fn process_mut(&mut self) -> &mut P {
        &mut self.process
    }

    pub fn into_process(self) -> P {
        self.process
    }

    pub fn interrupter(&self) -> Interrupter {
        self.interrupter.clone()
    }

    /// Share an existing stop handle, e.g. one already wired to Ctrl-C.
    pub fn with_interrupter(mut self, interrupter: Interrupter) -> Self {
        self.interrupter = interrupter;
        self
    }

    pub fn terminate(&mut self) {
        self.should_terminate = true;
    }

    /// Run `max_epochs` passes over `data`, starting from fresh counters and a
    /// cleared stop request.
    pub fn run<D>(&mut self, data: &mut D, max_epochs: usize) -> Result<&EngineState>
    where
        D: SampleProvider<Item = P::Input>,
    {
        self.state = EngineState {
            max_epochs,
            ..Default::default()
        };
        self.aggregator.reset();
        self.should_terminate = false;
        self.interrupter.reset();

        if let Err(err) = self.run_epochs(data) {
            self.handle_exception(err)?;
        }
        Ok(&self.state)
    }

    fn run_epochs<D>(&mut self, data: &mut D) -> Result<()>
    where
        D: SampleProvider<Item = P::Input>,
    {
        self.fire(Event::Started)?;

        while self.state.epoch < self.state.max_epochs && !self.should_terminate {
            self.state.epoch += 1;
            self.fire(Event::EpochStarted)?;
            let mut batches = data.epoch()?;

            while !self.should_terminate {
                if self.interrupter.should_stop() {
                    return Err(EngineError::Interrupted.into());
                }
                let batch = match batches.next() {
                    Some(Ok(batch)) => batch,
                    Some(Err(err)) => {
                        log::error!(
                            "failed to load batch after iteration {}: {err:#}",
                            self.state.iteration
                        );
                        return Err(err);
                    }
                    None => break,
                };

                self.state.iteration += 1;
                self.fire(Event::IterationStarted)?;
                let output = self.process.step(&self.state, batch)?;
                self.aggregator.update(&output);
                self.state.metrics = self.aggregator.values();
                self.fire(Event::IterationCompleted)?;
            }

            self.fire(Event::EpochCompleted)?;
        }

        self.fire(Event::Completed)
    }

    fn fire(&mut self, event: Event) -> Result<()> {
        log::debug!(
            "{event:?} (epoch {}, iteration {})",
            self.state.epoch,
            self.state.iteration
        );
        let Some(handlers) = self.handlers.get_mut(&event) else {
            return Ok(());
        };
        for handler in handlers.iter_mut() {
            let mut ctx = EventContext {
                state: &mut self.state,
                process: &self.process,
                terminate: &mut self.should_terminate,
            };
            handler(&mut ctx)?;
        }
        Ok(())
    }

    fn handle_exception(&mut self, err: anyhow::Error) -> Result<()> {
        let mut err = err;
        for handler in self.exception_handlers.iter_mut() {
            let mut ctx = EventContext {
                state: &mut self.state,
                process: &self.process,
                terminate: &mut self.should_terminate,
            };
            match handler(&mut ctx, err) {
                Ok(()) => return Ok(()),
                Err(next) => err = next,
            }
        }
        Err(err)
    }
}
