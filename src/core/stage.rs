//! Stage capability and the consumer loop that drives it.
//!
//! A [`Stage`] is bound to one consumer group. The loop hands it every
//! sequence in order, isolates per-slot failures (errors and panics) and
//! releases the group cursor at the end of each available batch and after
//! every failed slot.

use std::any::Any;
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crate::core::barrier::Consumer;
use crate::core::ring::Access;
use crate::core::{Error, Result};

/// Slot handed to [`Stage::on_event`].
///
/// Derefs to the slot. Only exclusive groups get mutable access.
pub enum EventRef<'a, T> {
    Shared(&'a T),
    Exclusive(&'a mut T),
}

impl<T> EventRef<'_, T> {
    pub fn get_mut(&mut self) -> Option<&mut T> {
        match self {
            EventRef::Shared(_) => None,
            EventRef::Exclusive(slot) => Some(slot),
        }
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, EventRef::Exclusive(_))
    }
}

impl<T> Deref for EventRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            EventRef::Shared(slot) => slot,
            EventRef::Exclusive(slot) => slot,
        }
    }
}

/// Per-slot processing logic with start/shutdown hooks.
pub trait Stage<T>: Send {
    fn name(&self) -> &str;

    fn on_start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_event(
        &mut self,
        event: EventRef<'_, T>,
        sequence: u64,
        end_of_batch: bool,
    ) -> anyhow::Result<()>;

    fn on_shutdown(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<T, S: Stage<T> + ?Sized> Stage<T> for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn on_start(&mut self) -> anyhow::Result<()> {
        (**self).on_start()
    }

    fn on_event(
        &mut self,
        event: EventRef<'_, T>,
        sequence: u64,
        end_of_batch: bool,
    ) -> anyhow::Result<()> {
        (**self).on_event(event, sequence, end_of_batch)
    }

    fn on_shutdown(&mut self) -> anyhow::Result<()> {
        (**self).on_shutdown()
    }
}

impl<T: Send + Sync> Consumer<T> {
    /// Runs `stage` on the calling thread until the ring halts and the
    /// group has drained.
    pub fn run<S: Stage<T>>(self, mut stage: S) {
        let stage_name = stage.name().to_string();
        log::info!("stage {} started on group {}", stage_name, self.name());
        run_hook(&stage_name, "on_start", || stage.on_start());

        let mut next = self.sequence() + 1;
        loop {
            let available = match self.wait_for(next) {
                Ok(available) => available,
                Err(Error::Halted) => break,
                Err(err) => {
                    log::error!("stage {} wait failed: {}", stage_name, err);
                    break;
                }
            };

            while next <= available {
                let end_of_batch = next == available;
                // SAFETY: `next` is released by every dependency and not yet
                // released by this group, so the producer cannot reclaim it;
                // exclusive access is validated against the layout at build.
                let event = unsafe {
                    match self.access() {
                        Access::Exclusive => EventRef::Exclusive(self.ring().slot_mut(next)),
                        Access::Shared => EventRef::Shared(self.ring().slot(next)),
                    }
                };
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    stage.on_event(event, next as u64, end_of_batch)
                }));
                match outcome {
                    Ok(Ok(())) => self.record_processed(),
                    Ok(Err(err)) => {
                        self.record_failed();
                        self.release(next);
                        log::error!("stage {} failed on sequence {}: {:#}", stage_name, next, err);
                    }
                    Err(panic) => {
                        self.record_failed();
                        self.release(next);
                        log::error!(
                            "stage {} panicked on sequence {}: {}",
                            stage_name,
                            next,
                            panic_message(panic.as_ref())
                        );
                    }
                }
                next += 1;
            }
            self.release(available);
        }

        self.finish();
        run_hook(&stage_name, "on_shutdown", || stage.on_shutdown());
        log::info!("stage {} stopped at sequence {}", stage_name, next - 1);
    }

    /// Runs `stage` on a dedicated named thread, optionally pinned to a core.
    pub fn spawn<S>(self, stage: S, core: Option<core_affinity::CoreId>) -> Result<JoinHandle<()>>
    where
        T: 'static,
        S: Stage<T> + 'static,
    {
        let thread_name = format!("tradeflow-{}", stage.name());
        thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                if let Some(core) = core {
                    if !core_affinity::set_for_current(core) {
                        log::warn!("failed to pin stage {} to core {}", stage.name(), core.id);
                    }
                }
                self.run(stage);
            })
            .map_err(Error::Io)
    }
}

fn run_hook(stage: &str, hook: &str, f: impl FnOnce() -> anyhow::Result<()>) {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log::error!("stage {} {} failed: {:#}", stage, hook, err),
        Err(panic) => log::error!(
            "stage {} {} panicked: {}",
            stage,
            hook,
            panic_message(panic.as_ref())
        ),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
