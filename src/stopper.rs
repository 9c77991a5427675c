// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Per-CPU stopper
//!
//! A single slot of deferred work per CPU. Work is handed to the CPU with
//! `dispatch()` and picked up by that CPU at its next safe point with
//! `take()`. The dispatcher never waits: it gets a `StopCompletion` it may
//! poll later, or just drop.
//!
//! A slot holds one piece of work at a time. Dispatching to a CPU whose
//! slot is still occupied fails, the same way stopping a CPU that is
//! already mid-stop does.
use anyhow::bail;
use anyhow::Result;
use crossbeam::channel;
use crossbeam::channel::Receiver;
use crossbeam::channel::Sender;
use crossbeam::channel::TryRecvError;
use crossbeam::channel::TrySendError;

/// Work taken from a stopper slot. Completing it, or dropping it, signals
/// the dispatcher.
#[derive(Debug)]
pub struct StopTicket<W> {
    work: W,
    done: Sender<bool>,
}

impl<W> StopTicket<W> {
    pub fn work(&self) -> &W {
        &self.work
    }

    pub fn complete(self, ok: bool) {
        // The dispatcher may not be listening anymore.
        let _ = self.done.send(ok);
    }
}

/// The dispatcher's end of a piece of stopper work.
#[derive(Debug)]
pub struct StopCompletion {
    done: Receiver<bool>,
}

impl StopCompletion {
    /// The outcome if the work has run. Work dropped without running reads
    /// as failed.
    pub fn try_result(&self) -> Option<bool> {
        match self.done.try_recv() {
            Ok(ok) => Some(ok),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(false),
        }
    }
}

#[derive(Debug)]
struct Slot<W> {
    tx: Sender<StopTicket<W>>,
    rx: Receiver<StopTicket<W>>,
}

#[derive(Debug)]
pub struct CpuStoppers<W> {
    slots: Vec<Slot<W>>,
}

impl<W> CpuStoppers<W> {
    pub fn new(nr_cpus: usize) -> Self {
        let slots = (0..nr_cpus)
            .map(|_| {
                let (tx, rx) = channel::bounded(1);
                Slot { tx, rx }
            })
            .collect();
        Self { slots }
    }

    /// Queue @work on @cpu's stopper. Fails if the slot is occupied.
    pub fn dispatch(&self, cpu: usize, work: W) -> Result<StopCompletion> {
        let Some(slot) = self.slots.get(cpu) else {
            bail!("No stopper for CPU {}", cpu);
        };
        let (done_tx, done_rx) = channel::bounded(1);
        let ticket = StopTicket {
            work,
            done: done_tx,
        };
        match slot.tx.try_send(ticket) {
            Ok(()) => Ok(StopCompletion { done: done_rx }),
            Err(TrySendError::Full(_)) => bail!("Stopper on CPU {} is busy", cpu),
            Err(TrySendError::Disconnected(_)) => bail!("Stopper on CPU {} is gone", cpu),
        }
    }

    /// Work pending on @cpu, if any. Called by @cpu itself.
    pub fn take(&self, cpu: usize) -> Option<StopTicket<W>> {
        self.slots.get(cpu)?.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_take_complete() {
        let stoppers = CpuStoppers::new(2);
        let done = stoppers.dispatch(1, 42u32).unwrap();
        assert_eq!(done.try_result(), None);

        let ticket = stoppers.take(1).unwrap();
        assert_eq!(*ticket.work(), 42);
        ticket.complete(true);
        assert_eq!(done.try_result(), Some(true));
        assert!(stoppers.take(1).is_none());
    }

    #[test]
    fn test_busy_slot_rejects_dispatch() {
        let stoppers = CpuStoppers::new(2);
        let _first = stoppers.dispatch(0, 1u32).unwrap();
        assert!(stoppers.dispatch(0, 2u32).is_err());
        assert!(stoppers.dispatch(5, 3u32).is_err());
        assert!(stoppers.dispatch(1, 4u32).is_ok());
    }

    #[test]
    fn test_dropped_work_reads_as_failed() {
        let stoppers = CpuStoppers::new(1);
        let done = stoppers.dispatch(0, ()).unwrap();
        drop(stoppers.take(0));
        assert_eq!(done.try_result(), Some(false));

        // The slot is free again.
        let done = stoppers.dispatch(0, ()).unwrap();
        stoppers.take(0).unwrap().complete(false);
        assert_eq!(done.try_result(), Some(false));
    }
}
