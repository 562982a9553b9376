// A custom thread pool instead of Rayon for two reasons:
// - Block tasks must take priority over attestation tasks.
// - Rayon is prone to stack overflows due to the way it runs tasks.
//
// Low priority tasks will starve if there are enough high priority tasks to
// occupy all workers. That requires a sustained flood of blocks, which is not
// a realistic workload.

use std::{collections::VecDeque, sync::Arc, thread::Builder};

use anyhow::Result;
use derivative::Derivative;
use derive_more::From;
use log::debug;
use parking_lot::{Condvar, Mutex};
use std_ext::ArcExt as _;
use types::preset::Preset;

use crate::tasks::{AggregateAndProofTask, AttestationTask, BlockTask, Run};

#[derive(Derivative)]
#[derivative(Clone(bound = ""))]
pub struct ThreadPool<P: Preset, W> {
    shared: Arc<Shared<P, W>>,
}

impl<P: Preset, W> Drop for ThreadPool<P, W> {
    fn drop(&mut self) {
        self.shared.critical.lock().done = true;
        self.shared.condvar.notify_all();
    }
}

impl<P: Preset, W> ThreadPool<P, W> {
    pub fn new() -> Result<Self>
    where
        W: Send + 'static,
    {
        let shared = Arc::new(Shared::default());

        for index in 0..num_cpus::get() {
            let shared = shared.clone_arc();

            Builder::new()
                .name(format!("store-worker-{index}"))
                .spawn(move || run_worker(&shared))?;
        }

        Ok(Self { shared })
    }

    pub fn spawn(&self, task: impl Spawn<P, W>) {
        task.spawn(&mut self.shared.critical.lock());
        self.shared.condvar.notify_one();
    }
}

#[derive(Derivative)]
#[derivative(Default(bound = ""))]
struct Shared<P: Preset, W> {
    critical: Mutex<Critical<P, W>>,
    condvar: Condvar,
}

// `done` and the fields holding tasks must be inside the `Mutex` to avoid
// race conditions.
#[derive(Derivative)]
#[derivative(Default(bound = ""))]
pub struct Critical<P: Preset, W> {
    done: bool,
    high_priority_tasks: VecDeque<HighPriorityTask<P, W>>,
    low_priority_tasks: VecDeque<LowPriorityTask<P, W>>,
}

#[derive(From)]
enum HighPriorityTask<P: Preset, W> {
    Block(BlockTask<P, W>),
}

impl<P: Preset, W> Run for HighPriorityTask<P, W> {
    fn run(self) {
        match self {
            Self::Block(task) => task.run(),
        }
    }
}

#[derive(From)]
enum LowPriorityTask<P: Preset, W> {
    AggregateAndProof(AggregateAndProofTask<P, W>),
    Attestation(AttestationTask<P, W>),
}

impl<P: Preset, W> Run for LowPriorityTask<P, W> {
    fn run(self) {
        match self {
            Self::AggregateAndProof(task) => task.run(),
            Self::Attestation(task) => task.run(),
        }
    }
}

pub trait Spawn<P: Preset, W> {
    fn spawn(self, critical: &mut Critical<P, W>);
}

impl<P: Preset, W> Spawn<P, W> for BlockTask<P, W> {
    fn spawn(self, critical: &mut Critical<P, W>) {
        critical.high_priority_tasks.push_back(self.into());
    }
}

impl<P: Preset, W> Spawn<P, W> for AttestationTask<P, W> {
    fn spawn(self, critical: &mut Critical<P, W>) {
        critical.low_priority_tasks.push_back(self.into());
    }
}

impl<P: Preset, W> Spawn<P, W> for AggregateAndProofTask<P, W> {
    fn spawn(self, critical: &mut Critical<P, W>) {
        critical.low_priority_tasks.push_back(self.into());
    }
}

fn run_worker<P: Preset, W>(shared: &Shared<P, W>) {
    debug!("thread {} starting", thread_name());

    'outer: loop {
        let mut critical = shared.critical.lock();

        loop {
            if critical.done {
                break 'outer;
            }

            if let Some(task) = critical.high_priority_tasks.pop_front() {
                drop(critical);
                task.run_and_handle_panics();
                continue 'outer;
            }

            if let Some(task) = critical.low_priority_tasks.pop_front() {
                drop(critical);
                task.run_and_handle_panics();
                continue 'outer;
            }

            shared.condvar.wait(&mut critical);
        }
    }

    debug!("thread {} stopping", thread_name());
}

fn thread_name() -> String {
    std::thread::current()
        .name()
        .expect("ThreadPool::new gives every worker thread a name")
        .to_owned()
}
