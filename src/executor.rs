// SPDX-FileCopyrightText: 2025 Maciej Borzecki <maciek.borzecki@gmail.com>
//
// SPDX-License-Identifier: MIT

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use crate::node::Node;
use crate::pipeline::{CreateError, ProvisionError};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something which runs node creation jobs.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

impl Executor for rayon::ThreadPool {
    fn execute(&self, job: Job) {
        self.spawn(job)
    }
}

/// Runs each job on a dedicated thread.
pub struct ThreadPerJob;

impl Executor for ThreadPerJob {
    fn execute(&self, job: Job) {
        if let Err(err) = thread::Builder::new()
            .name("provision".to_string())
            .spawn(job)
        {
            // the job is dropped, its result channel gets disconnected
            log::error!("cannot spawn provisioning thread: {}", err);
        }
    }
}

/// Build a worker pool for running pipelines.
pub fn pool(workers: usize) -> Result<rayon::ThreadPool, rayon::ThreadPoolBuildError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|idx| format!("provision-{}", idx))
        .build()
}

/// Pending result of asynchronous node creation.
pub struct NodeFuture {
    name: String,
    rx: mpsc::Receiver<Result<Arc<Node>, CreateError>>,
}

impl NodeFuture {
    pub(crate) fn new(name: &str) -> (mpsc::Sender<Result<Arc<Node>, CreateError>>, NodeFuture) {
        let (tx, rx) = mpsc::channel();
        (
            tx,
            NodeFuture {
                name: name.to_string(),
                rx,
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn abandoned(&self) -> CreateError {
        ProvisionError::Abandoned {
            node: self.name.clone(),
        }
        .into()
    }

    /// Block until the node is created.
    pub fn join(self) -> Result<Arc<Node>, CreateError> {
        match self.rx.recv() {
            Ok(res) => res,
            Err(_) => Err(self.abandoned()),
        }
    }

    /// Returns the result if creation has finished.
    pub fn try_join(&self) -> Option<Result<Arc<Node>, CreateError>> {
        match self.rx.try_recv() {
            Ok(res) => Some(res),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(Err(self.abandoned())),
        }
    }
}
