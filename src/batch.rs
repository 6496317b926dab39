// SPDX-FileCopyrightText: 2025 Maciej Borzecki <maciek.borzecki@gmail.com>
//
// SPDX-License-Identifier: MIT

use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::Arc;

use thiserror;

use crate::config::Overrides;
use crate::executor::Executor;
use crate::node::Node;
use crate::pipeline::{CreateError, DestroyError, ProvisionError};
use crate::provider::Provider;

#[derive(thiserror::Error, Debug)]
pub enum BatchError {
    #[error("node \"{0}\" requested more than once")]
    DuplicateRequest(String),
    #[error("cannot create {} of {requested} nodes: {cause}", .failed.len())]
    PartialFailure {
        requested: usize,
        /// Names of all nodes which failed, in request order.
        failed: Vec<String>,
        /// First failure to complete.
        cause: CreateError,
        /// Failures to destroy nodes which were created successfully.
        suppressed: Vec<DestroyError>,
    },
}

impl BatchError {
    /// The failure which caused the batch to be rolled back.
    pub fn cause(&self) -> Option<&CreateError> {
        match self {
            BatchError::PartialFailure { cause, .. } => Some(cause),
            BatchError::DuplicateRequest(_) => None,
        }
    }

    pub fn suppressed(&self) -> &[DestroyError] {
        match self {
            BatchError::PartialFailure { suppressed, .. } => suppressed,
            BatchError::DuplicateRequest(_) => &[],
        }
    }
}

/// Create all named nodes in parallel. On failure, every node of the batch
/// which was created gets destroyed before the error is returned.
pub(crate) fn create_all(
    provider: &Provider,
    names: &[&str],
    executor: &dyn Executor,
) -> Result<Vec<Arc<Node>>, BatchError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(*name) {
            return Err(BatchError::DuplicateRequest(name.to_string()));
        }
    }

    log::debug!("creating {} nodes: {:?}", names.len(), names);

    let (tx, rx) = mpsc::channel();
    for (idx, name) in names.iter().enumerate() {
        let tx = tx.clone();
        provider.submit(name, &Overrides::new(), executor, move |res| {
            let _ = tx.send((idx, res));
        });
    }
    drop(tx);

    // join everything, pipelines are never cancelled midway
    let mut results: Vec<Option<Result<Arc<Node>, CreateError>>> =
        names.iter().map(|_| None).collect();
    let mut first_failure: Option<usize> = None;
    for (idx, res) in rx.iter() {
        if res.is_err() && first_failure.is_none() {
            first_failure = Some(idx);
        }
        results[idx] = Some(res);
    }

    let results: Vec<Result<Arc<Node>, CreateError>> = results
        .into_iter()
        .zip(names.iter())
        .map(|(res, name)| {
            res.unwrap_or_else(|| {
                Err(ProvisionError::Abandoned {
                    node: name.to_string(),
                }
                .into())
            })
        })
        .collect();

    let first_failure = match first_failure {
        None if results.iter().all(|r| r.is_ok()) => {
            return Ok(results.into_iter().filter_map(|r| r.ok()).collect());
        }
        Some(idx) => idx,
        // only abandoned jobs failed
        None => results.iter().position(|r| r.is_err()).unwrap_or(0),
    };

    log::warn!(
        "encountered failure while creating nodes, cleaning up remaining nodes which might take a while"
    );

    let mut failed = vec![];
    let mut suppressed = vec![];
    let mut cause = None;
    for (idx, res) in results.into_iter().enumerate() {
        match res {
            Ok(node) => {
                if let Err(err) = provider.destroy_owned(&node) {
                    log::error!("{}", err);
                    suppressed.push(err);
                }
            }
            Err(err) => {
                failed.push(err.node().to_string());
                if idx == first_failure {
                    cause = Some(err);
                } else {
                    log::warn!("{}", err);
                }
            }
        }
    }

    let cause = cause.unwrap_or_else(|| {
        ProvisionError::Abandoned {
            node: names[first_failure].to_string(),
        }
        .into()
    });
    Err(BatchError::PartialFailure {
        requested: names.len(),
        failed,
        cause,
        suppressed,
    })
}
