//! Evaluator worker loop.

use crossbeam_channel::{select, Receiver, Sender};
use sg_cache::ResultCache;
use sg_types::{EvaluationError, Evaluator};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::cancel::CancelSignal;
use crate::message::{EvaluationRequest, EvaluationResult};
use crate::stats::PipelineStats;

pub(crate) struct Worker {
    pub id: usize,
    pub requests: Receiver<EvaluationRequest>,
    pub results: Sender<EvaluationResult>,
    pub evaluator: Arc<dyn Evaluator>,
    pub cache: Arc<dyn ResultCache>,
    pub cancel: CancelSignal,
    pub stats: Arc<PipelineStats>,
}

impl Worker {
    /// Dequeue, evaluate, enqueue, until cancelled or the request queue is
    /// closed. Every dequeued request yields exactly one result unless the
    /// pipeline is being torn down.
    pub fn run(self) {
        debug!(worker = self.id, "evaluator worker started");

        loop {
            let request = select! {
                recv(self.requests) -> msg => match msg {
                    Ok(request) => request,
                    Err(_) => break,
                },
                recv(self.cancel.watch()) -> _ => break,
            };
            if self.cancel.is_cancelled() {
                break;
            }

            let result = self.process(request);

            select! {
                send(self.results, result) -> sent => {
                    if sent.is_err() {
                        break;
                    }
                }
                recv(self.cancel.watch()) -> _ => break,
            }
        }

        debug!(worker = self.id, "evaluator worker stopped");
    }

    fn process(&self, request: EvaluationRequest) -> EvaluationResult {
        let token = request.token;

        if let (Some(deadline), Some(timeout)) = (request.deadline(), request.timeout) {
            if Instant::now() >= deadline {
                return self.finish(EvaluationResult::failure(
                    token,
                    EvaluationError::TimedOut {
                        timeout_ms: timeout.as_millis() as u64,
                    },
                ));
            }
        }

        if let Some(row) = self.cache.get(&request.input) {
            self.stats.record_cache_hit();
            return self.finish(EvaluationResult::success(token, row, true));
        }

        self.stats.record_evaluator_call();
        let evaluated =
            panic::catch_unwind(AssertUnwindSafe(|| self.evaluator.evaluate(&request.input)));

        let outcome = match evaluated {
            Ok(Ok(row)) => {
                let slots = row.output().schema().slots();
                match self.evaluator.output_keys().ensure_same_keys(slots) {
                    Ok(()) => {
                        self.cache.put(row.clone());
                        Ok(row)
                    }
                    Err(shape) => Err(EvaluationError::from(shape)),
                }
            }
            Ok(Err(e)) => Err(e),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(worker = self.id, input = %request.input, %message, "evaluator panicked");
                Err(EvaluationError::Panicked { message })
            }
        };

        match outcome {
            Ok(row) => self.finish(EvaluationResult::success(token, row, false)),
            Err(e) => {
                debug!(worker = self.id, input = %request.input, error = %e, "evaluation failed");
                self.stats.record_failed();
                self.finish(EvaluationResult::failure(token, e))
            }
        }
    }

    fn finish(&self, result: EvaluationResult) -> EvaluationResult {
        self.stats.record_completed();
        result
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
