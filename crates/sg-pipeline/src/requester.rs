//! Per-requester handle: submits batches and collects their results from a
//! private mailbox.

use crossbeam_channel::{select, Receiver, RecvError, Sender};
use dashmap::DashMap;
use sg_types::{EvaluationError, InputRow, KeySet, PipelineError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::cancel::CancelSignal;
use crate::message::{EvaluationRequest, EvaluationResult};
use crate::stats::PipelineStats;
use crate::token::{CorrelationToken, RequesterId};

pub(crate) type Mailboxes = Arc<DashMap<RequesterId, Sender<EvaluationResult>>>;

enum Wake {
    Delivered(Result<EvaluationResult, RecvError>),
    Expired,
    Cancelled,
}

/// Handle through which one requester talks to an
/// [`EvaluationPipeline`](crate::EvaluationPipeline).
///
/// Results are routed to this handle's mailbox by requester id and matched
/// to slots by token, so the order in which workers finish never matters.
/// Dropping the handle unregisters the mailbox; results still in flight for
/// it are discarded by the router.
pub struct Requester {
    pub(crate) id: RequesterId,
    pub(crate) requests: Sender<EvaluationRequest>,
    pub(crate) mailbox: Receiver<EvaluationResult>,
    pub(crate) mailboxes: Mailboxes,
    pub(crate) input_keys: KeySet,
    pub(crate) cancel: CancelSignal,
    pub(crate) stats: Arc<PipelineStats>,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) submit_timeout: Option<Duration>,
    pub(crate) request_capacity: usize,
    pub(crate) next_batch: u64,
}

impl Requester {
    pub fn id(&self) -> RequesterId {
        self.id
    }

    /// Submit every input and block until each has a result.
    ///
    /// Returns exactly one result per input, in input order, whatever
    /// happened to the request: evaluator failures, timeouts, refused
    /// submissions and cancellation all come back as failure results.
    pub fn evaluate_batch(&mut self, inputs: Vec<InputRow>) -> Vec<EvaluationResult> {
        let batch = self.next_batch;
        self.next_batch += 1;

        let n = inputs.len();
        let mut slots: Vec<Option<EvaluationResult>> = (0..n).map(|_| None).collect();
        let mut deadlines: Vec<Option<Instant>> = vec![None; n];
        let mut outstanding = 0usize;

        for (slot, input) in inputs.into_iter().enumerate() {
            let token = self.token(batch, slot);

            if let Err(shape) = self.input_keys.ensure_same_keys(input.keys()) {
                slots[slot] = Some(EvaluationResult::failure(token, shape.into()));
                continue;
            }
            if self.cancel.is_cancelled() {
                slots[slot] = Some(EvaluationResult::failure(token, EvaluationError::Cancelled));
                continue;
            }

            let request = EvaluationRequest {
                token,
                input,
                submitted_at: Instant::now(),
                timeout: self.request_timeout,
            };
            let deadline = request.deadline();
            match self.submit(request) {
                Ok(()) => {
                    self.stats.record_submitted();
                    deadlines[slot] = deadline;
                    outstanding += 1;
                }
                Err(e) => slots[slot] = Some(EvaluationResult::failure(token, e)),
            }
        }

        while outstanding > 0 {
            let next_deadline = slots
                .iter()
                .zip(&deadlines)
                .filter(|(result, _)| result.is_none())
                .filter_map(|(_, deadline)| *deadline)
                .min();

            match self.wait(next_deadline) {
                Wake::Delivered(Ok(result)) => {
                    let slot = result.token.slot;
                    if result.token.batch != batch || slot >= n || slots[slot].is_some() {
                        trace!(requester = %self.id, token = ?result.token, "discarding stale result");
                        self.stats.record_discarded();
                        continue;
                    }
                    if matches!(result.error(), Some(EvaluationError::TimedOut { .. })) {
                        self.stats.record_timed_out();
                    }
                    slots[slot] = Some(result);
                    outstanding -= 1;
                }
                Wake::Expired => {
                    let now = Instant::now();
                    for slot in 0..n {
                        let expired = matches!(deadlines[slot], Some(d) if d <= now);
                        if expired && slots[slot].is_none() {
                            self.stats.record_timed_out();
                            slots[slot] = Some(EvaluationResult::failure(
                                self.token(batch, slot),
                                self.timed_out(),
                            ));
                            outstanding -= 1;
                        }
                    }
                }
                Wake::Delivered(Err(_)) => {
                    self.fill_pending(
                        &mut slots,
                        batch,
                        EvaluationError::Rejected(PipelineError::Disconnected),
                    );
                    outstanding = 0;
                }
                Wake::Cancelled => {
                    self.fill_pending(&mut slots, batch, EvaluationError::Cancelled);
                    outstanding = 0;
                }
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(slot, result)| {
                result.unwrap_or_else(|| {
                    EvaluationResult::failure(self.token(batch, slot), EvaluationError::Cancelled)
                })
            })
            .collect()
    }

    fn token(&self, batch: u64, slot: usize) -> CorrelationToken {
        CorrelationToken {
            requester: self.id,
            batch,
            slot,
        }
    }

    fn timed_out(&self) -> EvaluationError {
        EvaluationError::TimedOut {
            timeout_ms: self
                .request_timeout
                .map(|t| t.as_millis() as u64)
                .unwrap_or_default(),
        }
    }

    /// Blocks while the request queue is full, up to `submit_timeout`.
    fn submit(&self, request: EvaluationRequest) -> Result<(), EvaluationError> {
        let sent = match self.submit_timeout {
            None => select! {
                send(self.requests, request) -> res => res.map_err(|_| PipelineError::Disconnected),
                recv(self.cancel.watch()) -> _ => Err(PipelineError::ShutDown),
            },
            Some(limit) => select! {
                send(self.requests, request) -> res => res.map_err(|_| PipelineError::Disconnected),
                recv(self.cancel.watch()) -> _ => Err(PipelineError::ShutDown),
                default(limit) => Err(PipelineError::Full { capacity: self.request_capacity }),
            },
        };

        sent.map_err(|e| match e {
            PipelineError::ShutDown => EvaluationError::Cancelled,
            other => EvaluationError::Rejected(other),
        })
    }

    fn wait(&self, deadline: Option<Instant>) -> Wake {
        match deadline {
            Some(deadline) => select! {
                recv(self.mailbox) -> msg => Wake::Delivered(msg),
                recv(self.cancel.watch()) -> _ => Wake::Cancelled,
                default(deadline.saturating_duration_since(Instant::now())) => Wake::Expired,
            },
            None => select! {
                recv(self.mailbox) -> msg => Wake::Delivered(msg),
                recv(self.cancel.watch()) -> _ => Wake::Cancelled,
            },
        }
    }

    fn fill_pending(
        &self,
        slots: &mut [Option<EvaluationResult>],
        batch: u64,
        error: EvaluationError,
    ) {
        for (slot, result) in slots.iter_mut().enumerate() {
            if result.is_none() {
                *result = Some(EvaluationResult::failure(
                    self.token(batch, slot),
                    error.clone(),
                ));
            }
        }
    }
}

impl Drop for Requester {
    fn drop(&mut self) {
        self.mailboxes.remove(&self.id);
    }
}
