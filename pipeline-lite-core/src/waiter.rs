//! Wait/notify engine.
//!
//! Callbacks are parked against a set of correlation ids and fire once every
//! id has been delivered. Fired callbacks are handed to a single listener
//! over an mpsc channel; the engine's listener turns them into resumes.
//!
//! Deliveries are remembered, so a response that arrives before its waiter
//! is registered still counts, and a second delivery for the same id is a
//! no-op. [`WaitNotifyEngine::prune_settled`] forgets settled ids once they
//! are old enough that no redelivery is expected.

use crate::facilitator::FacilitatorResponse;
use crate::types::*;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Why a parked callback is being resumed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum NotifyCallback {
    /// Re-enter a waiting node's step with the collected responses.
    EngineResume { node_execution_id: Uuid },
    /// Invoke a node whose facilitator asked for an initial wait.
    EngineWaitResume {
        node_execution_id: Uuid,
        facilitator_response: FacilitatorResponse,
    },
    /// Start a node queued by a retry advise once its wait elapsed.
    RetryAfterWait { node_execution_id: Uuid },
}

impl NotifyCallback {
    pub fn node_execution_id(&self) -> Uuid {
        match self {
            Self::EngineResume { node_execution_id }
            | Self::EngineWaitResume {
                node_execution_id, ..
            }
            | Self::RetryAfterWait { node_execution_id } => *node_execution_id,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FiredCallback {
    pub wait_id: Uuid,
    pub callback: NotifyCallback,
    pub responses: ResponseMap,
}

struct Wait {
    group: String,
    callback: NotifyCallback,
    correlation_ids: Vec<CorrelationId>,
}

#[derive(Default)]
struct WaitState {
    waits: HashMap<Uuid, Wait>,
    by_correlation: HashMap<CorrelationId, Vec<Uuid>>,
    responses: HashMap<CorrelationId, (ResponseData, Timestamp)>,
    /// Ids whose responses were handed to a fired callback, with when.
    consumed: HashMap<CorrelationId, Timestamp>,
}

impl WaitState {
    fn is_delivered(&self, id: &str) -> bool {
        self.responses.contains_key(id) || self.consumed.contains_key(id)
    }

    /// Fire `wait_id` if all its ids are in. Moves the responses out.
    fn try_fire(&mut self, wait_id: Uuid) -> Option<FiredCallback> {
        let ready = self
            .waits
            .get(&wait_id)
            .is_some_and(|w| w.correlation_ids.iter().all(|id| self.responses.contains_key(id)));
        if !ready {
            return None;
        }
        let wait = self.waits.remove(&wait_id)?;
        let fired_at = now();
        let mut responses = ResponseMap::new();
        for id in &wait.correlation_ids {
            if let Some((data, _)) = self.responses.remove(id) {
                responses.insert(id.clone(), data);
            }
            self.consumed.insert(id.clone(), fired_at);
            if let Some(waiters) = self.by_correlation.get_mut(id) {
                waiters.retain(|w| *w != wait_id);
                if waiters.is_empty() {
                    self.by_correlation.remove(id);
                }
            }
        }
        Some(FiredCallback {
            wait_id,
            callback: wait.callback,
            responses,
        })
    }
}

pub struct WaitNotifyEngine {
    state: Mutex<WaitState>,
    tx: mpsc::Sender<FiredCallback>,
}

impl WaitNotifyEngine {
    /// Engine plus the receiving end its listener drains.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<FiredCallback>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Arc::new(Self {
                state: Mutex::new(WaitState::default()),
                tx,
            }),
            rx,
        )
    }

    /// Park `callback` until every id in `correlation_ids` is delivered.
    pub async fn wait_for_all_on(
        &self,
        group: &str,
        callback: NotifyCallback,
        correlation_ids: Vec<CorrelationId>,
    ) -> Result<Uuid> {
        let wait_id = Uuid::now_v7();
        let fired = {
            let mut state = self.state.lock().map_err(|e| anyhow!("Lock: {}", e))?;
            for id in &correlation_ids {
                state
                    .by_correlation
                    .entry(id.clone())
                    .or_default()
                    .push(wait_id);
            }
            state.waits.insert(
                wait_id,
                Wait {
                    group: group.to_string(),
                    callback,
                    correlation_ids,
                },
            );
            state.try_fire(wait_id)
        };
        tracing::debug!(wait_id = %wait_id, group = %group, "Callback parked");
        if let Some(fired) = fired {
            self.dispatch(fired).await?;
        }
        Ok(wait_id)
    }

    /// Deliver a response. Returns `false` for a duplicate delivery.
    pub async fn done_with(&self, correlation_id: &str, data: ResponseData) -> Result<bool> {
        let fired = {
            let mut state = self.state.lock().map_err(|e| anyhow!("Lock: {}", e))?;
            if state.is_delivered(correlation_id) {
                tracing::warn!(correlation_id = %correlation_id, "Duplicate notify ignored");
                return Ok(false);
            }
            state
                .responses
                .insert(correlation_id.to_string(), (data, now()));
            let waiters = state
                .by_correlation
                .get(correlation_id)
                .cloned()
                .unwrap_or_default();
            waiters
                .into_iter()
                .filter_map(|w| state.try_fire(w))
                .collect::<Vec<_>>()
        };
        tracing::debug!(correlation_id = %correlation_id, "Notify delivered");
        for f in fired {
            self.dispatch(f).await?;
        }
        Ok(true)
    }

    async fn dispatch(&self, fired: FiredCallback) -> Result<()> {
        tracing::debug!(
            wait_id = %fired.wait_id,
            node_execution_id = %fired.callback.node_execution_id(),
            "Callback fired"
        );
        self.tx
            .send(fired)
            .await
            .map_err(|_| anyhow!("Notify listener has shut down"))
    }

    /// Responses delivered so far for ids still being waited on.
    pub fn responses_for(&self, correlation_ids: &[CorrelationId]) -> Result<ResponseMap> {
        let state = self.state.lock().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(correlation_ids
            .iter()
            .filter_map(|id| state.responses.get(id).map(|(d, _)| (id.clone(), d.clone())))
            .collect())
    }

    /// Drop every wait registered under `group`. Returns how many were dropped.
    pub fn cancel_group(&self, group: &str) -> Result<usize> {
        let mut state = self.state.lock().map_err(|e| anyhow!("Lock: {}", e))?;
        let doomed: Vec<Uuid> = state
            .waits
            .iter()
            .filter(|(_, w)| w.group == group)
            .map(|(id, _)| *id)
            .collect();
        for wait_id in &doomed {
            if let Some(wait) = state.waits.remove(wait_id) {
                for id in wait.correlation_ids {
                    if let Some(waiters) = state.by_correlation.get_mut(&id) {
                        waiters.retain(|w| w != wait_id);
                        if waiters.is_empty() {
                            state.by_correlation.remove(&id);
                        }
                    }
                }
            }
        }
        Ok(doomed.len())
    }

    /// Forget ids settled before `before`: consumed ids, and delivered
    /// responses no wait is registered for. A later delivery of a forgotten
    /// id counts as new. Returns how many ids were dropped.
    pub fn prune_settled(&self, before: Timestamp) -> Result<usize> {
        let mut state = self.state.lock().map_err(|e| anyhow!("Lock: {}", e))?;
        let WaitState {
            by_correlation,
            responses,
            consumed,
            ..
        } = &mut *state;
        let initial = responses.len() + consumed.len();
        consumed.retain(|_, at| *at > before);
        responses.retain(|id, (_, at)| *at > before || by_correlation.contains_key(id));
        let dropped = initial - responses.len() - consumed.len();
        if dropped > 0 {
            tracing::debug!(dropped, "Settled correlation ids pruned");
        }
        Ok(dropped)
    }

    /// Ids remembered for duplicate detection or early delivery.
    pub fn settled_count(&self) -> Result<usize> {
        let state = self.state.lock().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(state.responses.len() + state.consumed.len())
    }

    pub fn pending_waits(&self) -> Result<usize> {
        let state = self.state.lock().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(state.waits.len())
    }

    /// Deliver `ResponseData::Delay` to a fresh id after `delay`. Returns the id.
    pub fn schedule_delay(self: &Arc<Self>, delay: Duration) -> CorrelationId {
        let delay_id = format!("delay-{}", Uuid::now_v7());
        let engine = Arc::clone(self);
        let id = delay_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = engine.done_with(&id, ResponseData::Delay).await {
                tracing::error!(correlation_id = %id, error = %e, "Delay delivery failed");
            }
        });
        delay_id
    }

    /// After `timeout`, fail every id in `correlation_ids` that is still
    /// undelivered with an EXPIRED error.
    pub fn schedule_timeout(
        self: &Arc<Self>,
        correlation_ids: Vec<CorrelationId>,
        timeout: Duration,
    ) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            for id in correlation_ids {
                let info = FailureInfo::new(
                    format!("no response for '{}' within {}ms", id, timeout.as_millis()),
                    FailureType::Expired,
                );
                if let Err(e) = engine.done_with(&id, ResponseData::Error(info)).await {
                    tracing::error!(correlation_id = %id, error = %e, "Timeout delivery failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resume(id: Uuid) -> NotifyCallback {
        NotifyCallback::EngineResume {
            node_execution_id: id,
        }
    }

    #[tokio::test]
    async fn test_fires_only_when_all_delivered() {
        let (engine, mut rx) = WaitNotifyEngine::new(8);
        let node = Uuid::now_v7();
        engine
            .wait_for_all_on("g", resume(node), vec!["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();

        engine.done_with("a", ResponseData::Delay).await.unwrap();
        engine.done_with("b", ResponseData::Delay).await.unwrap();
        assert!(rx.try_recv().is_err());

        engine.done_with("c", ResponseData::Delay).await.unwrap();
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.callback, resume(node));
        assert_eq!(fired.responses.len(), 3);
        assert_eq!(engine.pending_waits().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_noop() {
        let (engine, mut rx) = WaitNotifyEngine::new(8);
        engine
            .wait_for_all_on("g", resume(Uuid::now_v7()), vec!["x".into()])
            .await
            .unwrap();
        assert!(engine.done_with("x", ResponseData::Delay).await.unwrap());
        assert!(!engine.done_with("x", ResponseData::Delay).await.unwrap());
        rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_early_response_counts() {
        let (engine, mut rx) = WaitNotifyEngine::new(8);
        engine.done_with("early", ResponseData::Delay).await.unwrap();
        assert_eq!(engine.responses_for(&["early".into()]).unwrap().len(), 1);
        engine
            .wait_for_all_on("g", resume(Uuid::now_v7()), vec!["early".into()])
            .await
            .unwrap();
        let fired = rx.recv().await.unwrap();
        assert!(fired.responses.contains_key("early"));
    }

    #[tokio::test]
    async fn test_cancel_group_drops_waits() {
        let (engine, mut rx) = WaitNotifyEngine::new(8);
        engine
            .wait_for_all_on("node-1", resume(Uuid::now_v7()), vec!["k".into()])
            .await
            .unwrap();
        assert_eq!(engine.cancel_group("node-1").unwrap(), 1);
        engine.done_with("k", ResponseData::Delay).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_prune_settled_forgets_old_ids() {
        let (engine, mut rx) = WaitNotifyEngine::new(8);
        engine
            .wait_for_all_on("g", resume(Uuid::now_v7()), vec!["done".into(), "open".into()])
            .await
            .unwrap();
        engine.done_with("done", ResponseData::Delay).await.unwrap();
        engine
            .wait_for_all_on("h", resume(Uuid::now_v7()), vec!["fired".into()])
            .await
            .unwrap();
        engine.done_with("fired", ResponseData::Delay).await.unwrap();
        rx.recv().await.unwrap();
        engine.done_with("stray", ResponseData::Delay).await.unwrap();
        assert_eq!(engine.settled_count().unwrap(), 3);

        assert_eq!(engine.prune_settled(now() - chrono::Duration::hours(1)).unwrap(), 0);
        // "done" stays: a wait still needs it.
        assert_eq!(engine.prune_settled(now()).unwrap(), 2);
        assert_eq!(engine.settled_count().unwrap(), 1);
        assert_eq!(engine.responses_for(&["done".into()]).unwrap().len(), 1);
        assert!(engine.done_with("fired", ResponseData::Delay).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_and_timeout_deliver() {
        let (engine, mut rx) = WaitNotifyEngine::new(8);
        let delay_id = engine.schedule_delay(Duration::from_millis(500));
        engine
            .wait_for_all_on("g", resume(Uuid::now_v7()), vec![delay_id.clone()])
            .await
            .unwrap();
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.responses.get(&delay_id), Some(&ResponseData::Delay));

        engine
            .wait_for_all_on("g", resume(Uuid::now_v7()), vec!["cb".into()])
            .await
            .unwrap();
        engine.schedule_timeout(vec!["cb".into()], Duration::from_secs(2));
        let fired = rx.recv().await.unwrap();
        assert!(fired.responses["cb"].is_error());
    }
}
