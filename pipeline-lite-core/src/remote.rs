//! Remote module bindings.
//!
//! A [`ModuleLink`] is the core's handle on one out-of-process module. Step
//! events are fire-and-forget; facilitation and advice are round trips whose
//! replies arrive later as protocol requests and are matched back to the
//! caller by notify id.

use crate::adviser::{Advise, Adviser, AdvisingEvent};
use crate::engine::outside_dispatch;
use crate::error::EngineError;
use crate::facilitator::{FacilitationRequest, Facilitator, FacilitatorResponse};
use crate::protocol::{ModuleChannel, ModuleEvent};
use crate::types::CorrelationId;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

type ReplySender = oneshot::Sender<std::result::Result<Value, String>>;

pub struct ModuleLink {
    name: String,
    channel: Arc<dyn ModuleChannel>,
    /// Round trips awaiting a reply, keyed by notify id.
    pending: Mutex<HashMap<CorrelationId, ReplySender>>,
    timeout: Duration,
}

impl ModuleLink {
    pub fn new(
        name: impl Into<String>,
        channel: Arc<dyn ModuleChannel>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            channel,
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn send(&self, event: ModuleEvent) -> Result<()> {
        tracing::debug!(module = %self.name, event = event.kind(), "Sending module event");
        self.channel
            .send(event)
            .await
            .map_err(|e| {
                EngineError::Remote {
                    module: self.name.clone(),
                    message: e.to_string(),
                }
                .into()
            })
    }

    /// Send `event` and wait for the reply correlated by `notify_id`. The
    /// caller's dispatch permit is released for the wait.
    pub async fn request(&self, notify_id: &str, event: ModuleEvent) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().map_err(|e| anyhow!("Lock: {}", e))?;
            pending.insert(notify_id.to_string(), tx);
        }
        if let Err(e) = self.send(event).await {
            self.evict(notify_id)?;
            return Err(e);
        }

        match outside_dispatch(tokio::time::timeout(self.timeout, rx)).await? {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(EngineError::Remote {
                module: self.name.clone(),
                message,
            }
            .into()),
            Ok(Err(_)) => Err(EngineError::Remote {
                module: self.name.clone(),
                message: "reply channel dropped".to_string(),
            }
            .into()),
            Err(_) => {
                self.evict(notify_id)?;
                tracing::warn!(
                    module = %self.name,
                    notify_id = %notify_id,
                    "Remote call timed out"
                );
                Err(EngineError::RemoteTimeout {
                    module: self.name.clone(),
                    timeout_ms: self.timeout.as_millis() as u64,
                }
                .into())
            }
        }
    }

    /// Hand a reply to the waiting caller. `false` when nobody waits for it
    /// (late or duplicate reply).
    pub fn complete_reply(
        &self,
        notify_id: &str,
        result: std::result::Result<Value, String>,
    ) -> Result<bool> {
        let sender = {
            let mut pending = self.pending.lock().map_err(|e| anyhow!("Lock: {}", e))?;
            pending.remove(notify_id)
        };
        match sender {
            Some(tx) => Ok(tx.send(result).is_ok()),
            None => Ok(false),
        }
    }

    pub fn is_pending(&self, notify_id: &str) -> Result<bool> {
        let pending = self.pending.lock().map_err(|e| anyhow!("Lock: {}", e))?;
        Ok(pending.contains_key(notify_id))
    }

    fn evict(&self, notify_id: &str) -> Result<()> {
        let mut pending = self.pending.lock().map_err(|e| anyhow!("Lock: {}", e))?;
        pending.remove(notify_id);
        Ok(())
    }
}

// ─── Proxies ──────────────────────────────────────────────────

/// Facilitator whose decision is made by a remote module.
pub struct RemoteFacilitator {
    link: Arc<ModuleLink>,
    facilitator_type: String,
}

impl RemoteFacilitator {
    pub fn new(link: Arc<ModuleLink>, facilitator_type: impl Into<String>) -> Self {
        Self {
            link,
            facilitator_type: facilitator_type.into(),
        }
    }
}

#[async_trait]
impl Facilitator for RemoteFacilitator {
    async fn facilitate(
        &self,
        request: &FacilitationRequest,
    ) -> Result<Option<FacilitatorResponse>> {
        let notify_id = format!("facilitate-{}", Uuid::now_v7());
        let reply = self
            .link
            .request(
                &notify_id,
                ModuleEvent::FacilitatorEvent {
                    notify_id: notify_id.clone(),
                    facilitator_type: self.facilitator_type.clone(),
                    request: request.clone(),
                },
            )
            .await?;
        serde_json::from_value(reply).context("Decoding facilitation reply")
    }
}

/// Adviser whose decision is made by a remote module.
pub struct RemoteAdviser {
    link: Arc<ModuleLink>,
    adviser_type: String,
}

impl RemoteAdviser {
    pub fn new(link: Arc<ModuleLink>, adviser_type: impl Into<String>) -> Self {
        Self {
            link,
            adviser_type: adviser_type.into(),
        }
    }
}

#[async_trait]
impl Adviser for RemoteAdviser {
    async fn advise(&self, event: &AdvisingEvent) -> Result<Option<Advise>> {
        let notify_id = format!("advise-{}", Uuid::now_v7());
        let reply = self
            .link
            .request(
                &notify_id,
                ModuleEvent::AdviseEvent {
                    notify_id: notify_id.clone(),
                    adviser_type: self.adviser_type.clone(),
                    event: event.clone(),
                },
            )
            .await?;
        serde_json::from_value(reply).context("Decoding advise reply")
    }
}
