//! Head sources: produce "new head" notifications for the block tracker.
//!
//! Two interchangeable strategies implement [`HeadSource`]:
//! - [`PollingHeadSource`] asks the provider for the latest block on an interval.
//! - [`PushHeadSource`] consumes a `newHeads` push subscription.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{ProviderError, TrackerError};
use crate::provider::{BlockTag, ChainProvider};
use crate::types::Block;

/// Receives every block a head source delivers.
///
/// Transient errors ([`TrackerError::is_transient`]) are logged and the
/// head is dropped; any other error stops the head source and is returned
/// from [`HeadSource::track`].
#[async_trait]
pub trait HeadHandler: Send + Sync {
    async fn on_block(&self, block: Block) -> Result<(), TrackerError>;
}

/// A producer of new-head notifications.
#[async_trait]
pub trait HeadSource: Send + Sync {
    /// Deliver heads to `handler` until `cancel` fires (returns `Ok(())`)
    /// or the handler fails.
    async fn track(
        &self,
        cancel: CancellationToken,
        handler: &dyn HeadHandler,
    ) -> Result<(), TrackerError>;
}

// ─── Polling ──────────────────────────────────────────────────────────────────

/// Polls `latest` every `interval` and forwards blocks whose hash changed.
pub struct PollingHeadSource<P> {
    provider: Arc<P>,
    interval: Duration,
}

impl<P: ChainProvider> PollingHeadSource<P> {
    pub fn new(provider: Arc<P>, interval: Duration) -> Self {
        Self { provider, interval }
    }
}

#[async_trait]
impl<P: ChainProvider> HeadSource for PollingHeadSource<P> {
    async fn track(
        &self,
        cancel: CancellationToken,
        handler: &dyn HeadHandler,
    ) -> Result<(), TrackerError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_hash: Option<String> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let fetched = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = self.provider.block_by_number(BlockTag::Latest) => res,
            };
            let block = match fetched {
                Ok(Some(block)) => block,
                Ok(None) => {
                    tracing::warn!("provider returned no latest block");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to poll latest block");
                    continue;
                }
            };

            if last_hash.as_deref() == Some(block.hash.as_str()) {
                continue;
            }
            last_hash = Some(block.hash.clone());
            tracing::debug!(number = block.number, hash = %block.hash, "new head (poll)");
            if let Err(e) = handler.on_block(block).await {
                if !e.is_transient() {
                    return Err(e);
                }
                tracing::warn!(error = %e, "head rejected; retrying on the next poll");
                last_hash = None;
            }
        }
    }
}

// ─── Push ─────────────────────────────────────────────────────────────────────

/// An active push subscription: raw notification payloads plus the
/// unsubscribe action, fired when the subscription is dropped.
pub struct HeadSubscription {
    messages: BoxStream<'static, Value>,
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl HeadSubscription {
    pub fn new(
        messages: BoxStream<'static, Value>,
        unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            messages,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    async fn recv(&mut self) -> Option<Value> {
        self.messages.next().await
    }
}

impl Drop for HeadSubscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

/// A push-subscription primitive (e.g. `eth_subscribe` over a websocket).
#[async_trait]
pub trait HeadSubscriber: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<HeadSubscription, ProviderError>;
}

/// Forwards every decodable `newHeads` notification.
pub struct PushHeadSource<S> {
    subscriber: Arc<S>,
    topic: String,
}

impl<S: HeadSubscriber> PushHeadSource<S> {
    pub fn new(subscriber: Arc<S>) -> Self {
        Self {
            subscriber,
            topic: "newHeads".into(),
        }
    }

    /// Subscribe to a topic other than `newHeads`.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }
}

#[async_trait]
impl<S: HeadSubscriber + 'static> HeadSource for PushHeadSource<S> {
    async fn track(
        &self,
        cancel: CancellationToken,
        handler: &dyn HeadHandler,
    ) -> Result<(), TrackerError> {
        let mut subscription = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = self.subscriber.subscribe(&self.topic) => res?,
        };
        tracing::info!(topic = %self.topic, "head subscription established");

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                msg = subscription.recv() => msg,
            };
            let Some(message) = message else {
                return Err(TrackerError::Provider(ProviderError::Transport(
                    "head subscription closed".into(),
                )));
            };
            match serde_json::from_value::<Block>(message) {
                Ok(block) => {
                    tracing::debug!(number = block.number, hash = %block.hash, "new head (push)");
                    if let Err(e) = handler.on_block(block).await {
                        if !e.is_transient() {
                            return Err(e);
                        }
                        tracing::warn!(error = %e, "head rejected; waiting for the next one");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed head notification");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    use crate::provider::LogQuery;
    use crate::types::Log;

    struct Recorder(Mutex<Vec<Block>>);

    #[async_trait]
    impl HeadHandler for Recorder {
        async fn on_block(&self, block: Block) -> Result<(), TrackerError> {
            self.0.lock().unwrap().push(block);
            Ok(())
        }
    }

    fn block(number: u64) -> Block {
        Block {
            number,
            hash: format!("0x{number:x}"),
            parent_hash: format!("0x{:x}", number.saturating_sub(1)),
            timestamp: number * 12,
        }
    }

    /// Head advances every third call; the second call fails.
    struct FlakyHead {
        calls: AtomicU64,
    }

    #[async_trait]
    impl ChainProvider for FlakyHead {
        async fn block_number(&self) -> Result<u64, ProviderError> {
            Ok(0)
        }
        async fn block_by_number(&self, _tag: BlockTag) -> Result<Option<Block>, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 1 {
                return Err(ProviderError::Transport("connection reset".into()));
            }
            Ok(Some(block(call / 3)))
        }
        async fn block_by_hash(&self, _h: &str, _f: bool) -> Result<Option<Block>, ProviderError> {
            Ok(None)
        }
        async fn get_logs(&self, _q: &LogQuery) -> Result<Vec<Log>, ProviderError> {
            Ok(vec![])
        }
        async fn chain_id(&self) -> Result<u64, ProviderError> {
            Ok(1)
        }
    }

    #[tokio::test]
    async fn polling_skips_duplicates_and_survives_errors() {
        let provider = Arc::new(FlakyHead {
            calls: AtomicU64::new(0),
        });
        let source = PollingHeadSource::new(provider, Duration::from_millis(1));
        let recorder = Recorder(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stopper.cancel();
        });
        source.track(cancel, &recorder).await.unwrap();

        let seen = recorder.0.lock().unwrap();
        assert!(seen.len() >= 2, "expected several heads, got {}", seen.len());
        for pair in seen.windows(2) {
            assert_ne!(pair[0].hash, pair[1].hash);
        }
    }

    struct ScriptedSubscriber {
        messages: Vec<Value>,
        unsubscribed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl HeadSubscriber for ScriptedSubscriber {
        async fn subscribe(&self, topic: &str) -> Result<HeadSubscription, ProviderError> {
            assert_eq!(topic, "newHeads");
            let flag = self.unsubscribed.clone();
            let stream = futures::stream::iter(self.messages.clone())
                .chain(futures::stream::pending())
                .boxed();
            Ok(HeadSubscription::new(stream, move || flag.store(true, Ordering::SeqCst)))
        }
    }

    #[tokio::test]
    async fn push_drops_malformed_messages() {
        let unsubscribed = Arc::new(AtomicBool::new(false));
        let subscriber = Arc::new(ScriptedSubscriber {
            messages: vec![
                serde_json::to_value(block(1)).unwrap(),
                serde_json::json!({"garbage": true}),
                serde_json::to_value(block(2)).unwrap(),
            ],
            unsubscribed: unsubscribed.clone(),
        });
        let source = PushHeadSource::new(subscriber);
        let recorder = Recorder(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });
        source.track(cancel, &recorder).await.unwrap();

        let numbers: Vec<u64> = recorder.0.lock().unwrap().iter().map(|b| b.number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert!(unsubscribed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn push_reports_closed_subscription() {
        struct Closing;

        #[async_trait]
        impl HeadSubscriber for Closing {
            async fn subscribe(&self, _topic: &str) -> Result<HeadSubscription, ProviderError> {
                Ok(HeadSubscription::new(futures::stream::empty().boxed(), || {}))
            }
        }

        let source = PushHeadSource::new(Arc::new(Closing));
        let recorder = Recorder(Mutex::new(Vec::new()));
        let err = source
            .track(CancellationToken::new(), &recorder)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Provider(ProviderError::Transport(_))));
    }

    /// Rejects the first `transient` heads with a missing-block error, then
    /// fails fatally on block `fatal_at`.
    struct Picky {
        seen: Mutex<Vec<u64>>,
        transient: u64,
        fatal_at: u64,
    }

    #[async_trait]
    impl HeadHandler for Picky {
        async fn on_block(&self, block: Block) -> Result<(), TrackerError> {
            let mut seen = self.seen.lock().unwrap();
            seen.push(block.number);
            if block.number == self.fatal_at {
                return Err(TrackerError::ReorgTooDeep {
                    at: block.number,
                    backlog: 1,
                });
            }
            if (seen.len() as u64) <= self.transient {
                return Err(TrackerError::BlockNotFound(block.parent_hash));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn push_skips_transient_handler_errors_and_stops_on_fatal() {
        let subscriber = Arc::new(ScriptedSubscriber {
            messages: (1..=5)
                .map(|n| serde_json::to_value(block(n)).unwrap())
                .collect(),
            unsubscribed: Arc::new(AtomicBool::new(false)),
        });
        let source = PushHeadSource::new(subscriber);
        let handler = Picky {
            seen: Mutex::new(Vec::new()),
            transient: 2,
            fatal_at: 4,
        };
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            source.track(CancellationToken::new(), &handler),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, TrackerError::ReorgTooDeep { at: 4, .. }));
        assert_eq!(*handler.seen.lock().unwrap(), vec![1, 2, 3, 4]);
    }

    /// Always reports the same latest block.
    struct FixedHead;

    #[async_trait]
    impl ChainProvider for FixedHead {
        async fn block_number(&self) -> Result<u64, ProviderError> {
            Ok(7)
        }
        async fn block_by_number(&self, _tag: BlockTag) -> Result<Option<Block>, ProviderError> {
            Ok(Some(block(7)))
        }
        async fn block_by_hash(&self, _h: &str, _f: bool) -> Result<Option<Block>, ProviderError> {
            Ok(None)
        }
        async fn get_logs(&self, _q: &LogQuery) -> Result<Vec<Log>, ProviderError> {
            Ok(vec![])
        }
        async fn chain_id(&self) -> Result<u64, ProviderError> {
            Ok(1)
        }
    }

    #[tokio::test]
    async fn polling_redelivers_a_rejected_head() {
        let source = PollingHeadSource::new(Arc::new(FixedHead), Duration::from_millis(1));
        let handler = Picky {
            seen: Mutex::new(Vec::new()),
            transient: 2,
            fatal_at: u64::MAX,
        };
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stopper.cancel();
        });
        source.track(cancel, &handler).await.unwrap();

        // Rejected twice, accepted once, then deduplicated.
        assert_eq!(*handler.seen.lock().unwrap(), vec![7, 7, 7]);
    }
}
