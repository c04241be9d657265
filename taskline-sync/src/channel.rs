//! Per-account broadcast channels: binding and event fanout.
//!
//! Every bound connection of one account shares a single tokio broadcast
//! channel. Publishing encodes the event frame once and fans the bytes out
//! to every subscriber; a lagging receiver drops messages instead of
//! stalling the others. Channels are process-local and ephemeral: created
//! on first bind, discarded when the last session unbinds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::identity::{IdentityError, IdentityProvider};
use crate::protocol::{Event, ProtocolError, ServerFrame};

/// Identity of one bound connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub account_id: Uuid,
}

/// Snapshot of a channel's counters.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub events_published: u64,
    pub active_sessions: usize,
}

/// Published-event counter, atomics so publish never takes the session lock.
struct AtomicChannelStats {
    events_published: AtomicU64,
}

/// The fanout group for one account.
pub struct Channel {
    /// Broadcast sender; one receiver per bound session.
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// Sessions currently bound to this channel.
    sessions: Arc<RwLock<HashMap<Uuid, SessionInfo>>>,
    /// Messages buffered per receiver before a slow session starts lagging.
    capacity: usize,
    stats: Arc<AtomicChannelStats>,
}

impl Channel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            stats: Arc::new(AtomicChannelStats {
                events_published: AtomicU64::new(0),
            }),
        }
    }

    /// Register a session and return its receiver.
    pub async fn add_session(&self, info: SessionInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(info.session_id, info);
        self.sender.subscribe()
    }

    /// Remove a session. Removing an already-removed session is a no-op.
    pub async fn remove_session(&self, session_id: &Uuid) -> Option<SessionInfo> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id)
    }

    /// Encode `event` once and deliver it to every bound session,
    /// the originator of the underlying mutation included.
    ///
    /// Returns the number of receivers the message was handed to. Delivery
    /// past that point is best-effort: a receiver that lags or disconnects
    /// simply misses out, without affecting the others.
    pub fn publish(&self, event: &Event) -> Result<usize, ProtocolError> {
        let frame = ServerFrame::Event(event.clone());
        let encoded = Arc::new(frame.encode()?);

        let receivers = self.sender.send(encoded).unwrap_or(0);
        self.stats.events_published.fetch_add(1, Ordering::Relaxed);
        Ok(receivers)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn has_session(&self, session_id: &Uuid) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> ChannelStats {
        let sessions = self.sessions.read().await;
        ChannelStats {
            events_published: self.stats.events_published.load(Ordering::Relaxed),
            active_sessions: sessions.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe without registering a session (monitoring, tests).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}

/// Registry of live channels: `account_id → Channel`.
///
/// Shared by every connection's bind/unbind and every mutation's publish.
/// Passed around explicitly; nothing in this crate reaches for it as a
/// global.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<Uuid, Arc<Channel>>>,
    default_capacity: usize,
}

impl ChannelRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get the channel for an account, creating it on first use.
    pub async fn get_or_create(&self, account_id: Uuid) -> Arc<Channel> {
        // Fast path: read lock
        {
            let channels = self.channels.read().await;
            if let Some(channel) = channels.get(&account_id) {
                return channel.clone();
            }
        }

        let mut channels = self.channels.write().await;
        // Double-check after acquiring write lock
        if let Some(channel) = channels.get(&account_id) {
            return channel.clone();
        }

        let channel = Arc::new(Channel::new(self.default_capacity));
        channels.insert(account_id, channel.clone());
        channel
    }

    pub async fn get(&self, account_id: &Uuid) -> Option<Arc<Channel>> {
        self.channels.read().await.get(account_id).cloned()
    }

    /// Deliver an event to every session bound to `account_id`.
    ///
    /// No channel (no connected sessions) means zero deliveries; that is
    /// not an error, and neither is an undeliverable receiver. By the
    /// time fanout runs the mutation has already committed.
    pub async fn publish(&self, account_id: Uuid, event: &Event) -> usize {
        let channel = match self.get(&account_id).await {
            Some(c) => c,
            None => return 0,
        };
        match channel.publish(event) {
            Ok(receivers) => receivers,
            Err(e) => {
                log::error!("failed to encode {} event: {e}", event.name());
                0
            }
        }
    }

    /// Remove a session binding and discard the channel if it was the last
    /// one. Safe to call repeatedly; double-removal is a no-op.
    pub async fn unbind(&self, account_id: Uuid, session_id: Uuid) {
        let channel = match self.get(&account_id).await {
            Some(c) => c,
            None => return,
        };
        if channel.remove_session(&session_id).await.is_some() {
            log::debug!("session {session_id} unbound from account {account_id}");
        }
        self.remove_if_empty(&account_id).await;
    }

    /// Drop an account's channel if no session is bound to it.
    pub async fn remove_if_empty(&self, account_id: &Uuid) -> bool {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get(account_id) {
            if channel.session_count().await == 0 {
                channels.remove(account_id);
                log::debug!("channel for account {account_id} removed (empty)");
                return true;
            }
        }
        false
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn active_accounts(&self) -> Vec<Uuid> {
        self.channels.read().await.keys().cloned().collect()
    }
}

/// A successful binding: the resolved account, this session's identity,
/// its channel, and its event receiver.
pub struct ChannelHandle {
    pub account_id: Uuid,
    pub session_id: Uuid,
    pub channel: Arc<Channel>,
    pub receiver: broadcast::Receiver<Arc<Vec<u8>>>,
}

/// Authenticates incoming connections and binds them to their account's
/// channel.
pub struct ChannelBinder {
    identity: Arc<dyn IdentityProvider>,
    registry: Arc<ChannelRegistry>,
}

impl ChannelBinder {
    pub fn new(identity: Arc<dyn IdentityProvider>, registry: Arc<ChannelRegistry>) -> Self {
        Self { identity, registry }
    }

    /// Verify `token` and register the session under the resolved account's
    /// channel. A failed verification leaves no partially-bound state: the
    /// registry is only touched after the token resolves.
    pub async fn bind(
        &self,
        session_id: Uuid,
        token: &str,
    ) -> Result<ChannelHandle, IdentityError> {
        let account_id = self.identity.verify(token)?;

        let channel = self.registry.get_or_create(account_id).await;
        let receiver = channel
            .add_session(SessionInfo {
                session_id,
                account_id,
            })
            .await;

        log::info!("session {session_id} bound to account {account_id}");
        Ok(ChannelHandle {
            account_id,
            session_id,
            channel,
            receiver,
        })
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::TokenRegistry;

    fn session(account_id: Uuid) -> SessionInfo {
        SessionInfo {
            session_id: Uuid::new_v4(),
            account_id,
        }
    }

    fn tag_event() -> Event {
        Event::TagDeleted { id: Uuid::new_v4() }
    }

    #[tokio::test]
    async fn test_channel_add_remove_session() {
        let channel = Channel::new(16);
        let account = Uuid::new_v4();
        let info = session(account);
        let session_id = info.session_id;

        let _rx = channel.add_session(info).await;
        assert_eq!(channel.session_count().await, 1);
        assert!(channel.has_session(&session_id).await);

        assert!(channel.remove_session(&session_id).await.is_some());
        assert_eq!(channel.session_count().await, 0);

        // Double-removal is a no-op, not an error
        assert!(channel.remove_session(&session_id).await.is_none());
    }

    #[tokio::test]
    async fn test_publish_reaches_every_session() {
        let channel = Channel::new(16);
        let account = Uuid::new_v4();

        let mut rx1 = channel.add_session(session(account)).await;
        let mut rx2 = channel.add_session(session(account)).await;
        let mut rx3 = channel.add_session(session(account)).await;

        let delivered = channel.publish(&tag_event()).unwrap();
        assert_eq!(delivered, 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let bytes = rx.recv().await.unwrap();
            match ServerFrame::decode(&bytes).unwrap() {
                ServerFrame::Event(Event::TagDeleted { .. }) => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_publish_without_sessions() {
        let channel = Channel::new(16);
        let delivered = channel.publish(&tag_event()).unwrap();
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_channel_stats() {
        let channel = Channel::new(16);
        let _rx = channel.add_session(session(Uuid::new_v4())).await;

        channel.publish(&tag_event()).unwrap();
        channel.publish(&tag_event()).unwrap();

        let stats = channel.stats().await;
        assert_eq!(stats.events_published, 2);
        assert_eq!(stats.active_sessions, 1);
    }

    #[tokio::test]
    async fn test_registry_get_or_create() {
        let registry = ChannelRegistry::new(16);
        let account = Uuid::new_v4();

        let a = registry.get_or_create(account).await;
        let b = registry.get_or_create(account).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.channel_count().await, 1);
    }

    #[tokio::test]
    async fn test_registry_isolates_accounts() {
        let registry = ChannelRegistry::new(16);
        let account_a = Uuid::new_v4();
        let account_b = Uuid::new_v4();

        let channel_a = registry.get_or_create(account_a).await;
        let channel_b = registry.get_or_create(account_b).await;

        let mut rx_a = channel_a.add_session(session(account_a)).await;
        let _rx_b = channel_b.add_session(session(account_b)).await;

        // Publish to A only; B's channel sees nothing
        let delivered = registry.publish(account_a, &tag_event()).await;
        assert_eq!(delivered, 1);
        assert!(rx_a.recv().await.is_ok());

        let stats_b = channel_b.stats().await;
        assert_eq!(stats_b.events_published, 0);
    }

    #[tokio::test]
    async fn test_registry_publish_no_channel() {
        let registry = ChannelRegistry::new(16);
        let delivered = registry.publish(Uuid::new_v4(), &tag_event()).await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_unbind_discards_empty_channel() {
        let registry = ChannelRegistry::new(16);
        let account = Uuid::new_v4();

        let channel = registry.get_or_create(account).await;
        let info = session(account);
        let session_id = info.session_id;
        let _rx = channel.add_session(info).await;
        assert_eq!(registry.channel_count().await, 1);

        registry.unbind(account, session_id).await;
        assert_eq!(registry.channel_count().await, 0);

        // Unbinding again is harmless
        registry.unbind(account, session_id).await;
        assert_eq!(registry.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_remove_if_empty_keeps_occupied_channel() {
        let registry = ChannelRegistry::new(16);
        let account = Uuid::new_v4();

        let channel = registry.get_or_create(account).await;
        let _rx = channel.add_session(session(account)).await;

        assert!(!registry.remove_if_empty(&account).await);
        assert_eq!(registry.channel_count().await, 1);
    }

    #[tokio::test]
    async fn test_binder_rejects_bad_token() {
        let identity = Arc::new(TokenRegistry::new());
        let registry = Arc::new(ChannelRegistry::new(16));
        let binder = ChannelBinder::new(identity, registry.clone());

        let result = binder.bind(Uuid::new_v4(), "bogus").await;
        assert!(matches!(result, Err(IdentityError::Unauthenticated)));

        // No partially-bound state
        assert_eq!(registry.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_binder_binds_verified_session() {
        let identity = Arc::new(TokenRegistry::new());
        let registry = Arc::new(ChannelRegistry::new(16));
        let account = Uuid::new_v4();
        let token = identity.issue(account);

        let binder = ChannelBinder::new(identity, registry.clone());
        let session_id = Uuid::new_v4();
        let handle = binder.bind(session_id, &token).await.unwrap();

        assert_eq!(handle.account_id, account);
        assert_eq!(handle.session_id, session_id);
        assert!(handle.channel.has_session(&session_id).await);
        assert_eq!(registry.channel_count().await, 1);
    }

    #[tokio::test]
    async fn test_two_sessions_share_account_channel() {
        let identity = Arc::new(TokenRegistry::new());
        let registry = Arc::new(ChannelRegistry::new(16));
        let account = Uuid::new_v4();
        let token = identity.issue(account);

        let binder = ChannelBinder::new(identity, registry);
        let a = binder.bind(Uuid::new_v4(), &token).await.unwrap();
        let b = binder.bind(Uuid::new_v4(), &token).await.unwrap();

        assert!(Arc::ptr_eq(&a.channel, &b.channel));
        assert_eq!(a.channel.session_count().await, 2);
    }
}
