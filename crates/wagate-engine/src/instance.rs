//! Per-instance lifecycle controller.
//!
//! An `Instance` owns at most one protocol client at a time. Connecting
//! replaces the previous client, allocates a fresh cancellation scope, and
//! starts the background actors (pairing listener, keep-alive, audio
//! transcription) inside a `TaskTracker` tied to that scope. Status, phone and
//! pairing code only change through [`Instance::transition`] and
//! [`Instance::transition_from`]; background actors carry the link generation
//! they were started for, so anything they report after the link was replaced
//! or torn down is ignored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use wagate_core::protocol::{
    InboundMessage, MediaRef, MessagePayload, PairingEvent, Presence, ProtocolClient,
    ProtocolConnector, ProtocolEvent, ProtocolEventHandler, SendReceipt,
};
use wagate_core::security::constant_time_eq;
use wagate_core::transcription::Transcriber;
use wagate_core::{ConnectionStatus, InstanceEvent, InstanceId, NormalizedMessage};
use wagate_store::{InstanceConfigUpdate, InstanceRecord, InstanceRepo};

use crate::config::EngineConfig;
use crate::error::InstanceError;
use crate::fanout::{EventFanout, Subscription};
use crate::normalize::{normalize, resolve_sender};
use crate::outbound::{self, recipient_jid, MediaMessage, TypingDelay};
use crate::webhook::{WebhookDispatcher, WebhookPayload, MESSAGE_EVENT};

/// Collaborators shared by every instance of one manager.
pub struct Services {
    pub connector: Arc<dyn ProtocolConnector>,
    pub repo: InstanceRepo,
    pub webhook: WebhookDispatcher,
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub config: EngineConfig,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceSettings {
    pub api_key: String,
    pub webhook_url: Option<String>,
    pub transcription_enabled: bool,
    pub typing: TypingDelay,
}

impl InstanceSettings {
    fn from_record(record: &InstanceRecord) -> Self {
        Self {
            api_key: record.api_key.clone(),
            webhook_url: record.webhook_url.clone(),
            transcription_enabled: record.transcription_enabled,
            typing: TypingDelay {
                min_ms: record.typing_delay_min,
                max_ms: record.typing_delay_max,
            },
        }
    }
}

/// Read-only view served by the API layer.
#[derive(Clone, Debug, Serialize)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub name: String,
    pub api_key: String,
    pub status: ConnectionStatus,
    pub phone: Option<String>,
    pub webhook_url: Option<String>,
    pub transcription_enabled: bool,
    pub typing_delay_min: u32,
    pub typing_delay_max: u32,
    pub created_at: String,
}

#[derive(Debug, Default)]
struct RuntimeState {
    /// Bumped whenever the current link is replaced or released.
    generation: u64,
    status: ConnectionStatus,
    phone: Option<String>,
    pairing_code: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum StateChange {
    Connecting,
    Connected { phone: Option<String> },
    /// `forget_phone` is set for explicit disconnects, not for network drops.
    Disconnected { forget_phone: bool },
    PairingCode(String),
}

impl RuntimeState {
    /// Applies `change`, returning the event to publish and whether the
    /// persisted columns changed.
    fn apply(&mut self, change: StateChange) -> (Option<InstanceEvent>, bool) {
        let before = (self.status, self.phone.clone());
        let event = match change {
            StateChange::Connecting => {
                self.status = ConnectionStatus::Connecting;
                None
            }
            StateChange::Connected { phone } => {
                let was_connected = self.status.is_connected();
                self.status = ConnectionStatus::Connected;
                self.pairing_code = None;
                if phone.is_some() {
                    self.phone = phone;
                }
                let phone_changed = before.1 != self.phone;
                (!was_connected || phone_changed).then(|| InstanceEvent::Connected {
                    phone: self.phone.clone().unwrap_or_default(),
                })
            }
            StateChange::Disconnected { forget_phone } => {
                let was = self.status;
                self.status = ConnectionStatus::Disconnected;
                self.pairing_code = None;
                if forget_phone {
                    self.phone = None;
                }
                (was != ConnectionStatus::Disconnected).then_some(InstanceEvent::Disconnected {})
            }
            StateChange::PairingCode(code) => {
                if self.status.is_connected() {
                    None
                } else {
                    self.pairing_code = Some(code.clone());
                    Some(InstanceEvent::Qr { qrcode: code })
                }
            }
        };
        let dirty = before != (self.status, self.phone.clone());
        (event, dirty)
    }
}

struct ActiveLink {
    client: Arc<dyn ProtocolClient>,
    scope: CancellationToken,
    tasks: TaskTracker,
}

impl ActiveLink {
    /// Cancels the scope, releases the client and joins every task it started.
    async fn shutdown(self) {
        self.scope.cancel();
        self.client.disconnect().await;
        self.tasks.close();
        self.tasks.wait().await;
    }
}

pub struct Instance {
    id: InstanceId,
    name: String,
    created_at: String,
    settings: RwLock<InstanceSettings>,
    state: Mutex<RuntimeState>,
    /// Replace barrier: held across the whole of connect and disconnect.
    link: tokio::sync::Mutex<Option<ActiveLink>>,
    current: RwLock<Option<Arc<dyn ProtocolClient>>>,
    fanout: Arc<EventFanout>,
    services: Arc<Services>,
    destroyed: AtomicBool,
}

impl Instance {
    /// Builds a disconnected instance from its stored record.
    pub fn new(record: &InstanceRecord, services: Arc<Services>) -> Arc<Self> {
        Arc::new(Self {
            id: record.id.clone(),
            name: record.name.clone(),
            created_at: record.created_at.clone(),
            settings: RwLock::new(InstanceSettings::from_record(record)),
            state: Mutex::new(RuntimeState {
                phone: record.phone.clone(),
                ..RuntimeState::default()
            }),
            link: tokio::sync::Mutex::new(None),
            current: RwLock::new(None),
            fanout: EventFanout::new(services.config.subscriber_capacity),
            services,
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> InstanceSettings {
        self.settings.read().clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Recorded status, as driven by protocol callbacks and keep-alive.
    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    /// Recorded status, downgraded to disconnected when it claims a connection
    /// the current client no longer has.
    pub fn live_status(&self) -> ConnectionStatus {
        let recorded = self.status();
        let alive = self.current.read().as_ref().is_some_and(|c| c.is_connected());
        if recorded.is_connected() && !alive {
            ConnectionStatus::Disconnected
        } else {
            recorded
        }
    }

    pub fn phone(&self) -> Option<String> {
        self.state.lock().phone.clone()
    }

    pub fn pairing_code(&self) -> Option<String> {
        self.state.lock().pairing_code.clone()
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let settings = self.settings();
        InstanceSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            api_key: settings.api_key,
            status: self.live_status(),
            phone: self.phone(),
            webhook_url: settings.webhook_url,
            transcription_enabled: settings.transcription_enabled,
            typing_delay_min: settings.typing.min_ms,
            typing_delay_max: settings.typing.max_ms,
            created_at: self.created_at.clone(),
        }
    }

    pub fn verify_api_key(&self, candidate: &str) -> bool {
        constant_time_eq(self.settings.read().api_key.as_bytes(), candidate.as_bytes())
    }

    pub(crate) fn set_webhook(&self, url: Option<String>) {
        self.settings.write().webhook_url = url;
    }

    pub(crate) fn set_config(&self, config: &InstanceConfigUpdate) {
        let mut settings = self.settings.write();
        settings.transcription_enabled = config.transcription_enabled;
        settings.typing = TypingDelay {
            min_ms: config.typing_delay_min,
            max_ms: config.typing_delay_max,
        };
    }

    pub(crate) fn set_api_key(&self, api_key: String) {
        self.settings.write().api_key = api_key;
    }

    /// Live event stream. A pending pairing code is replayed first.
    pub fn subscribe(&self) -> Subscription {
        let state = self.state.lock();
        let replay = state
            .pairing_code
            .clone()
            .map(|qrcode| InstanceEvent::Qr { qrcode });
        self.fanout.subscribe_with(replay)
    }

    pub fn subscriber_count(&self) -> usize {
        self.fanout.subscriber_count()
    }

    /// Owner-path mutation used by connect/disconnect.
    pub(crate) fn transition(&self, change: StateChange) {
        let mut state = self.state.lock();
        self.commit(&mut state, change);
    }

    /// Mutation on behalf of a background actor started for `generation`.
    /// Returns false when that link is no longer current.
    pub(crate) fn transition_from(&self, generation: u64, change: StateChange) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            debug!(instance = %self.name, ?change, "stale link event ignored");
            return false;
        }
        self.commit(&mut state, change);
        true
    }

    fn commit(&self, state: &mut RuntimeState, change: StateChange) {
        let (event, dirty) = state.apply(change);
        if dirty {
            if let Err(e) = self
                .services
                .repo
                .update_status(&self.id, state.status, state.phone.as_deref())
            {
                warn!(instance = %self.name, instance_id = %self.id, error = %e, "failed to persist status");
            }
        }
        if let Some(event) = event {
            info!(instance = %self.name, event = event.kind(), status = %state.status, "instance state changed");
            self.fanout.broadcast(&event);
        }
    }

    fn bump_generation(&self) -> u64 {
        let mut state = self.state.lock();
        state.generation += 1;
        state.generation
    }

    /// Opens a fresh client, replacing (and fully tearing down) any previous one.
    pub async fn connect(self: &Arc<Self>) -> Result<(), InstanceError> {
        if self.is_destroyed() {
            return Err(InstanceError::Destroyed(self.name.clone()));
        }
        let mut link = self.link.lock().await;
        if self.is_destroyed() {
            return Err(InstanceError::Destroyed(self.name.clone()));
        }

        let generation = self.bump_generation();
        *self.current.write() = None;
        if let Some(previous) = link.take() {
            debug!(instance = %self.name, "replacing previous client");
            previous.shutdown().await;
        }

        let client = match self.services.connector.open(&self.id).await {
            Ok(client) => client,
            Err(e) => {
                warn!(instance = %self.name, error = %e, "failed to open protocol client");
                self.transition_from(generation, StateChange::Disconnected { forget_phone: false });
                return Err(InstanceError::ConnectionSetup(e));
            }
        };

        let scope = CancellationToken::new();
        let tasks = TaskTracker::new();
        self.transition_from(generation, StateChange::Connecting);

        client.set_event_handler(Arc::new(LinkHandler {
            instance: Arc::downgrade(self),
            client: Arc::downgrade(&client),
            scope: scope.clone(),
            tasks: tasks.clone(),
            generation,
            runtime: Handle::current(),
        }));

        if client.linked_identity().is_none() {
            match client.pairing_codes() {
                Some(codes) => {
                    tasks.spawn(pairing_listener(Arc::downgrade(self), generation, scope.clone(), codes));
                }
                None => warn!(instance = %self.name, "client has no pairing channel"),
            }
        }

        if let Err(e) = client.connect().await {
            warn!(instance = %self.name, error = %e, "protocol connect failed");
            ActiveLink { client, scope, tasks }.shutdown().await;
            self.transition_from(generation, StateChange::Disconnected { forget_phone: false });
            return Err(InstanceError::ConnectionSetup(e));
        }

        tasks.spawn(keepalive(
            Arc::downgrade(self),
            client.clone(),
            generation,
            scope.clone(),
            self.services.config.settle_delay,
            self.services.config.keepalive_interval,
        ));

        *self.current.write() = Some(client.clone());
        *link = Some(ActiveLink { client, scope, tasks });
        info!(instance = %self.name, instance_id = %self.id, "instance connecting");
        Ok(())
    }

    /// Cancels the scope, releases the client and marks the instance
    /// disconnected. Safe to call when nothing is connected.
    pub async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        self.bump_generation();
        *self.current.write() = None;
        if let Some(active) = link.take() {
            active.shutdown().await;
        }
        self.transition(StateChange::Disconnected { forget_phone: true });
    }

    /// Disconnects for good: later connects fail and subscriptions end.
    pub async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.disconnect().await;
        self.fanout.close();
        info!(instance = %self.name, instance_id = %self.id, "instance destroyed");
    }

    fn ready_client(&self) -> Result<Arc<dyn ProtocolClient>, InstanceError> {
        let not_connected = || InstanceError::NotConnected(self.name.clone());
        if !self.status().is_connected() {
            return Err(not_connected());
        }
        self.current
            .read()
            .clone()
            .filter(|c| c.is_connected())
            .ok_or_else(not_connected)
    }

    pub async fn send_text(&self, number: &str, text: String) -> Result<SendReceipt, InstanceError> {
        let client = self.ready_client()?;
        let to = recipient_jid(number)?;
        let typing = self.settings.read().typing;
        outbound::send_text(client.as_ref(), &to, text, typing, self.services.config.presence_pause).await
    }

    pub async fn send_media(&self, number: &str, media: MediaMessage) -> Result<SendReceipt, InstanceError> {
        let client = self.ready_client()?;
        let to = recipient_jid(number)?;
        let typing = self.settings.read().typing;
        outbound::send_media(client.as_ref(), &to, media, typing, self.services.config.presence_pause).await
    }

    /// Check connectivity and correct the recorded status. Only a disconnected,
    /// linked instance is promoted; never reconnects.
    async fn reconcile(&self, generation: u64, client: &dyn ProtocolClient) {
        if client.is_connected() {
            if let Err(e) = client.send_presence(Presence::Available).await {
                debug!(instance = %self.name, error = %e, "keep-alive presence failed");
            }
            // A live socket without a linked identity is still pairing.
            if self.status() == ConnectionStatus::Disconnected {
                if let Some(jid) = client.linked_identity() {
                    let phone = Some(jid.without_device().user);
                    self.transition_from(generation, StateChange::Connected { phone });
                }
            }
        } else if self.status().is_connected() {
            warn!(instance = %self.name, "keep-alive found a dead connection");
            self.transition_from(generation, StateChange::Disconnected { forget_phone: false });
        }
    }

    /// Fan-out first, then schedule the webhook with the same record.
    fn publish(&self, record: NormalizedMessage, runtime: &Handle) {
        self.fanout.broadcast(&InstanceEvent::Message(record.clone()));
        let endpoint = self.settings.read().webhook_url.clone();
        self.services.webhook.deliver(
            runtime,
            endpoint.as_deref(),
            WebhookPayload {
                instance: self.name.clone(),
                instance_id: self.id.clone(),
                event: MESSAGE_EVENT,
                data: record,
            },
        );
    }

    /// Download and transcribe. Any failure yields an empty transcription;
    /// with transcription off or no backend the field stays unset.
    async fn transcribe(
        &self,
        client: Option<Arc<dyn ProtocolClient>>,
        media: MediaRef,
        mut record: NormalizedMessage,
    ) -> NormalizedMessage {
        if !self.settings.read().transcription_enabled {
            return record;
        }
        let Some(transcriber) = self.services.transcriber.clone() else {
            return record;
        };
        let text = match client {
            Some(client) => match client.download(&media).await {
                Ok(audio) => match transcriber.transcribe(audio, audio_hint(&media.mime_type)).await {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(instance = %self.name, message_id = %record.message_id, error = %e, "transcription failed");
                        String::new()
                    }
                },
                Err(e) => {
                    warn!(instance = %self.name, message_id = %record.message_id, error = %e, "audio download failed");
                    String::new()
                }
            },
            None => String::new(),
        };
        record.transcription = Some(text);
        record
    }
}

/// Stand-alone instance backed by an in-memory store and a sandbox connector.
#[cfg(test)]
pub(crate) fn detached(name: &str) -> Arc<Instance> {
    let repo = InstanceRepo::new(wagate_store::Database::in_memory().unwrap());
    let record = repo
        .create(&wagate_store::NewInstance {
            name: name.into(),
            api_key: format!("key-{name}"),
            transcription_enabled: true,
            typing_delay_min: 0,
            typing_delay_max: 0,
        })
        .unwrap();
    let services = Arc::new(Services {
        connector: Arc::new(crate::sandbox::SandboxConnector::new()),
        repo,
        webhook: WebhookDispatcher::new(Duration::from_secs(1)),
        transcriber: None,
        config: EngineConfig::default(),
    });
    Instance::new(&record, services)
}

fn audio_hint(mime_type: &str) -> &'static str {
    let mime = mime_type.to_ascii_lowercase();
    if mime.contains("mpeg") || mime.contains("mp3") {
        "audio.mp3"
    } else if mime.contains("mp4") || mime.contains("m4a") || mime.contains("aac") {
        "audio.m4a"
    } else if mime.contains("wav") {
        "audio.wav"
    } else {
        "audio.ogg"
    }
}

/// Protocol callbacks for one link generation.
struct LinkHandler {
    instance: Weak<Instance>,
    client: Weak<dyn ProtocolClient>,
    scope: CancellationToken,
    tasks: TaskTracker,
    generation: u64,
    runtime: Handle,
}

impl LinkHandler {
    fn on_message(&self, instance: Arc<Instance>, msg: InboundMessage) {
        if msg.is_from_me {
            return;
        }
        let client = self.client.upgrade();
        let sender = resolve_sender(&msg.sender, client.as_deref());
        let record = normalize(&msg, sender);

        let MessagePayload::Audio { media } = msg.payload else {
            instance.publish(record, &self.runtime);
            return;
        };

        let scope = self.scope.clone();
        let runtime = self.runtime.clone();
        self.tasks.spawn_on(
            async move {
                tokio::select! {
                    biased;
                    _ = scope.cancelled() => {
                        debug!(instance = %instance.name, "audio processing cancelled");
                    }
                    record = instance.transcribe(client, media, record) => {
                        instance.publish(record, &runtime);
                    }
                }
            },
            &self.runtime,
        );
    }
}

impl ProtocolEventHandler for LinkHandler {
    fn on_event(&self, event: ProtocolEvent) {
        if self.scope.is_cancelled() {
            return;
        }
        let Some(instance) = self.instance.upgrade() else {
            return;
        };
        match event {
            ProtocolEvent::Connected => {
                let phone = self
                    .client
                    .upgrade()
                    .and_then(|c| c.linked_identity())
                    .map(|j| j.without_device().user);
                instance.transition_from(self.generation, StateChange::Connected { phone });
            }
            ProtocolEvent::Disconnected => {
                instance.transition_from(self.generation, StateChange::Disconnected { forget_phone: false });
            }
            ProtocolEvent::Message(msg) => self.on_message(instance, msg),
        }
    }
}

async fn pairing_listener(
    instance: Weak<Instance>,
    generation: u64,
    scope: CancellationToken,
    mut codes: mpsc::Receiver<PairingEvent>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = scope.cancelled() => break,
            event = codes.recv() => event,
        };
        let (Some(event), Some(instance)) = (event, instance.upgrade()) else {
            break;
        };
        match event {
            PairingEvent::Code(code) => {
                instance.transition_from(generation, StateChange::PairingCode(code));
            }
            PairingEvent::Success => {
                debug!(instance = %instance.name, "pairing succeeded");
            }
            PairingEvent::Timeout => {
                warn!(instance = %instance.name, "pairing timed out");
                instance.transition_from(generation, StateChange::Disconnected { forget_phone: false });
                break;
            }
        }
    }
}

async fn keepalive(
    instance: Weak<Instance>,
    client: Arc<dyn ProtocolClient>,
    generation: u64,
    scope: CancellationToken,
    settle: Duration,
    interval: Duration,
) {
    tokio::select! {
        biased;
        _ = scope.cancelled() => return,
        _ = tokio::time::sleep(settle) => {}
    }
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = scope.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(instance) = instance.upgrade() else {
            return;
        };
        instance.reconcile(generation, client.as_ref()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use wagate_core::protocol::Jid;
    use wagate_core::transcription::TranscriptionError;
    use wagate_core::MessageKind;
    use wagate_store::{Database, NewInstance};

    use crate::sandbox::{SandboxCall, SandboxConnector};
    use crate::webhook::tests::{capture_endpoint, hanging_endpoint};

    const PHONE: &str = "5511999999999";

    struct FixedTranscriber(Result<&'static str, ()>);

    #[async_trait]
    impl Transcriber for FixedTranscriber {
        async fn transcribe(&self, _audio: Bytes, filename: &str) -> Result<String, TranscriptionError> {
            assert!(filename.starts_with("audio."));
            self.0
                .map(String::from)
                .map_err(|()| TranscriptionError::Request("whisper unavailable".into()))
        }
    }

    struct Fixture {
        connector: Arc<SandboxConnector>,
        instance: Arc<Instance>,
    }

    fn fixture_with(transcriber: Option<Arc<dyn Transcriber>>) -> Fixture {
        let connector = Arc::new(SandboxConnector::new());
        let repo = InstanceRepo::new(Database::in_memory().unwrap());
        let record = repo
            .create(&NewInstance {
                name: "s1".into(),
                api_key: "key-s1".into(),
                transcription_enabled: true,
                typing_delay_min: 0,
                typing_delay_max: 0,
            })
            .unwrap();
        let services = Arc::new(Services {
            connector: connector.clone(),
            repo,
            webhook: WebhookDispatcher::new(Duration::from_secs(5)),
            transcriber,
            config: EngineConfig {
                presence_pause: Duration::ZERO,
                ..EngineConfig::default()
            },
        });
        Fixture {
            connector,
            instance: Instance::new(&record, services),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(None)
    }

    fn inbound(payload: MessagePayload, from_me: bool) -> InboundMessage {
        InboundMessage {
            id: "3EB0AA".into(),
            chat: Jid::user("5511888887777"),
            sender: Jid::user("5511888887777"),
            push_name: "Rafa".into(),
            timestamp: Utc::now(),
            is_from_me: from_me,
            payload,
        }
    }

    async fn next(sub: &mut Subscription) -> InstanceEvent {
        tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("timed out waiting for event")
            .expect("subscription ended")
    }

    #[tokio::test]
    async fn linked_connect_reports_phone() {
        let f = fixture();
        f.connector.link(f.instance.id(), PHONE);
        let mut sub = f.instance.subscribe();

        f.instance.connect().await.unwrap();

        assert_eq!(next(&mut sub).await, InstanceEvent::Connected { phone: PHONE.into() });
        assert_eq!(f.instance.status(), ConnectionStatus::Connected);
        assert_eq!(f.instance.live_status(), ConnectionStatus::Connected);
        assert_eq!(f.instance.phone().as_deref(), Some(PHONE));
        assert!(f.instance.pairing_code().is_none());

        let stored = f.instance.services.repo.get(f.instance.id()).unwrap();
        assert_eq!(stored.status, ConnectionStatus::Connected);
        assert_eq!(stored.phone.as_deref(), Some(PHONE));
    }

    #[tokio::test]
    async fn unlinked_connect_publishes_pairing_code_then_pairs() {
        let f = fixture();
        let mut sub = f.instance.subscribe();
        f.instance.connect().await.unwrap();

        let InstanceEvent::Qr { qrcode } = next(&mut sub).await else {
            panic!("expected qr");
        };
        assert_eq!(f.instance.status(), ConnectionStatus::Connecting);
        assert_eq!(f.instance.pairing_code(), Some(qrcode.clone()));

        let mut late = f.instance.subscribe();
        assert_eq!(next(&mut late).await, InstanceEvent::Qr { qrcode });

        f.connector.latest(f.instance.id()).unwrap().complete_pairing(PHONE);
        assert_eq!(next(&mut sub).await, InstanceEvent::Connected { phone: PHONE.into() });
        assert!(f.instance.pairing_code().is_none());
    }

    #[tokio::test]
    async fn connect_twice_keeps_one_live_client() {
        let f = fixture();
        f.connector.link(f.instance.id(), PHONE);

        f.instance.connect().await.unwrap();
        f.instance.connect().await.unwrap();

        let clients = f.connector.clients(f.instance.id());
        assert_eq!(clients.len(), 2);
        assert!(clients[0].is_released());
        assert!(!clients[1].is_released());
        assert!(clients[1].is_connected());
        assert_eq!(f.instance.live_status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn concurrent_connects_serialize() {
        let f = fixture();
        f.connector.link(f.instance.id(), PHONE);

        let (a, b) = tokio::join!(f.instance.connect(), f.instance.connect());
        a.unwrap();
        b.unwrap();

        let live: Vec<_> = f
            .connector
            .clients(f.instance.id())
            .into_iter()
            .filter(|c| !c.is_released())
            .collect();
        assert_eq!(live.len(), 1);
    }

    #[tokio::test]
    async fn explicit_disconnect_clears_runtime_state() {
        let f = fixture();
        f.connector.link(f.instance.id(), PHONE);
        f.instance.connect().await.unwrap();
        let mut sub = f.instance.subscribe();

        f.instance.disconnect().await;

        assert_eq!(next(&mut sub).await, InstanceEvent::Disconnected {});
        assert_eq!(f.instance.status(), ConnectionStatus::Disconnected);
        assert!(f.instance.phone().is_none());
        assert!(f.connector.latest(f.instance.id()).unwrap().is_released());

        // Second disconnect is a no-op.
        f.instance.disconnect().await;
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn events_after_disconnect_are_ignored() {
        let f = fixture();
        f.instance.connect().await.unwrap();
        let client = f.connector.latest(f.instance.id()).unwrap();
        f.instance.disconnect().await;

        assert!(!client.push_pairing_code("late-code"));
        client.complete_pairing(PHONE);
        tokio::task::yield_now().await;

        assert_eq!(f.instance.status(), ConnectionStatus::Disconnected);
        assert!(f.instance.pairing_code().is_none());
    }

    #[tokio::test]
    async fn protocol_drop_marks_disconnected() {
        let f = fixture();
        f.connector.link(f.instance.id(), PHONE);
        f.instance.connect().await.unwrap();
        let mut sub = f.instance.subscribe();

        f.connector.latest(f.instance.id()).unwrap().drop_connection();

        assert_eq!(next(&mut sub).await, InstanceEvent::Disconnected {});
        assert_eq!(f.instance.phone().as_deref(), Some(PHONE));
    }

    #[tokio::test]
    async fn open_failure_leaves_instance_disconnected() {
        let f = fixture();
        f.connector.fail_open(true);
        let err = f.instance.connect().await.unwrap_err();
        assert!(matches!(err, InstanceError::ConnectionSetup(_)));
        assert_eq!(f.instance.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn connect_failure_tears_down_scope() {
        let f = fixture();
        f.connector.refuse_connect(true);
        let err = f.instance.connect().await.unwrap_err();
        assert!(matches!(err, InstanceError::ConnectionSetup(_)));
        assert_eq!(f.instance.status(), ConnectionStatus::Disconnected);

        let client = f.connector.latest(f.instance.id()).unwrap();
        assert!(client.is_released());
        assert!(!client.push_pairing_code("after-failure"));
        assert!(f.instance.pairing_code().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_detects_dead_connection_without_reconnecting() {
        let f = fixture();
        f.connector.link(f.instance.id(), PHONE);
        f.instance.connect().await.unwrap();
        let client = f.connector.latest(f.instance.id()).unwrap();
        let mut sub = f.instance.subscribe();

        client.set_connected(false);
        assert_eq!(f.instance.live_status(), ConnectionStatus::Disconnected);
        tokio::time::sleep(Duration::from_secs(4)).await;

        assert_eq!(next(&mut sub).await, InstanceEvent::Disconnected {});
        assert_eq!(f.instance.status(), ConnectionStatus::Disconnected);
        let connects = client.calls().iter().filter(|c| **c == SandboxCall::Connect).count();
        assert_eq!(connects, 1);
        assert_eq!(f.connector.clients(f.instance.id()).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_refreshes_presence_every_interval() {
        let f = fixture();
        f.connector.link(f.instance.id(), PHONE);
        f.instance.connect().await.unwrap();
        let client = f.connector.latest(f.instance.id()).unwrap();

        // settle (3s) plus two more 20s ticks
        tokio::time::sleep(Duration::from_secs(44)).await;
        let presences = client
            .calls()
            .iter()
            .filter(|c| matches!(c, SandboxCall::Presence(Presence::Available)))
            .count();
        assert_eq!(presences, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_stops_with_scope() {
        let f = fixture();
        f.connector.link(f.instance.id(), PHONE);
        f.instance.connect().await.unwrap();
        let client = f.connector.latest(f.instance.id()).unwrap();
        f.instance.disconnect().await;
        client.clear_calls();

        client.set_connected(true);
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(client.calls().is_empty());
        assert_eq!(f.instance.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_leaves_pairing_instance_connecting() {
        let f = fixture();
        f.instance.connect().await.unwrap();
        let client = f.connector.latest(f.instance.id()).unwrap();
        let mut sub = f.instance.subscribe();

        // Socket up, nothing linked yet.
        client.set_connected(true);
        assert!(client.push_pairing_code("code-1"));
        tokio::time::sleep(Duration::from_secs(4)).await;

        assert_eq!(f.instance.status(), ConnectionStatus::Connecting);
        assert_eq!(f.instance.pairing_code().as_deref(), Some("code-1"));
        assert!(f.instance.phone().is_none());

        assert!(client.push_pairing_code("code-2"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.instance.pairing_code().as_deref(), Some("code-2"));

        let mut events = Vec::new();
        while let Some(event) = sub.try_recv() {
            events.push(event);
        }
        assert!(events.contains(&InstanceEvent::Qr { qrcode: "code-2".into() }));
        assert!(!events.iter().any(|e| matches!(e, InstanceEvent::Connected { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_restores_linked_instance_after_drop() {
        let f = fixture();
        f.connector.link(f.instance.id(), PHONE);
        f.instance.connect().await.unwrap();
        let client = f.connector.latest(f.instance.id()).unwrap();
        let mut sub = f.instance.subscribe();

        client.drop_connection();
        assert_eq!(next(&mut sub).await, InstanceEvent::Disconnected {});
        client.set_connected(true);
        tokio::time::sleep(Duration::from_secs(4)).await;

        assert_eq!(next(&mut sub).await, InstanceEvent::Connected { phone: PHONE.into() });
        assert_eq!(f.instance.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn silent_webhook_does_not_delay_fanout() {
        let f = fixture();
        f.instance.set_webhook(Some(hanging_endpoint().await));
        f.connector.link(f.instance.id(), PHONE);
        f.instance.connect().await.unwrap();
        let mut sub = f.instance.subscribe();

        let client = f.connector.latest(f.instance.id()).unwrap();
        client.emit(ProtocolEvent::Message(inbound(MessagePayload::Conversation("first".into()), false)));
        client.emit(ProtocolEvent::Message(inbound(MessagePayload::Conversation("second".into()), false)));

        // Well under the dispatcher's 5s request timeout.
        for expected in ["first", "second"] {
            let event = tokio::time::timeout(Duration::from_millis(500), sub.recv())
                .await
                .expect("fan-out waited on the webhook")
                .unwrap();
            let InstanceEvent::Message(record) = event else {
                panic!("expected message");
            };
            assert_eq!(record.message, expected);
        }
    }

    #[tokio::test]
    async fn send_requires_connection_and_makes_no_calls() {
        let f = fixture();
        let err = f.instance.send_text("5511", "oi".into()).await.unwrap_err();
        assert!(matches!(err, InstanceError::NotConnected(_)));

        f.instance.connect().await.unwrap();
        let err = f.instance.send_text("5511", "oi".into()).await.unwrap_err();
        assert!(matches!(err, InstanceError::NotConnected(_)));
        assert_eq!(f.connector.latest(f.instance.id()).unwrap().calls(), vec![SandboxCall::Connect]);
    }

    #[tokio::test]
    async fn send_text_when_connected() {
        let f = fixture();
        f.connector.link(f.instance.id(), PHONE);
        f.instance.connect().await.unwrap();

        let receipt = f.instance.send_text("+55 11 98888 7777", "olá".into()).await.unwrap();
        assert!(receipt.message_id.starts_with("SBX"));
        let calls = f.connector.latest(f.instance.id()).unwrap().calls();
        assert!(calls.contains(&SandboxCall::Send {
            to: Jid::user("5511988887777"),
            content: wagate_core::protocol::OutboundContent::Text("olá".into()),
        }));
    }

    #[tokio::test]
    async fn inbound_text_reaches_subscribers_and_webhook_identically() {
        let f = fixture();
        let (url, mut hook) = capture_endpoint().await;
        f.instance.set_webhook(Some(url));
        f.connector.link(f.instance.id(), PHONE);
        f.instance.connect().await.unwrap();
        let mut sub = f.instance.subscribe();

        let client = f.connector.latest(f.instance.id()).unwrap();
        client.emit(ProtocolEvent::Message(inbound(MessagePayload::Conversation("oi".into()), false)));

        let InstanceEvent::Message(record) = next(&mut sub).await else {
            panic!("expected message");
        };
        assert_eq!(record.message, "oi");
        assert_eq!(record.kind, MessageKind::Text);

        let body = tokio::time::timeout(Duration::from_secs(5), hook.recv()).await.unwrap().unwrap();
        assert_eq!(body["event"], MESSAGE_EVENT);
        assert_eq!(body["instance"], "s1");
        assert_eq!(body["data"], serde_json::to_value(&record).unwrap());
    }

    #[tokio::test]
    async fn own_messages_are_discarded() {
        let f = fixture();
        f.connector.link(f.instance.id(), PHONE);
        f.instance.connect().await.unwrap();
        let mut sub = f.instance.subscribe();

        let client = f.connector.latest(f.instance.id()).unwrap();
        client.emit(ProtocolEvent::Message(inbound(MessagePayload::Conversation("echo".into()), true)));

        assert!(sub.try_recv().is_none());
    }

    fn voice_note() -> MessagePayload {
        MessagePayload::Audio {
            media: MediaRef {
                direct_path: "/v/voice".into(),
                mime_type: "audio/ogg; codecs=opus".into(),
                file_length: 4,
            },
        }
    }

    #[tokio::test]
    async fn audio_transcription_failure_yields_empty_text() {
        let f = fixture_with(Some(Arc::new(FixedTranscriber(Err(())))));
        let (url, mut hook) = capture_endpoint().await;
        f.instance.set_webhook(Some(url));
        f.connector.link(f.instance.id(), PHONE);
        f.instance.connect().await.unwrap();
        let mut sub = f.instance.subscribe();

        let client = f.connector.latest(f.instance.id()).unwrap();
        client.store_media("/v/voice", Bytes::from_static(b"OggS"));
        client.emit(ProtocolEvent::Message(inbound(voice_note(), false)));

        let InstanceEvent::Message(record) = next(&mut sub).await else {
            panic!("expected message");
        };
        assert_eq!(record.kind, MessageKind::Audio);
        assert_eq!(record.transcription.as_deref(), Some(""));

        let body = tokio::time::timeout(Duration::from_secs(5), hook.recv()).await.unwrap().unwrap();
        assert_eq!(body["data"]["transcription"], "");
    }

    #[tokio::test]
    async fn audio_is_transcribed() {
        let f = fixture_with(Some(Arc::new(FixedTranscriber(Ok("bom dia")))));
        f.connector.link(f.instance.id(), PHONE);
        f.instance.connect().await.unwrap();
        let mut sub = f.instance.subscribe();

        let client = f.connector.latest(f.instance.id()).unwrap();
        client.store_media("/v/voice", Bytes::from_static(b"OggS"));
        client.emit(ProtocolEvent::Message(inbound(voice_note(), false)));

        let InstanceEvent::Message(record) = next(&mut sub).await else {
            panic!("expected message");
        };
        assert_eq!(record.transcription.as_deref(), Some("bom dia"));
    }

    #[tokio::test]
    async fn failed_download_yields_empty_text() {
        let f = fixture_with(Some(Arc::new(FixedTranscriber(Ok("unused")))));
        f.connector.link(f.instance.id(), PHONE);
        f.instance.connect().await.unwrap();
        let mut sub = f.instance.subscribe();

        let client = f.connector.latest(f.instance.id()).unwrap();
        client.emit(ProtocolEvent::Message(inbound(voice_note(), false)));

        let InstanceEvent::Message(record) = next(&mut sub).await else {
            panic!("expected message");
        };
        assert_eq!(record.transcription.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn disabled_transcription_leaves_field_unset() {
        let f = fixture_with(Some(Arc::new(FixedTranscriber(Ok("unused")))));
        f.instance.set_config(&InstanceConfigUpdate {
            transcription_enabled: false,
            typing_delay_min: 0,
            typing_delay_max: 0,
        });
        f.connector.link(f.instance.id(), PHONE);
        f.instance.connect().await.unwrap();
        let mut sub = f.instance.subscribe();

        let client = f.connector.latest(f.instance.id()).unwrap();
        client.emit(ProtocolEvent::Message(inbound(voice_note(), false)));

        let InstanceEvent::Message(record) = next(&mut sub).await else {
            panic!("expected message");
        };
        assert!(record.transcription.is_none());
        assert!(!client.calls().iter().any(|c| matches!(c, SandboxCall::Download { .. })));
    }

    #[tokio::test]
    async fn destroyed_instance_refuses_connect_and_ends_streams() {
        let f = fixture();
        f.connector.link(f.instance.id(), PHONE);
        f.instance.connect().await.unwrap();
        let mut sub = f.instance.subscribe();

        f.instance.destroy().await;

        assert_eq!(next(&mut sub).await, InstanceEvent::Disconnected {});
        assert_eq!(sub.recv().await, None);
        assert!(matches!(f.instance.connect().await, Err(InstanceError::Destroyed(_))));
    }

    #[test]
    fn api_key_comparison() {
        let f = fixture();
        assert!(f.instance.verify_api_key("key-s1"));
        assert!(!f.instance.verify_api_key("key-s2"));
        assert!(!f.instance.verify_api_key(""));
        f.instance.set_api_key("rotated".into());
        assert!(f.instance.verify_api_key("rotated"));
    }

    #[test]
    fn state_changes_only_emit_on_change() {
        let mut state = RuntimeState::default();
        assert_eq!(state.apply(StateChange::Disconnected { forget_phone: false }), (None, false));
        assert_eq!(state.apply(StateChange::Connecting), (None, true));
        assert!(matches!(
            state.apply(StateChange::PairingCode("c1".into())),
            (Some(InstanceEvent::Qr { .. }), false)
        ));
        let (event, dirty) = state.apply(StateChange::Connected { phone: Some(PHONE.into()) });
        assert_eq!(event, Some(InstanceEvent::Connected { phone: PHONE.into() }));
        assert!(dirty);
        assert_eq!(state.apply(StateChange::Connected { phone: Some(PHONE.into()) }), (None, false));
        assert_eq!(state.apply(StateChange::PairingCode("late".into())), (None, false));
        assert!(state.pairing_code.is_none());
    }
}
