//! In-process protocol backend.
//!
//! `SandboxConnector` hands out `SandboxClient`s that keep a log of every
//! call, let the caller inject protocol events, and remember linked
//! identities per instance the way a device store would. The binary uses it
//! when no wire backend is linked; tests use it to drive lifecycles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

use wagate_core::protocol::{
    ChatPresence, ChatPresenceMedia, Jid, MediaCategory, MediaRef, OutboundContent, PairingEvent,
    Presence, ProtocolClient, ProtocolConnector, ProtocolError, ProtocolEvent, ProtocolEventHandler,
    SendReceipt, UploadedMedia,
};
use wagate_core::InstanceId;

const PAIRING_QUEUE: usize = 8;

#[derive(Clone, Debug, PartialEq)]
pub enum SandboxCall {
    Connect,
    Disconnect,
    Presence(Presence),
    ChatPresence {
        chat: Jid,
        state: ChatPresence,
        media: ChatPresenceMedia,
    },
    Upload {
        category: MediaCategory,
        len: usize,
    },
    Send {
        to: Jid,
        content: OutboundContent,
    },
    Download {
        direct_path: String,
    },
}

/// Simulated QR scan: pairing completes `after` the first code is shown.
#[derive(Clone, Debug)]
pub struct AutoPair {
    pub phone: String,
    pub after: Duration,
}

type IdentityStore = Arc<DashMap<InstanceId, Jid>>;

#[derive(Default)]
struct Faults {
    connect: AtomicBool,
    upload: AtomicBool,
    send: AtomicBool,
    download: AtomicBool,
}

pub struct SandboxClient {
    me: Weak<SandboxClient>,
    binding: Option<(InstanceId, IdentityStore)>,
    auto_pair: Option<AutoPair>,
    identity: Mutex<Option<Jid>>,
    connected: AtomicBool,
    released: AtomicBool,
    handler: RwLock<Option<Arc<dyn ProtocolEventHandler>>>,
    pairing_tx: mpsc::Sender<PairingEvent>,
    pairing_rx: Mutex<Option<mpsc::Receiver<PairingEvent>>>,
    calls: Mutex<Vec<SandboxCall>>,
    hidden: DashMap<String, String>,
    media: DashMap<String, Bytes>,
    faults: Faults,
    seq: AtomicU64,
}

impl SandboxClient {
    /// Unbound client; pairing is not remembered anywhere.
    pub fn new(identity: Option<Jid>) -> Arc<Self> {
        Self::build(identity, None, None)
    }

    fn build(
        identity: Option<Jid>,
        binding: Option<(InstanceId, IdentityStore)>,
        auto_pair: Option<AutoPair>,
    ) -> Arc<Self> {
        let (pairing_tx, pairing_rx) = mpsc::channel(PAIRING_QUEUE);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            binding,
            auto_pair,
            identity: Mutex::new(identity),
            connected: AtomicBool::new(false),
            released: AtomicBool::new(false),
            handler: RwLock::new(None),
            pairing_tx,
            pairing_rx: Mutex::new(Some(pairing_rx)),
            calls: Mutex::new(Vec::new()),
            hidden: DashMap::new(),
            media: DashMap::new(),
            faults: Faults::default(),
            seq: AtomicU64::new(0),
        })
    }

    pub fn calls(&self) -> Vec<SandboxCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Flip connectivity without emitting an event.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Deliver an event to the registered handler, if any.
    pub fn emit(&self, event: ProtocolEvent) {
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler.on_event(event),
            None => debug!("sandbox event dropped: no handler"),
        }
    }

    pub fn push_pairing_code(&self, code: impl Into<String>) -> bool {
        self.pairing_tx.try_send(PairingEvent::Code(code.into())).is_ok()
    }

    /// Simulates a successful scan: links `phone`, connects, emits `Connected`.
    pub fn complete_pairing(&self, phone: &str) {
        let jid = Jid::user(phone);
        *self.identity.lock() = Some(jid.clone());
        if let Some((id, store)) = &self.binding {
            store.insert(id.clone(), jid);
        }
        let _ = self.pairing_tx.try_send(PairingEvent::Success);
        self.connected.store(true, Ordering::SeqCst);
        self.emit(ProtocolEvent::Connected);
    }

    /// Simulates the network dropping: goes offline and emits `Disconnected`.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.emit(ProtocolEvent::Disconnected);
    }

    pub fn map_hidden(&self, hidden_user: &str, phone: &str) {
        self.hidden.insert(hidden_user.to_string(), phone.to_string());
    }

    pub fn store_media(&self, direct_path: &str, data: Bytes) {
        self.media.insert(direct_path.to_string(), data);
    }

    pub fn fail_connect(&self, fail: bool) {
        self.faults.connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.faults.upload.store(fail, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.faults.send.store(fail, Ordering::SeqCst);
    }

    pub fn fail_downloads(&self, fail: bool) {
        self.faults.download.store(fail, Ordering::SeqCst);
    }

    /// True once `disconnect` has been called on this client.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn record(&self, call: SandboxCall) {
        self.calls.lock().push(call);
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn schedule_auto_pair(&self) {
        let Some(auto) = self.auto_pair.clone() else {
            return;
        };
        let me = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep(auto.after).await;
            if let Some(client) = me.upgrade() {
                if !client.is_released() {
                    client.complete_pairing(&auto.phone);
                }
            }
        });
    }
}

#[async_trait]
impl ProtocolClient for SandboxClient {
    async fn connect(&self) -> Result<(), ProtocolError> {
        self.record(SandboxCall::Connect);
        if self.faults.connect.load(Ordering::SeqCst) {
            return Err(ProtocolError::Connect("sandbox refused the connection".into()));
        }
        if self.identity.lock().is_some() {
            self.connected.store(true, Ordering::SeqCst);
            self.emit(ProtocolEvent::Connected);
        } else {
            let code = format!("2@sandbox/{}", self.next_seq());
            let _ = self.pairing_tx.try_send(PairingEvent::Code(code));
            self.schedule_auto_pair();
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.record(SandboxCall::Disconnect);
        self.released.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn linked_identity(&self) -> Option<Jid> {
        self.identity.lock().clone()
    }

    fn set_event_handler(&self, handler: Arc<dyn ProtocolEventHandler>) {
        *self.handler.write() = Some(handler);
    }

    fn pairing_codes(&self) -> Option<mpsc::Receiver<PairingEvent>> {
        self.pairing_rx.lock().take()
    }

    async fn send_presence(&self, presence: Presence) -> Result<(), ProtocolError> {
        self.record(SandboxCall::Presence(presence));
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        Ok(())
    }

    async fn send_chat_presence(
        &self,
        chat: &Jid,
        state: ChatPresence,
        media: ChatPresenceMedia,
    ) -> Result<(), ProtocolError> {
        self.record(SandboxCall::ChatPresence {
            chat: chat.clone(),
            state,
            media,
        });
        Ok(())
    }

    async fn upload(&self, data: Bytes, category: MediaCategory) -> Result<UploadedMedia, ProtocolError> {
        self.record(SandboxCall::Upload {
            category,
            len: data.len(),
        });
        if self.faults.upload.load(Ordering::SeqCst) {
            return Err(ProtocolError::Upload("sandbox upload rejected".into()));
        }
        let n = self.next_seq();
        Ok(UploadedMedia {
            url: format!("sandbox://media/{n}"),
            direct_path: format!("/sandbox/{n}"),
            file_length: data.len() as u64,
        })
    }

    async fn send_message(&self, to: &Jid, content: OutboundContent) -> Result<SendReceipt, ProtocolError> {
        self.record(SandboxCall::Send {
            to: to.clone(),
            content,
        });
        if self.faults.send.load(Ordering::SeqCst) {
            return Err(ProtocolError::Send("sandbox send rejected".into()));
        }
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        Ok(SendReceipt {
            message_id: format!("SBX{:08X}", self.next_seq()),
            timestamp: Utc::now(),
        })
    }

    async fn download(&self, media: &MediaRef) -> Result<Bytes, ProtocolError> {
        self.record(SandboxCall::Download {
            direct_path: media.direct_path.clone(),
        });
        if self.faults.download.load(Ordering::SeqCst) {
            return Err(ProtocolError::Download("sandbox download failed".into()));
        }
        self.media
            .get(&media.direct_path)
            .map(|m| m.value().clone())
            .ok_or_else(|| ProtocolError::Download(format!("no media at {}", media.direct_path)))
    }

    fn resolve_phone(&self, hidden: &Jid) -> Option<Jid> {
        self.hidden.get(&hidden.user).map(|phone| Jid::user(phone.value().clone()))
    }
}

/// Opens sandbox clients and remembers which instances have paired.
#[derive(Default)]
pub struct SandboxConnector {
    identities: IdentityStore,
    opened: Mutex<HashMap<InstanceId, Vec<Arc<SandboxClient>>>>,
    fail_open: AtomicBool,
    refuse_connect: AtomicBool,
    auto_pair: Option<AutoPair>,
}

impl SandboxConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auto_pair(phone: impl Into<String>, after: Duration) -> Self {
        Self {
            auto_pair: Some(AutoPair {
                phone: phone.into(),
                after,
            }),
            ..Self::default()
        }
    }

    /// Pre-seed a linked identity, as if the instance had paired earlier.
    pub fn link(&self, instance: &InstanceId, phone: &str) {
        self.identities.insert(instance.clone(), Jid::user(phone));
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Clients opened from now on fail their `connect` call.
    pub fn refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Every client opened for `instance`, oldest first.
    pub fn clients(&self, instance: &InstanceId) -> Vec<Arc<SandboxClient>> {
        self.opened.lock().get(instance).cloned().unwrap_or_default()
    }

    pub fn latest(&self, instance: &InstanceId) -> Option<Arc<SandboxClient>> {
        self.opened.lock().get(instance).and_then(|v| v.last().cloned())
    }
}

#[async_trait]
impl ProtocolConnector for SandboxConnector {
    async fn open(&self, instance: &InstanceId) -> Result<Arc<dyn ProtocolClient>, ProtocolError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(ProtocolError::Identity("sandbox device store unavailable".into()));
        }
        let identity = self.identities.get(instance).map(|j| j.value().clone());
        let client = SandboxClient::build(
            identity,
            Some((instance.clone(), self.identities.clone())),
            self.auto_pair.clone(),
        );
        client.fail_connect(self.refuse_connect.load(Ordering::SeqCst));
        self.opened
            .lock()
            .entry(instance.clone())
            .or_default()
            .push(client.clone());
        Ok(client)
    }
}
