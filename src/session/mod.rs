//! Session instances and their lifecycle collaborators.
//!
//! A [`Session`] is one *underlying* instance of a logical session: it owns
//! a [`BeaconEncoder`], a [`ConfigurationSlot`] and lifecycle flags. The
//! [`controller::SessionController`] decides when a logical session splits
//! into a fresh instance; the [`watchdog::SessionWatchdog`] closes old
//! instances after a grace period; the sender flushes instances and applies
//! server configuration updates to them.
//!
//! # Lifecycle
//!
//! ```text
//!   created ──► open ──────────────► finished
//!                 │    end()             │
//!                 │                      │ sender: flush, unregister,
//!                 └── update_server_     ▼         delete cache entry
//!                     configuration   (gone)
//! ```
//!
//! `end()` is idempotent: the first call emits the SESSION_END marker and
//! marks the session finished; later calls are no-ops.

pub mod controller;
pub mod watchdog;

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::beacon::BeaconEncoder;
use crate::cache::{EventCache, SessionKey};
use crate::config::{AgentConfiguration, ConfigurationSlot, ServerConfiguration};
use crate::time::Clock;

/// Observer notified whenever a session's server configuration changes.
///
/// The controller registers itself here to freeze split thresholds from the
/// first configuration a session receives.
pub trait ServerConfigurationObserver: Send + Sync {
    /// Called with the merged configuration after every update.
    fn on_server_configuration_update(&self, config: &ServerConfiguration);
}

/// One underlying session instance.
pub struct Session {
    encoder: BeaconEncoder,
    config: Arc<ConfigurationSlot>,
    configured: AtomicBool,
    finished: AtomicBool,
    observer: Mutex<Option<Weak<dyn ServerConfigurationObserver>>>,
}

impl Session {
    /// Creates a session instance and emits its SESSION_START marker.
    #[must_use]
    pub fn new(
        key: SessionKey,
        cache: Arc<EventCache>,
        clock: Arc<dyn Clock>,
        agent_config: &AgentConfiguration,
    ) -> Arc<Self> {
        let config = Arc::new(ConfigurationSlot::default());
        let encoder = BeaconEncoder::new(
            key,
            cache,
            clock,
            Arc::clone(&config),
            agent_config.application_id.clone(),
            agent_config.device_id,
            agent_config.data_collection_level,
        );
        let session = Arc::new(Self {
            encoder,
            config,
            configured: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            observer: Mutex::new(None),
        });
        session.encoder.start_session();
        debug!(key = %key, "session instance created");
        session
    }

    /// The key identifying this instance.
    #[must_use]
    pub const fn key(&self) -> SessionKey {
        self.encoder.key()
    }

    /// The encoder writing this instance's fragments.
    #[must_use]
    pub const fn encoder(&self) -> &BeaconEncoder {
        &self.encoder
    }

    /// The current server configuration snapshot.
    #[must_use]
    pub fn server_configuration(&self) -> Arc<ServerConfiguration> {
        self.config.get()
    }

    /// Registers the configuration observer. At most one observer exists
    /// per session; a second registration replaces the first.
    pub fn set_configuration_observer(&self, observer: Weak<dyn ServerConfigurationObserver>) {
        *self
            .observer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(observer);
    }

    /// Merges an incoming server configuration into this session (see
    /// [`ServerConfiguration::merge`]), marks the session configured, and
    /// notifies the observer with the merged result.
    pub fn update_server_configuration(&self, incoming: &ServerConfiguration) {
        let merged = if self.configured.swap(true, Ordering::SeqCst) {
            self.config.merge_incoming(incoming)
        } else {
            // First contact: take the incoming configuration wholesale so
            // the pinned fields are established from it.
            self.config.set(*incoming);
            self.config.get()
        };
        let observer = self
            .observer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer.and_then(|weak| weak.upgrade()) {
            observer.on_server_configuration_update(&merged);
        }
    }

    /// Disables capture for this session, preserving buffered data.
    pub fn disable_capture(&self) {
        self.config.disable_capture();
    }

    /// Whether this session has received its first server configuration.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::SeqCst)
    }

    /// Whether this session has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Whether the sender may transmit this session's data right now.
    #[must_use]
    pub fn is_data_sending_allowed(&self) -> bool {
        self.is_configured() && self.config.get().is_sending_data_allowed()
    }

    /// Ends this session: emits the SESSION_END marker and marks it
    /// finished. Idempotent.
    pub fn end(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.encoder.end_session();
        debug!(key = %self.key(), "session instance ended");
    }
}

/// Creates the consecutive instances of one logical session.
///
/// The first instance gets sequence number 0; every split increments it.
pub struct SessionCreator {
    cache: Arc<EventCache>,
    clock: Arc<dyn Clock>,
    agent_config: AgentConfiguration,
    session_number: i32,
    next_sequence: AtomicI32,
}

impl SessionCreator {
    /// Creates a creator for the logical session with the given number.
    #[must_use]
    pub fn new(
        cache: Arc<EventCache>,
        clock: Arc<dyn Clock>,
        agent_config: AgentConfiguration,
        session_number: i32,
    ) -> Self {
        Self {
            cache,
            clock,
            agent_config,
            session_number,
            next_sequence: AtomicI32::new(0),
        }
    }

    /// Creates the next session instance, incrementing the sequence number.
    #[must_use]
    pub fn create(&self) -> Arc<Session> {
        let key = SessionKey {
            session_number: self.session_number,
            sequence_number: self.next_sequence.fetch_add(1, Ordering::SeqCst),
        };
        Session::new(
            key,
            Arc::clone(&self.cache),
            Arc::clone(&self.clock),
            &self.agent_config,
        )
    }
}
