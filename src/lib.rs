//! rum-agent - Client-Side Telemetry Agent Core
//!
//! This library implements the in-process core of a real-user-monitoring
//! agent: instrumented applications record sessions, actions, values,
//! errors, crashes and web requests; the agent encodes them into a compact
//! wire format, buffers them in a bounded in-memory cache and ships them to
//! a monitoring backend from background threads. The instrumented
//! application's threads never block on network I/O.
//!
//! # Architecture
//!
//! ```text
//!  application threads                  background threads
//!  ───────────────────                  ──────────────────
//!  SessionController ──► BeaconEncoder ──► EventCache ◄── CacheEvictor
//!        │                                    │
//!        │ split / end                        │ extract_chunk
//!        ▼                                    ▼
//!  SessionWatchdog ◄────────────────────── Sender ──► HttpTransport
//! ```
//!
//! The backend steers the agent through configurations carried on every
//! response (see [`config::ServerConfiguration`]); capture can be switched
//! off remotely, sessions are split transparently after a server-configured
//! number of top-level events, and all buffering is bounded by size and age.
//!
//! # Modules
//!
//! - [`beacon`]: per-session wire-format encoding with privacy gating
//! - [`cache`]: bounded in-memory event cache keyed by session instance
//! - [`config`]: host and server configuration, asymmetric merge rules
//! - [`protocol`]: event-type codes and response grammars (key-value, JSON)
//! - [`sender`]: background sender state machine
//! - [`session`]: session instances, splitting controller, close watchdog
//! - [`time`]: clock abstraction for deterministic tests
//! - [`transport`]: HTTP adapter with gzip compression and bounded retries
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rum_agent::cache::EventCache;
//! use rum_agent::cache::evictor::{CacheEvictor, EvictionBounds};
//! use rum_agent::config::AgentConfiguration;
//! use rum_agent::sender::Sender;
//! use rum_agent::session::controller::SessionController;
//! use rum_agent::session::watchdog::SessionWatchdog;
//! use rum_agent::session::SessionCreator;
//! use rum_agent::time::{Clock, SystemClock};
//! use rum_agent::transport::HttpTransport;
//!
//! # fn main() -> Result<(), rum_agent::transport::TransportError> {
//! let config = AgentConfiguration::new("https://rum.example.com/mbeacon", "app-1", 42);
//! let clock: Arc<dyn Clock> = Arc::new(SystemClock);
//! let cache = Arc::new(EventCache::new());
//!
//! let bounds = EvictionBounds::from_config(&config);
//! let mut evictor = CacheEvictor::new(Arc::clone(&cache), Arc::clone(&clock), bounds);
//! evictor.initialize();
//!
//! let transport = Arc::new(HttpTransport::new(&config)?);
//! let sender = Arc::new(Sender::new(transport));
//! let watchdog = Arc::new(SessionWatchdog::new(Arc::clone(&clock)));
//!
//! let creator = SessionCreator::new(Arc::clone(&cache), clock, config, 1);
//! let session = SessionController::new(creator, Arc::clone(&sender), Arc::clone(&watchdog));
//!
//! let action = session.enter_action("load dashboard");
//! action.report_value_int("widget count", 12);
//! action.leave();
//! session.end();
//!
//! sender.shutdown();
//! watchdog.shutdown();
//! evictor.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod beacon;
pub mod cache;
pub mod config;
pub mod protocol;
pub mod sender;
pub mod session;
pub mod time;
pub mod transport;

pub use beacon::BeaconEncoder;
pub use cache::{EventCache, SessionKey};
pub use config::{AgentConfiguration, DataCollectionLevel, ServerConfiguration};
pub use protocol::ResponseAttributes;
pub use sender::Sender;
pub use session::controller::{Action, SessionController, WebRequestTracer};
pub use session::watchdog::SessionWatchdog;
pub use session::{Session, SessionCreator};
pub use transport::{BeaconTransport, HttpTransport, RawResponse};
