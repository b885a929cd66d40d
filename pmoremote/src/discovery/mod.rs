//! Discovery of media servers on the local network.
//!
//! A [`ServiceBrowser`] turns the network into a stream of [`BrowseEvent`]s,
//! [`ServiceDiscovery`] folds them into an insertion-ordered server list
//! published through a `watch` channel.

pub mod mdns_browser;
pub mod server_list;
pub mod static_browser;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::DiscoveryError;
use crate::model::{DiscoveredServer, ServerAddress, ServiceName};

pub use mdns_browser::MdnsBrowser;
pub use server_list::ServerList;
pub use static_browser::StaticBrowser;

/// DNS-SD type advertised by the media server
pub const DEFAULT_SERVICE_TYPE: &str = "_myvideoserver._tcp.local";

/// Delay after which an unresolved advertisement is dropped
pub const DEFAULT_RESOLVE_TIMEOUT_SECS: u64 = 5;

/// Delay after which a view reports that no server was found
pub const DEFAULT_WINDOW_SECS: u64 = 5;

/// What a browser observed for one service instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrowseEvent {
    Found {
        service: ServiceName,
        display_name: String,
    },
    Resolved {
        service: ServiceName,
        host: String,
        port: u16,
    },
    /// Resolved to a complete base URL, scheme included.
    Located {
        service: ServiceName,
        address: ServerAddress,
    },
    ResolveFailed {
        service: ServiceName,
        reason: String,
    },
    Removed {
        service: ServiceName,
    },
}

/// Transport seam of discovery.
///
/// `browse` starts listening and returns the event channel; the browser
/// stops and closes the channel once `token` is cancelled.
pub trait ServiceBrowser: Send + Sync {
    fn browse(
        &self,
        service_type: &str,
        token: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<BrowseEvent>, DiscoveryError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryConfig {
    pub service_type: String,
    pub resolve_timeout: Duration,
    /// Used by the view to decide that no server is around.
    pub window: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            resolve_timeout: Duration::from_secs(DEFAULT_RESOLVE_TIMEOUT_SECS),
            window: Duration::from_secs(DEFAULT_WINDOW_SECS),
        }
    }
}

struct Session {
    id: u64,
    token: CancellationToken,
}

/// Publishes a session's list, unless a newer session took over.
#[derive(Clone)]
struct Publisher {
    session: u64,
    current: Arc<AtomicU64>,
    sender: Arc<watch::Sender<Vec<DiscoveredServer>>>,
}

impl Publisher {
    fn publish(&self, list: &ServerList) {
        self.sender.send_if_modified(|servers| {
            if self.current.load(Ordering::SeqCst) != self.session {
                return false;
            }
            if servers.as_slice() == list.servers() {
                return false;
            }
            *servers = list.servers().to_vec();
            true
        });
    }
}

/// Server discovery, owned by a view.
///
/// The session task is the only writer of the server list.
pub struct ServiceDiscovery {
    browser: Arc<dyn ServiceBrowser>,
    config: DiscoveryConfig,
    sender: Arc<watch::Sender<Vec<DiscoveredServer>>>,
    current: Arc<AtomicU64>,
    next_session: AtomicU64,
    session: Mutex<Option<Session>>,
}

impl ServiceDiscovery {
    pub fn new(browser: Arc<dyn ServiceBrowser>, config: DiscoveryConfig) -> Self {
        let (sender, _) = watch::channel(Vec::new());
        Self {
            browser,
            config,
            sender: Arc::new(sender),
            current: Arc::new(AtomicU64::new(0)),
            next_session: AtomicU64::new(1),
            session: Mutex::new(None),
        }
    }

    /// Discovery over mDNS with the given configuration.
    pub fn mdns(config: DiscoveryConfig) -> Self {
        Self::new(Arc::new(MdnsBrowser::default()), config)
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Starts browsing. Called while active, it clears the list and starts
    /// a fresh session.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_browsing(&self) -> Result<(), DiscoveryError> {
        let mut session = self.lock_session();
        if let Some(previous) = session.take() {
            debug!(session = previous.id, "Restarting discovery");
            previous.token.cancel();
        }

        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.current.store(id, Ordering::SeqCst);
        self.sender.send_if_modified(|servers| {
            let changed = !servers.is_empty();
            servers.clear();
            changed
        });

        let token = CancellationToken::new();
        let events = self
            .browser
            .browse(&self.config.service_type, token.child_token())?;

        info!(service_type = %self.config.service_type, session = id, "Browsing for media servers");

        let publisher = Publisher {
            session: id,
            current: self.current.clone(),
            sender: self.sender.clone(),
        };
        tokio::spawn(run_session(
            events,
            token.clone(),
            self.config.resolve_timeout,
            publisher,
        ));

        *session = Some(Session { id, token });
        Ok(())
    }

    /// Stops browsing; pending resolutions are abandoned.
    ///
    /// The last published list stays readable.
    pub fn stop_browsing(&self) {
        if let Some(session) = self.lock_session().take() {
            debug!(session = session.id, "Stopping discovery");
            self.current.store(0, Ordering::SeqCst);
            session.token.cancel();
        }
    }

    pub fn is_browsing(&self) -> bool {
        self.lock_session().is_some()
    }

    pub fn servers(&self) -> Vec<DiscoveredServer> {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<DiscoveredServer>> {
        self.sender.subscribe()
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ServiceDiscovery {
    fn drop(&mut self) {
        self.stop_browsing();
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_session(
    mut events: mpsc::UnboundedReceiver<BrowseEvent>,
    token: CancellationToken,
    resolve_timeout: Duration,
    publisher: Publisher,
) {
    let mut list = ServerList::new();
    let mut deadlines: HashMap<ServiceName, Instant> = HashMap::new();

    loop {
        let next_deadline = deadlines.values().min().copied();
        let changed = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => apply_event(&mut list, &mut deadlines, event, resolve_timeout),
                None => {
                    warn!(session = publisher.session, "Service browser closed its event stream");
                    break;
                }
            },
            _ = sleep_until_opt(next_deadline) => {
                let now = Instant::now();
                let expired: Vec<ServiceName> = deadlines
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(service, _)| service.clone())
                    .collect();
                let mut changed = false;
                for service in expired {
                    deadlines.remove(&service);
                    if list.on_resolve_timeout(&service) {
                        debug!(service = %service, "Resolution timed out, dropping server");
                        changed = true;
                    }
                }
                changed
            }
        };

        if changed && !token.is_cancelled() {
            publisher.publish(&list);
        }
    }
    debug!(session = publisher.session, "Discovery session ended");
}

fn apply_event(
    list: &mut ServerList,
    deadlines: &mut HashMap<ServiceName, Instant>,
    event: BrowseEvent,
    resolve_timeout: Duration,
) -> bool {
    match event {
        BrowseEvent::Found {
            service,
            display_name,
        } => {
            let inserted = list.on_found(service.clone(), display_name);
            if inserted {
                deadlines.insert(service, Instant::now() + resolve_timeout);
            }
            inserted
        }
        BrowseEvent::Resolved {
            service,
            host,
            port,
        } => {
            deadlines.remove(&service);
            match ServerAddress::from_host_port(&host, port) {
                Ok(address) => list.on_resolved(&service, address),
                Err(e) => {
                    debug!(service = %service, error = %e, "Unusable resolution, dropping server");
                    list.on_resolve_failed(&service)
                }
            }
        }
        BrowseEvent::Located { service, address } => {
            deadlines.remove(&service);
            list.on_resolved(&service, address)
        }
        BrowseEvent::ResolveFailed { service, reason } => {
            debug!(service = %service, %reason, "Resolution failed, dropping server");
            deadlines.remove(&service);
            list.on_resolve_failed(&service)
        }
        BrowseEvent::Removed { service } => {
            deadlines.remove(&service);
            let removed = list.on_removed(&service);
            if removed {
                info!(service = %service, "Server withdrawn");
            }
            removed
        }
    }
}
