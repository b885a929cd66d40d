use tracing::debug;

use crate::model::{DiscoveredServer, ServerAddress, ServiceName};

/// Insertion-ordered list of discovered servers.
///
/// Every mutator returns `true` when the list changed.
#[derive(Clone, Debug, Default)]
pub struct ServerList {
    servers: Vec<DiscoveredServer>,
}

impl ServerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn servers(&self) -> &[DiscoveredServer] {
        &self.servers
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn clear(&mut self) -> bool {
        let changed = !self.servers.is_empty();
        self.servers.clear();
        changed
    }

    pub fn get(&self, service: &ServiceName) -> Option<&DiscoveredServer> {
        self.servers.iter().find(|s| &s.service == service)
    }

    /// Appends an unresolved entry.
    ///
    /// Advertisements sharing a display name with a tracked server are
    /// ignored, even from a different instance.
    pub fn on_found(&mut self, service: ServiceName, display_name: String) -> bool {
        if let Some(existing) = self
            .servers
            .iter()
            .find(|s| s.service == service || s.display_name == display_name)
        {
            debug!(
                service = %service,
                tracked = %existing.service,
                name = %display_name,
                "Ignoring duplicate advertisement"
            );
            return false;
        }
        debug!(service = %service, name = %display_name, "Server found");
        self.servers.push(DiscoveredServer::new(service, display_name));
        true
    }

    /// Stores the resolved address; a later resolution overwrites it.
    pub fn on_resolved(&mut self, service: &ServiceName, address: ServerAddress) -> bool {
        match self.servers.iter_mut().find(|s| &s.service == service) {
            Some(server) if server.address.as_ref() == Some(&address) => false,
            Some(server) => {
                debug!(service = %service, %address, "Server resolved");
                server.address = Some(address);
                true
            }
            None => {
                debug!(service = %service, "Resolution for an untracked service");
                false
            }
        }
    }

    pub fn on_resolve_failed(&mut self, service: &ServiceName) -> bool {
        self.remove(service)
    }

    /// Drops the entry if it is still unresolved.
    pub fn on_resolve_timeout(&mut self, service: &ServiceName) -> bool {
        let unresolved = self
            .get(service)
            .is_some_and(|server| server.address.is_none());
        unresolved && self.remove(service)
    }

    /// Withdrawal is matched on the instance name, never the display name.
    pub fn on_removed(&mut self, service: &ServiceName) -> bool {
        self.remove(service)
    }

    fn remove(&mut self, service: &ServiceName) -> bool {
        let before = self.servers.len();
        self.servers.retain(|s| &s.service != service);
        before != self.servers.len()
    }

    pub fn first_usable(&self) -> Option<&DiscoveredServer> {
        self.servers.iter().find(|s| s.is_usable())
    }
}
