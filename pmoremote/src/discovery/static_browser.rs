use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{BrowseEvent, ServiceBrowser};
use crate::errors::DiscoveryError;
use crate::model::{ServerAddress, ServiceName};

/// Browser announcing a fixed set of servers, for hosts given by hand.
#[derive(Clone, Debug, Default)]
pub struct StaticBrowser {
    servers: Vec<(String, ServerAddress)>,
}

impl StaticBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(mut self, display_name: impl Into<String>, address: ServerAddress) -> Self {
        self.servers.push((display_name.into(), address));
        self
    }
}

impl ServiceBrowser for StaticBrowser {
    fn browse(
        &self,
        service_type: &str,
        token: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<BrowseEvent>, DiscoveryError> {
        let (tx, rx) = mpsc::unbounded_channel();
        for (display_name, address) in &self.servers {
            let service = ServiceName::new(format!("{display_name}.{service_type}"));
            let _ = tx.send(BrowseEvent::Found {
                service: service.clone(),
                display_name: display_name.clone(),
            });
            let _ = tx.send(BrowseEvent::Located {
                service,
                address: address.clone(),
            });
        }
        // Le canal reste ouvert: l'émetteur est conservé jusqu'à l'annulation.
        tokio::spawn(async move {
            token.cancelled().await;
            drop(tx);
        });
        Ok(rx)
    }
}
