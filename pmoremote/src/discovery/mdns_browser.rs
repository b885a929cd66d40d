//! [`ServiceBrowser`] on top of the `mdns` crate.
//!
//! The `mdns` stream is driven by async-std; it runs on its own thread and
//! forwards events to the tokio side through an unbounded channel.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use futures_util::future::{Either, select};
use futures_util::{StreamExt, pin_mut};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{BrowseEvent, ServiceBrowser};
use crate::errors::DiscoveryError;
use crate::model::ServiceName;

/// Interval between mDNS queries
pub const DEFAULT_QUERY_INTERVAL_SECS: u64 = 15;

#[derive(Clone, Debug)]
pub struct MdnsBrowser {
    query_interval: Duration,
}

impl MdnsBrowser {
    pub fn new(query_interval: Duration) -> Self {
        Self { query_interval }
    }
}

impl Default for MdnsBrowser {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_QUERY_INTERVAL_SECS))
    }
}

impl ServiceBrowser for MdnsBrowser {
    fn browse(
        &self,
        service_type: &str,
        token: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<BrowseEvent>, DiscoveryError> {
        let service_type = normalize_service_type(service_type)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);
        let interval = self.query_interval;

        std::thread::Builder::new()
            .name("pmoremote-mdns".into())
            .spawn(move || {
                async_std::task::block_on(listen(service_type, interval, tx, token, ready_tx))
            })
            .map_err(|e| DiscoveryError::Thread(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(rx),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DiscoveryError::Thread(
                "mDNS thread exited during setup".into(),
            )),
        }
    }
}

fn normalize_service_type(service_type: &str) -> Result<String, DiscoveryError> {
    let normalized = service_type.trim().trim_end_matches('.').to_ascii_lowercase();
    let labels: Vec<&str> = normalized.split('.').collect();
    let valid = labels.len() >= 3
        && labels[0].starts_with('_')
        && labels[0].len() > 1
        && matches!(labels[1], "_tcp" | "_udp")
        && labels[2..].iter().all(|l| !l.is_empty());
    if valid {
        Ok(normalized)
    } else {
        Err(DiscoveryError::InvalidServiceType(service_type.to_string()))
    }
}

async fn listen(
    service_type: String,
    interval: Duration,
    tx: mpsc::UnboundedSender<BrowseEvent>,
    token: CancellationToken,
    ready: std::sync::mpsc::SyncSender<Result<(), DiscoveryError>>,
) {
    let discovery = match mdns::discover::all(&service_type, interval) {
        Ok(discovery) => {
            let _ = ready.send(Ok(()));
            discovery
        }
        Err(e) => {
            let _ = ready.send(Err(DiscoveryError::Mdns(e.to_string())));
            return;
        }
    };

    let stream = discovery.listen();
    pin_mut!(stream);

    loop {
        let cancelled = token.cancelled();
        pin_mut!(cancelled);
        let next = match select(stream.next(), cancelled).await {
            Either::Left((next, _)) => next,
            Either::Right(_) => break,
        };

        match next {
            Some(Ok(response)) => {
                let records = raw_records(&response);
                for event in events_from_records(&service_type, &records) {
                    trace!(?event, "mDNS event");
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            }
            Some(Err(e)) => warn!(error = %e, "mDNS receive error"),
            None => break,
        }
    }
    debug!(%service_type, "mDNS listener stopped");
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum RawData {
    Ptr(String),
    Srv { port: u16, target: String },
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Other,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RawRecord {
    pub name: String,
    pub ttl: u32,
    pub data: RawData,
}

fn raw_records(response: &mdns::Response) -> Vec<RawRecord> {
    response
        .records()
        .map(|record| RawRecord {
            name: record.name.clone(),
            ttl: record.ttl,
            data: match &record.kind {
                mdns::RecordKind::PTR(target) => RawData::Ptr(target.clone()),
                mdns::RecordKind::SRV { port, target, .. } => RawData::Srv {
                    port: *port,
                    target: target.clone(),
                },
                mdns::RecordKind::A(addr) => RawData::A(*addr),
                mdns::RecordKind::AAAA(addr) => RawData::Aaaa(*addr),
                _ => RawData::Other,
            },
        })
        .collect()
}

fn same_name(a: &str, b: &str) -> bool {
    a.trim_end_matches('.')
        .eq_ignore_ascii_case(b.trim_end_matches('.'))
}

fn is_instance_of(name: &str, service_type: &str) -> bool {
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    name.len() > service_type.len() + 1 && name.ends_with(&format!(".{service_type}"))
}

/// Maps the records of one mDNS response to browse events.
///
/// PTR records announce (or, with ttl 0, withdraw) instances; an SRV record
/// plus its A/AAAA records resolve one. IPv4 is preferred, the SRV target
/// hostname is the fallback.
pub(crate) fn events_from_records(service_type: &str, records: &[RawRecord]) -> Vec<BrowseEvent> {
    let mut events = Vec::new();
    let mut announced: Vec<ServiceName> = Vec::new();
    let mut withdrawn: Vec<ServiceName> = Vec::new();

    for record in records {
        let RawData::Ptr(instance) = &record.data else {
            continue;
        };
        if !same_name(&record.name, service_type) {
            continue;
        }
        let service = ServiceName::new(instance.as_str());
        if record.ttl == 0 {
            withdrawn.push(service.clone());
            events.push(BrowseEvent::Removed { service });
        } else {
            announced.push(service.clone());
            events.push(BrowseEvent::Found {
                display_name: service.display_name(service_type),
                service,
            });
        }
    }

    for record in records {
        let RawData::Srv { port, target } = &record.data else {
            continue;
        };
        if record.ttl == 0 || !is_instance_of(&record.name, service_type) {
            continue;
        }
        let service = ServiceName::new(record.name.as_str());
        if withdrawn.contains(&service) {
            continue;
        }
        if !announced.contains(&service) {
            announced.push(service.clone());
            events.push(BrowseEvent::Found {
                display_name: service.display_name(service_type),
                service: service.clone(),
            });
        }

        let addresses: Vec<IpAddr> = records
            .iter()
            .filter(|r| same_name(&r.name, target))
            .filter_map(|r| match r.data {
                RawData::A(addr) => Some(IpAddr::V4(addr)),
                RawData::Aaaa(addr) => Some(IpAddr::V6(addr)),
                _ => None,
            })
            .collect();

        // Préférer les adresses IPv4
        let host = addresses
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addresses.first())
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| target.trim_end_matches('.').to_string());

        events.push(BrowseEvent::Resolved {
            service,
            host,
            port: *port,
        });
    }

    events
}
