//! Data model shared by discovery, the catalogue client and the view state.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::errors::CatalogueError;

/// Identity assigned to a server when discovery first sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId(pub Uuid);

impl ServerId {
    pub fn new() -> Self {
        ServerId(Uuid::new_v4())
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Full DNS-SD instance name (`My Mac._myvideoserver._tcp.local`).
///
/// This is the identity of an advertisement: two servers may share a
/// display name but never an instance name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceName(pub String);

impl ServiceName {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        ServiceName(name.trim_end_matches('.').to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Instance label, i.e. the part before the service type.
    pub fn display_name(&self, service_type: &str) -> String {
        let service_type = service_type.trim_end_matches('.');
        let name = self.0.as_str();
        // `get` refuses offsets that fall inside a multibyte character
        let prefix = name
            .len()
            .checked_sub(service_type.len())
            .filter(|&start| start > 0)
            .and_then(|start| Some((name.get(..start)?, name.get(start..)?)))
            .filter(|(_, suffix)| suffix.eq_ignore_ascii_case(service_type))
            .map(|(prefix, _)| prefix.trim_end_matches('.'));
        let label = prefix.unwrap_or_else(|| name.split('.').next().unwrap_or(name));
        unescape_dns_label(label)
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Les noms DNS-SD échappent les espaces et points sous la forme `\032` / `\.`
// Les `\ddd` sont des octets UTF-8, pas des caractères.
fn unescape_dns_label(label: &str) -> String {
    let bytes = label.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let escaped = bytes
            .get(i + 1..i + 4)
            .filter(|digits| digits.iter().all(u8::is_ascii_digit))
            .and_then(|digits| std::str::from_utf8(digits).ok()?.parse::<u8>().ok());
        match escaped {
            Some(byte) => {
                out.push(byte);
                i += 4;
            }
            None => {
                if let Some(&next) = bytes.get(i + 1) {
                    out.push(next);
                }
                i += 2;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Base URL of a media server, always `http(s)://host:port` with no path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    base: Url,
}

impl ServerAddress {
    /// Parses a base URL such as `http://192.168.1.5:8080`.
    pub fn parse(input: &str) -> Result<Self, CatalogueError> {
        let base = Url::parse(input.trim())
            .map_err(|e| CatalogueError::InvalidAddress(format!("{input}: {e}")))?;
        Self::from_url(base)
    }

    /// Builds the address from a resolved host and port.
    ///
    /// IPv6 literals are bracketed, hostnames lose their trailing dot.
    pub fn from_host_port(host: &str, port: u16) -> Result<Self, CatalogueError> {
        let host = host.trim_end_matches('.');
        let authority = match host.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, port).to_string(),
            Err(_) => format!("{host}:{port}"),
        };
        Self::parse(&format!("http://{authority}"))
    }

    fn from_url(mut base: Url) -> Result<Self, CatalogueError> {
        if !matches!(base.scheme(), "http" | "https") {
            return Err(CatalogueError::InvalidAddress(format!(
                "unsupported scheme '{}'",
                base.scheme()
            )));
        }
        if base.host_str().is_none_or(str::is_empty) {
            return Err(CatalogueError::InvalidAddress(format!("{base}: missing host")));
        }
        base.set_query(None);
        base.set_fragment(None);
        base.set_path("/");
        Ok(ServerAddress { base })
    }

    /// `http://host:port` without the trailing slash.
    pub fn as_str(&self) -> &str {
        self.base.as_str().trim_end_matches('/')
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// `GET /albums`
    pub fn albums_url(&self) -> Url {
        self.endpoint(&["albums"])
    }

    /// `GET /albums/{album_id}/videos`
    pub fn album_media_url(&self, album_id: &str) -> Url {
        self.endpoint(&["albums", album_id, "videos"])
    }

    /// `GET /thumbnail/{id}`
    pub fn thumbnail_url(&self, media_id: &str) -> Url {
        self.endpoint(&["thumbnail", media_id])
    }

    /// `GET /video/{id}`, used for both video and photo payloads.
    pub fn media_url(&self, media_id: &str) -> Url {
        self.endpoint(&["video", media_id])
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ServerAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A server seen by discovery.
///
/// `address` stays `None` until the advertisement is resolved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DiscoveredServer {
    pub id: ServerId,
    pub display_name: String,
    pub service: ServiceName,
    pub address: Option<ServerAddress>,
}

impl DiscoveredServer {
    pub fn new(service: ServiceName, display_name: impl Into<String>) -> Self {
        Self {
            id: ServerId::new(),
            display_name: display_name.into(),
            service,
            address: None,
        }
    }

    /// A server is usable once it has been resolved.
    pub fn is_usable(&self) -> bool {
        self.address.is_some()
    }

    pub fn usable_address(&self) -> Option<&ServerAddress> {
        self.address.as_ref()
    }
}

/// Album content kind, from the optional wire `type` field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlbumKind {
    Video,
    Photo,
    Mixed,
    #[default]
    Unspecified,
}

impl AlbumKind {
    /// Older servers omit the field; unknown values count as unspecified.
    pub fn from_wire(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("video") | Some("videos") => AlbumKind::Video,
            Some("photo") | Some("photos") => AlbumKind::Photo,
            Some("mixed") => AlbumKind::Mixed,
            _ => AlbumKind::Unspecified,
        }
    }
}

/// Display grouping of albums.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum AlbumGroup {
    /// Aggregates maintained by the server (`ALL VIDEOS`, ...).
    Library,
    /// Albums created by the user.
    UserAlbums,
}

impl AlbumGroup {
    pub fn title(&self) -> &'static str {
        match self {
            AlbumGroup::Library => "Library",
            AlbumGroup::UserAlbums => "My albums",
        }
    }
}

const LIBRARY_PREFIX: &str = "ALL ";

/// One album of a catalogue snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AlbumSummary {
    pub id: String,
    pub name: String,
    pub media_count: u64,
    pub kind: AlbumKind,
}

impl AlbumSummary {
    pub fn group(&self) -> AlbumGroup {
        if self.name.trim_start().to_uppercase().starts_with(LIBRARY_PREFIX) {
            AlbumGroup::Library
        } else {
            AlbumGroup::UserAlbums
        }
    }
}

/// Splits albums into display groups, Library first, keeping server order.
///
/// Empty groups are omitted.
pub fn group_albums(albums: &[AlbumSummary]) -> Vec<(AlbumGroup, Vec<AlbumSummary>)> {
    [AlbumGroup::Library, AlbumGroup::UserAlbums]
        .into_iter()
        .map(|group| {
            let members: Vec<AlbumSummary> = albums
                .iter()
                .filter(|album| album.group() == group)
                .cloned()
                .collect();
            (group, members)
        })
        .filter(|(_, members)| !members.is_empty())
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Photo,
}

impl MediaKind {
    /// Only `"photo"` marks a photo; anything else, null included, is a video.
    pub fn from_wire(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("photo") => MediaKind::Photo,
            _ => MediaKind::Video,
        }
    }
}

/// One video or photo of an album.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MediaItem {
    pub id: String,
    pub filename: String,
    pub duration_seconds: f64,
    pub imported_at: DateTime<Utc>,
    pub captured_at: Option<DateTime<Utc>>,
    pub media_kind: MediaKind,
}

impl MediaItem {
    /// Ordering date: capture date when known, import date otherwise.
    pub fn sort_date(&self) -> DateTime<Utc> {
        self.captured_at.unwrap_or(self.imported_at)
    }

    pub fn is_photo(&self) -> bool {
        self.media_kind == MediaKind::Photo
    }

    /// `m:ss`, or `h:mm:ss` from one hour on.
    pub fn formatted_duration(&self) -> String {
        format_duration(self.duration_seconds)
    }
}

pub fn format_duration(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn album(name: &str) -> AlbumSummary {
        AlbumSummary {
            id: name.to_lowercase(),
            name: name.to_string(),
            media_count: 0,
            kind: AlbumKind::Unspecified,
        }
    }

    #[test]
    fn test_server_address_endpoints() {
        let address = ServerAddress::parse("http://192.168.1.5:8080").unwrap();
        assert_eq!(address.as_str(), "http://192.168.1.5:8080");
        assert_eq!(
            address.albums_url().as_str(),
            "http://192.168.1.5:8080/albums"
        );
        assert_eq!(
            address.album_media_url("a1").as_str(),
            "http://192.168.1.5:8080/albums/a1/videos"
        );
        assert_eq!(
            address.thumbnail_url("x1").as_str(),
            "http://192.168.1.5:8080/thumbnail/x1"
        );
        assert_eq!(
            address.media_url("x1").as_str(),
            "http://192.168.1.5:8080/video/x1"
        );
    }

    #[test]
    fn test_server_address_encodes_segments() {
        let address = ServerAddress::parse("http://host:1/ignored?q=1").unwrap();
        assert_eq!(
            address.album_media_url("my album/2").as_str(),
            "http://host:1/albums/my%20album%2F2/videos"
        );
    }

    #[test]
    fn test_server_address_from_host_port() {
        let v4 = ServerAddress::from_host_port("192.168.1.5", 8080).unwrap();
        assert_eq!(v4.as_str(), "http://192.168.1.5:8080");

        let v6 = ServerAddress::from_host_port("fe80::1", 8080).unwrap();
        assert_eq!(v6.as_str(), "http://[fe80::1]:8080");

        let named = ServerAddress::from_host_port("studio.local.", 9000).unwrap();
        assert_eq!(named.as_str(), "http://studio.local:9000");
    }

    #[test]
    fn test_server_address_rejects_bad_input() {
        assert!(ServerAddress::parse("ftp://host:21").is_err());
        assert!(ServerAddress::parse("not a url").is_err());
    }

    #[test]
    fn test_service_display_name() {
        let service = ServiceName::new("My\\032Mac._myvideoserver._tcp.local.");
        assert_eq!(service.as_str(), "My\\032Mac._myvideoserver._tcp.local");
        assert_eq!(service.display_name("_myvideoserver._tcp.local"), "My Mac");

        let dotted = ServiceName::new("Studio\\.2._myvideoserver._tcp.local");
        assert_eq!(dotted.display_name("_myvideoserver._tcp.local."), "Studio.2");
    }

    #[test]
    fn test_service_display_name_non_ascii() {
        let service_type = "_myvideoserver._tcp.local";

        let bare = ServiceName::new("ハヤトのマックブック");
        assert_eq!(bare.display_name(service_type), "ハヤトのマックブック");

        let full = ServiceName::new("ハヤトのMacBook._myvideoserver._tcp.local");
        assert_eq!(full.display_name(service_type), "ハヤトのMacBook");

        // `ハヤト` échappé octet par octet
        let escaped = ServiceName::new(
            "\\227\\131\\143\\227\\131\\164\\227\\131\\136._myvideoserver._tcp.local",
        );
        assert_eq!(escaped.display_name(service_type), "ハヤト");
    }

    #[test]
    fn test_server_id_serde() {
        let id = ServerId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: ServerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        let server = DiscoveredServer::new(ServiceName::new("Mac._myvideoserver._tcp.local"), "Mac");
        let value = serde_json::to_value(&server).unwrap();
        assert_eq!(value["id"], serde_json::Value::String(server.id.to_string()));
        assert_eq!(value["display_name"], "Mac");
    }

    #[test]
    fn test_album_kind_from_wire() {
        assert_eq!(AlbumKind::from_wire(Some("mixed")), AlbumKind::Mixed);
        assert_eq!(AlbumKind::from_wire(Some("Photo")), AlbumKind::Photo);
        assert_eq!(AlbumKind::from_wire(Some("video")), AlbumKind::Video);
        assert_eq!(AlbumKind::from_wire(Some("audio")), AlbumKind::Unspecified);
        assert_eq!(AlbumKind::from_wire(None), AlbumKind::Unspecified);
    }

    #[test]
    fn test_media_kind_from_wire() {
        assert_eq!(MediaKind::from_wire(Some("photo")), MediaKind::Photo);
        assert_eq!(MediaKind::from_wire(Some("video")), MediaKind::Video);
        assert_eq!(MediaKind::from_wire(None), MediaKind::Video);
    }

    #[test]
    fn test_group_albums() {
        let albums = vec![album("Holidays"), album("ALL VIDEOS"), album("Kids")];
        let groups = group_albums(&albums);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, AlbumGroup::Library);
        assert_eq!(groups[0].1, vec![album("ALL VIDEOS")]);
        assert_eq!(groups[1].0, AlbumGroup::UserAlbums);
        assert_eq!(groups[1].1, vec![album("Holidays"), album("Kids")]);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0.0), "0:00");
        assert_eq!(format_duration(65.4), "1:05");
        assert_eq!(format_duration(3725.0), "1:02:05");
        assert_eq!(format_duration(f64::NAN), "0:00");
    }
}
