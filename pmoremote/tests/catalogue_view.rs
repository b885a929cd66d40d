//! Integration tests for the catalogue view state machine

use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pmoremote::{
    AlbumGroup, AssetFetchState, AssetFetcher, BrowseEvent, CatalogueClient, CatalogueSnapshot,
    CatalogueState, CatalogueViewHandle, CollaboratorError, DiscoveryConfig, DiscoveryError,
    DisplayState, LoadStatus, PlaybackSurface, RetryPolicy, ServerAddress, ServiceBrowser,
    ServiceDiscovery, ServiceName, StaticBrowser,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TYPE: &str = "_myvideoserver._tcp.local";

#[derive(Default)]
struct ScriptedBrowser {
    senders: Mutex<Vec<mpsc::UnboundedSender<BrowseEvent>>>,
}

impl ScriptedBrowser {
    fn emit(&self, event: BrowseEvent) {
        self.senders.lock().unwrap().last().unwrap().send(event).unwrap();
    }

    fn announce(&self, name: &str, address: &ServerAddress) {
        let url = address.albums_url();
        self.emit(BrowseEvent::Found {
            service: service(name),
            display_name: name.into(),
        });
        self.emit(BrowseEvent::Resolved {
            service: service(name),
            host: url.host_str().unwrap().into(),
            port: url.port().unwrap(),
        });
    }
}

impl ServiceBrowser for ScriptedBrowser {
    fn browse(
        &self,
        _service_type: &str,
        _token: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<BrowseEvent>, DiscoveryError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().push(tx);
        Ok(rx)
    }
}

#[derive(Default)]
struct RecordingPlayer {
    loaded: Option<Url>,
    playing: bool,
}

impl PlaybackSurface for RecordingPlayer {
    fn load(&mut self, url: &Url) -> Result<(), CollaboratorError> {
        self.loaded = Some(url.clone());
        Ok(())
    }

    fn play(&mut self) -> Result<(), CollaboratorError> {
        self.playing = true;
        Ok(())
    }

    fn pause(&mut self) -> Result<(), CollaboratorError> {
        self.playing = false;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.loaded.is_some()
    }
}

fn service(name: &str) -> ServiceName {
    ServiceName::new(format!("{name}.{TYPE}"))
}

fn config(window: Duration) -> DiscoveryConfig {
    DiscoveryConfig {
        window,
        ..DiscoveryConfig::default()
    }
}

fn fast_assets(catalogue: &CatalogueClient, backoff: Duration) -> AssetFetcher {
    let policy = RetryPolicy {
        max_attempts: 30,
        generation_backoff: backoff,
        error_backoff: backoff,
        request_timeout: Duration::from_secs(5),
    };
    AssetFetcher::new(catalogue.http_client().clone(), policy.clone(), policy)
}

fn view_with(browser: Arc<dyn ServiceBrowser>, window: Duration) -> CatalogueViewHandle {
    let catalogue = CatalogueClient::new().unwrap();
    let assets = fast_assets(&catalogue, Duration::from_millis(400));
    CatalogueViewHandle::spawn(
        ServiceDiscovery::new(browser, config(window)),
        catalogue,
        assets,
    )
}

fn static_view(server: &MockServer) -> CatalogueViewHandle {
    let address = ServerAddress::parse(&server.uri()).unwrap();
    view_with(
        Arc::new(StaticBrowser::new().with_server("My Mac", address)),
        Duration::from_secs(5),
    )
}

async fn wait<F>(view: &CatalogueViewHandle, predicate: F) -> CatalogueSnapshot
where
    F: FnMut(&CatalogueSnapshot) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), view.wait_until(predicate))
        .await
        .expect("timed out waiting for the view")
        .expect("view task stopped")
}

fn loaded(snapshot: &CatalogueSnapshot) -> bool {
    matches!(
        snapshot.state,
        CatalogueState::ServerFound {
            status: LoadStatus::Loaded,
            ..
        }
    )
}

async fn mount_albums(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/albums"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "all", "name": "ALL VIDEOS", "videoCount": 2, "type": "mixed"}
        ])))
        .mount(server)
        .await;
}

async fn mount_media(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/albums/all/videos"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "x1", "filename": "beach.mov", "duration": 12.0,
             "importDate": "2024-05-01T09:00:00Z", "creationDate": null, "mediaType": "video"},
            {"id": "x2", "filename": "dune.jpg", "duration": 0,
             "importDate": "2024-05-02T09:00:00Z", "creationDate": null, "mediaType": "photo"}
        ])))
        .mount(server)
        .await;
}

async fn requests_to(server: &MockServer, url_path: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == url_path)
        .count()
}

#[tokio::test]
async fn test_single_library_album() {
    let mock_server = MockServer::start().await;
    mount_albums(&mock_server).await;

    let view = static_view(&mock_server);
    assert_eq!(view.snapshot().display(), DisplayState::Idle);
    view.enter();

    let snapshot = wait(&view, loaded).await;
    assert_eq!(snapshot.display(), DisplayState::Albums);
    assert_eq!(snapshot.server().unwrap().display_name, "My Mac");

    let groups = snapshot.grouped_albums();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].0, AlbumGroup::Library);
    assert_eq!(groups[0].1.len(), 1);
    assert_eq!(groups[0].1[0].name, "ALL VIDEOS");
}

#[tokio::test]
async fn test_empty_catalogue() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/albums"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&mock_server)
        .await;

    let view = static_view(&mock_server);
    view.enter();
    let snapshot = wait(&view, loaded).await;
    assert_eq!(snapshot.display(), DisplayState::EmptyCatalogue);
}

#[tokio::test]
async fn test_failed_refresh_keeps_albums() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/albums"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "all", "name": "ALL VIDEOS", "videoCount": 2, "type": "mixed"},
            {"id": "u1", "name": "Trip", "videoCount": 1}
        ])))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/albums"))
        .respond_with(ResponseTemplate::new(500))
        .with_priority(2)
        .mount(&mock_server)
        .await;

    let view = static_view(&mock_server);
    view.enter();
    let before = wait(&view, loaded).await;
    assert_eq!(before.albums().len(), 2);

    view.refresh();
    let after = wait(&view, |s| {
        matches!(
            s.state,
            CatalogueState::ServerFound {
                status: LoadStatus::Failed(_),
                ..
            }
        )
    })
    .await;

    assert_eq!(after.albums(), before.albums());
    assert!(matches!(after.display(), DisplayState::FetchFailed(_)));
}

#[tokio::test]
async fn test_no_server_found_then_late_resolution() {
    let mock_server = MockServer::start().await;
    mount_albums(&mock_server).await;

    let browser = Arc::new(ScriptedBrowser::default());
    let view = view_with(browser.clone(), Duration::from_millis(150));
    view.enter();

    let snapshot = wait(&view, |s| s.state == CatalogueState::NoServerFound).await;
    assert_eq!(snapshot.display(), DisplayState::NoServerFound);

    // la découverte continue après la fenêtre
    browser.announce("Late", &ServerAddress::parse(&mock_server.uri()).unwrap());
    let snapshot = wait(&view, loaded).await;
    assert_eq!(snapshot.server().unwrap().display_name, "Late");
}

#[tokio::test]
async fn test_withdrawn_server_switches_to_next() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    mount_albums(&first).await;
    Mock::given(method("GET"))
        .and(path("/albums"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "u9", "name": "Second", "videoCount": 0, "type": "video"}
        ])))
        .mount(&second)
        .await;

    let browser = Arc::new(ScriptedBrowser::default());
    let view = view_with(browser.clone(), Duration::from_secs(5));
    view.enter();
    wait(&view, |s| s.state == CatalogueState::Discovering).await;

    browser.announce("First", &ServerAddress::parse(&first.uri()).unwrap());
    wait(&view, |s| {
        loaded(s) && s.server().is_some_and(|srv| srv.display_name == "First")
    })
    .await;

    browser.announce("Second", &ServerAddress::parse(&second.uri()).unwrap());
    browser.emit(BrowseEvent::Removed {
        service: service("First"),
    });
    let snapshot = wait(&view, |s| {
        loaded(s) && s.server().is_some_and(|srv| srv.display_name == "Second")
    })
    .await;
    assert_eq!(snapshot.albums()[0].name, "Second");

    browser.emit(BrowseEvent::Removed {
        service: service("Second"),
    });
    wait(&view, |s| s.state == CatalogueState::Discovering).await;
}

#[tokio::test]
async fn test_open_album_thumbnail_and_play() {
    let mock_server = MockServer::start().await;
    mount_albums(&mock_server).await;
    mount_media(&mock_server).await;

    let image = image::RgbImage::from_pixel(2, 2, image::Rgb([0, 0, 255]));
    let mut png = Cursor::new(Vec::new());
    image.write_to(&mut png, image::ImageFormat::Png).unwrap();
    Mock::given(method("GET"))
        .and(path("/thumbnail/x1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(png.into_inner()))
        .mount(&mock_server)
        .await;

    let view = static_view(&mock_server);
    view.enter();
    wait(&view, loaded).await;

    view.open_album("all");
    let snapshot = wait(&view, |s| {
        s.album
            .as_ref()
            .is_some_and(|a| a.status == LoadStatus::Loaded)
    })
    .await;
    let items = snapshot.media();
    assert_eq!(items.len(), 2);

    let handle = view.thumbnail("x1").unwrap();
    assert!(matches!(handle.wait().await, AssetFetchState::Ready(_)));

    let mut player = RecordingPlayer::default();
    let url = view.play(&items[0], &mut player).unwrap();
    assert_eq!(url.path(), "/video/x1");
    assert_eq!(player.loaded, Some(url));
    assert!(player.playing);
    assert!(player.is_ready());
}

#[tokio::test]
async fn test_leave_during_backoff_stops_requests() {
    let mock_server = MockServer::start().await;
    mount_albums(&mock_server).await;
    Mock::given(method("GET"))
        .and(path("/thumbnail/x1"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&mock_server)
        .await;

    let view = static_view(&mock_server);
    view.enter();
    wait(&view, loaded).await;

    let handle = view.thumbnail("x1").unwrap();
    let mut state = handle.subscribe();
    state
        .wait_for(|s| matches!(s, AssetFetchState::Retrying { .. }))
        .await
        .unwrap();
    assert_eq!(requests_to(&mock_server, "/thumbnail/x1").await, 1);

    view.leave();
    let snapshot = wait(&view, |s| s.state == CatalogueState::Idle).await;
    assert!(snapshot.album.is_none());

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(requests_to(&mock_server, "/thumbnail/x1").await, 1);
    assert!(handle.is_cancelled());
    assert!(view.thumbnail("x1").is_none());
}

#[tokio::test]
async fn test_reenter_restarts_from_discovering() {
    let mock_server = MockServer::start().await;
    mount_albums(&mock_server).await;

    let view = static_view(&mock_server);
    view.enter();
    wait(&view, loaded).await;

    view.leave();
    wait(&view, |s| s.state == CatalogueState::Idle).await;

    let mut states = view.subscribe();
    view.enter();
    states
        .wait_for(|s| s.state != CatalogueState::Idle)
        .await
        .unwrap();
    wait(&view, loaded).await;
    assert_eq!(requests_to(&mock_server, "/albums").await, 2);
}

fn media_json(id: &str) -> serde_json::Value {
    json!([{
        "id": id, "filename": format!("{id}.mov"), "duration": 3.0,
        "importDate": "2024-05-01T09:00:00Z", "creationDate": null, "mediaType": "video"
    }])
}

fn album_loaded(snapshot: &CatalogueSnapshot, album_id: &str) -> bool {
    snapshot
        .album
        .as_ref()
        .is_some_and(|a| a.album_id == album_id && a.status == LoadStatus::Loaded)
}

fn media_ids(snapshot: &CatalogueSnapshot) -> Vec<String> {
    snapshot.media().iter().map(|m| m.id.clone()).collect()
}

async fn wait_for_requests(server: &MockServer, url_path: &str, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while requests_to(server, url_path).await < count {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("timed out waiting for requests");
}

#[tokio::test]
async fn test_open_album_supersedes_previous_album() {
    let mock_server = MockServer::start().await;
    mount_albums(&mock_server).await;
    Mock::given(method("GET"))
        .and(path("/albums/a/videos"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(media_json("slow"))
                .set_delay(Duration::from_millis(600)),
        )
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/albums/b/videos"))
        .respond_with(ResponseTemplate::new(200).set_body_json(media_json("fast")))
        .mount(&mock_server)
        .await;

    let view = static_view(&mock_server);
    view.enter();
    wait(&view, loaded).await;

    view.open_album("a");
    wait_for_requests(&mock_server, "/albums/a/videos", 1).await;
    view.open_album("b");
    let snapshot = wait(&view, |s| album_loaded(s, "b")).await;
    assert_eq!(media_ids(&snapshot), vec!["fast"]);

    // la réponse lente de "a" ne doit jamais remplacer "b"
    tokio::time::sleep(Duration::from_millis(900)).await;
    let snapshot = view.snapshot();
    assert!(album_loaded(&snapshot, "b"));
    assert_eq!(media_ids(&snapshot), vec!["fast"]);
}

#[tokio::test]
async fn test_double_refresh_keeps_latest_albums() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/albums"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "i", "name": "Initial", "videoCount": 1}
        ])))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/albums"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{"id": "s", "name": "Stale", "videoCount": 1}]))
                .set_delay(Duration::from_millis(600)),
        )
        .up_to_n_times(1)
        .with_priority(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/albums"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "f", "name": "Fresh", "videoCount": 1}
        ])))
        .with_priority(3)
        .mount(&mock_server)
        .await;

    let view = static_view(&mock_server);
    view.enter();
    let initial = wait(&view, loaded).await;
    assert_eq!(initial.albums()[0].name, "Initial");

    view.refresh();
    wait_for_requests(&mock_server, "/albums", 2).await;
    view.refresh();
    let snapshot = wait(&view, |s| {
        loaded(s) && s.albums().first().is_some_and(|a| a.name == "Fresh")
    })
    .await;
    assert_eq!(snapshot.albums().len(), 1);

    tokio::time::sleep(Duration::from_millis(900)).await;
    let snapshot = view.snapshot();
    assert!(loaded(&snapshot));
    assert_eq!(snapshot.albums()[0].name, "Fresh");
}

#[tokio::test]
async fn test_failed_refresh_album_keeps_items_then_close() {
    let mock_server = MockServer::start().await;
    mount_albums(&mock_server).await;
    Mock::given(method("GET"))
        .and(path("/albums/all/videos"))
        .respond_with(ResponseTemplate::new(200).set_body_json(media_json("x1")))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/albums/all/videos"))
        .respond_with(ResponseTemplate::new(500))
        .with_priority(2)
        .mount(&mock_server)
        .await;

    let view = static_view(&mock_server);
    view.enter();
    wait(&view, loaded).await;

    view.open_album("all");
    let before = wait(&view, |s| album_loaded(s, "all")).await;
    assert_eq!(media_ids(&before), vec!["x1"]);

    view.refresh_album();
    let after = wait(&view, |s| {
        s.album
            .as_ref()
            .is_some_and(|a| matches!(a.status, LoadStatus::Failed(_)))
    })
    .await;
    assert_eq!(after.media(), before.media());
    assert_eq!(requests_to(&mock_server, "/albums/all/videos").await, 2);

    view.close_album();
    let closed = wait(&view, |s| s.album.is_none()).await;
    assert!(closed.media().is_empty());
    assert!(loaded(&closed));
}
