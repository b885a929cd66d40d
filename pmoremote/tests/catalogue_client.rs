//! Integration tests for the catalogue client

use std::time::Duration;

use pmoremote::{AlbumGroup, AlbumKind, CatalogueClient, CatalogueError, MediaKind, ServerAddress};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn address(server: &MockServer) -> ServerAddress {
    ServerAddress::parse(&server.uri()).unwrap()
}

#[tokio::test]
async fn test_fetch_albums() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/albums"))
        .and(header("cache-control", "no-cache"))
        .and(header("pragma", "no-cache"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": "all", "name": "ALL VIDEOS", "videoCount": 42, "type": "mixed"},
            {"id": "u1", "name": "Holidays", "videoCount": 3}
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = CatalogueClient::new().unwrap();
    let albums = client.fetch_albums(&address(&mock_server)).await.unwrap();

    assert_eq!(albums.len(), 2);
    assert_eq!(albums[0].name, "ALL VIDEOS");
    assert_eq!(albums[0].kind, AlbumKind::Mixed);
    assert_eq!(albums[0].group(), AlbumGroup::Library);
    assert_eq!(albums[1].kind, AlbumKind::Unspecified);
    assert_eq!(albums[1].group(), AlbumGroup::UserAlbums);
}

#[tokio::test]
async fn test_fetch_media_tolerates_bad_dates() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/albums/u1/videos"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "id": "x1", "filename": "beach.mov", "duration": 75.2,
                "importDate": "2024-05-01T09:00:00Z",
                "creationDate": "2024-04-30T18:00:00.123Z",
                "mediaType": "video"
            },
            {
                "id": "x2", "filename": "sunset.jpg", "duration": 0,
                "importDate": "2024-05-01T09:00:01Z",
                "creationDate": "garbage",
                "mediaType": "photo"
            },
            {
                "id": "x3", "filename": "broken.mov", "duration": 1,
                "importDate": "01/05/2024",
                "creationDate": null,
                "mediaType": null
            }
        ])))
        .mount(&mock_server)
        .await;

    let client = CatalogueClient::new().unwrap();
    let items = client
        .fetch_media(&address(&mock_server), "u1")
        .await
        .unwrap();

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].id, "x1");
    assert!(items[0].captured_at.is_some());
    assert_eq!(items[0].formatted_duration(), "1:15");
    assert_eq!(items[1].media_kind, MediaKind::Photo);
    assert_eq!(items[1].captured_at, None);
    assert_eq!(items[1].sort_date(), items[1].imported_at);
}

#[tokio::test]
async fn test_server_error_is_reported() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/albums"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let client = CatalogueClient::new().unwrap();
    let err = client
        .fetch_albums(&address(&mock_server))
        .await
        .unwrap_err();
    assert_eq!(err, CatalogueError::Status(500));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_malformed_json_fails_whole_batch() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/albums/u1/videos"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[{\"id\": \"x1\","))
        .mount(&mock_server)
        .await;

    let client = CatalogueClient::new().unwrap();
    let err = client
        .fetch_media(&address(&mock_server), "u1")
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogueError::Decode(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_request_timeout() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/albums"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&mock_server)
        .await;

    let client = CatalogueClient::builder()
        .timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let err = client
        .fetch_albums(&address(&mock_server))
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogueError::Network(_)));
}

#[tokio::test]
async fn test_cancelled_fetch() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/albums"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&mock_server)
        .await;

    let client = CatalogueClient::new().unwrap();
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let err = client
        .fetch_albums_cancellable(&address(&mock_server), &token)
        .await
        .unwrap_err();
    assert_eq!(err, CatalogueError::Cancelled);
}

#[tokio::test]
async fn test_unreachable_server() {
    // port fermé
    let address = ServerAddress::parse("http://127.0.0.1:9").unwrap();
    let client = CatalogueClient::new().unwrap();
    let err = client.fetch_albums(&address).await.unwrap_err();
    assert!(matches!(err, CatalogueError::Network(_)));
}
