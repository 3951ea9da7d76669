use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use livecount_client::identity::SessionIdentity;
use livecount_client::origin::{origin_override, OriginResolver, ORIGIN_OVERRIDE_KEY};
use livecount_client::poller::{FetchError, OnlineFetcher};
use livecount_client::socket::ws::WsConnector;
use livecount_client::store::{FileStore, KeyValueStore};
use livecount_client::{LocalBus, PresenceConfig, PresenceService, ServiceParts};

const WAIT: Duration = Duration::from_secs(5);

struct NoFetch;

impl OnlineFetcher for NoFetch {
    async fn fetch_online(&self, _url: &Url) -> Result<u64, FetchError> {
        Err(FetchError::Other("fallback not expected".into()))
    }
}

#[tokio::test]
async fn leader_tab_tracks_gateway_counts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (uri_tx, uri_rx) = oneshot::channel();

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let callback = move |req: &Request, response: Response| {
            let _ = uri_tx.send(req.uri().to_string());
            Ok(response)
        };
        let mut ws = accept_hdr_async(tcp, callback).await.unwrap();
        ws.send(Message::Text(r#"{"type":"hello","sid":"s","ttl":10,"count":3}"#.into()))
            .await
            .unwrap();
        let first = ws.next().await.unwrap().unwrap();
        assert_eq!(first.into_text().unwrap().as_str(), r#"{"type":"hb"}"#);
        ws.send(Message::Text(r#"{"type":"sync","count":42}"#.into())).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let config = PresenceConfig {
        gateway_origin: Some(format!("http://{addr}")),
        ..Default::default()
    };
    let resolver = OriginResolver::new(config.gateway_origin.clone(), config.page_origin_url());
    let service = PresenceService::new(ServiceParts {
        config,
        identity: SessionIdentity::from_parts("profile-1", "tab-a"),
        resolver,
        connector: Arc::new(WsConnector),
        fetcher: Arc::new(NoFetch),
        bus: LocalBus::new(),
        debug: false,
    });

    let mut handle = service.acquire("/blog/post-1");
    let uri = timeout(WAIT, uri_rx).await.unwrap().unwrap();
    assert_eq!(uri, "/v1/ws?room=%2Fblog%2Fpost-1&socket_session_id=profile-1");

    timeout(WAIT, async {
        while handle.count() != 42 {
            assert!(handle.changed().await, "room actor exited early");
        }
    })
    .await
    .expect("count should reach 42");
    assert!(handle.is_leader());
    assert!(handle.connected());
    assert_eq!(handle.error(), None);

    drop(handle);
    assert!(service.rooms().is_empty());
    timeout(WAIT, server).await.unwrap().unwrap();
}

#[test]
fn origin_override_survives_across_visits() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("state.toml");

    let first_visit = FileStore::new(&path);
    let page = Url::parse("https://site.test/post?gatewayOrigin=https://gw.staging.test").unwrap();
    assert_eq!(
        origin_override(Some(&page), &first_visit).as_deref(),
        Some("https://gw.staging.test")
    );

    let later_visit = FileStore::new(&path);
    assert_eq!(
        later_visit.get(ORIGIN_OVERRIDE_KEY).unwrap().as_deref(),
        Some("https://gw.staging.test")
    );
    assert_eq!(origin_override(None, &later_visit).as_deref(), Some("https://gw.staging.test"));
}
