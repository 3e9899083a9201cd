use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use singbox_manager::backend::catalog::DirectoryCatalog;
use singbox_manager::backend::controller::{Collaborators, ControllerOptions, SyncController};
use singbox_manager::backend::fetcher::{FetchError, FetchOptions, SubscriptionFetcher};
use singbox_manager::backend::mock_process::{MockProcessManager, ProcessCall};
use singbox_manager::backend::settings::MemorySettings;
use singbox_manager::backend::store::ConfigStore;
use singbox_manager::backend::types::{
    ActiveConfig, ProxyProcessState, SubscriptionUrl, SyncState,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Minimal HTTP/1.1 responder. Each path maps to a full raw response; any
/// other path gets a 404. Request heads are recorded for inspection.
struct TestServer {
    base: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    async fn start(routes: Vec<(&str, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let routes: Arc<HashMap<String, String>> = Arc::new(
            routes
                .into_iter()
                .map(|(path, response)| (path.to_string(), response))
                .collect(),
        );
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let routes = routes.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => head.extend_from_slice(&buf[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&head).to_string();
                    let path = head
                        .split_whitespace()
                        .nth(1)
                        .unwrap_or("/")
                        .to_string();
                    recorded.lock().unwrap().push(head);

                    let response = routes
                        .get(&path)
                        .cloned()
                        .unwrap_or_else(|| respond(404, "Not Found", "", ""));
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { base, requests }
    }

    fn url(&self, path: &str) -> SubscriptionUrl {
        SubscriptionUrl::parse(&format!("{}{}", self.base, path)).unwrap()
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

fn respond(status: u16, reason: &str, extra_headers: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n{}\r\n{}",
        status,
        reason,
        body.len(),
        extra_headers,
        body
    )
}

fn ok_json(body: &str) -> String {
    respond(200, "OK", "Content-Type: application/json\r\n", body)
}

fn fetcher() -> SubscriptionFetcher {
    SubscriptionFetcher::new(&FetchOptions::default()).unwrap()
}

mod subscription_fetcher {
    use super::*;

    #[tokio::test]
    async fn downloads_body_with_product_user_agent() {
        let server = TestServer::start(vec![("/config", ok_json(r#"{"inbounds":[]}"#))]).await;

        let body = fetcher().fetch_bytes(&server.url("/config")).await.unwrap();

        assert_eq!(body, br#"{"inbounds":[]}"#);
        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        let head = requests[0].to_ascii_lowercase();
        assert!(head.starts_with("get /config http/1.1"));
        assert!(head.contains("user-agent: singbox-manager/"));
    }

    #[tokio::test]
    async fn non_success_status_is_protocol_error() {
        let server = TestServer::start(vec![]).await;

        let result = fetcher().fetch_bytes(&server.url("/missing")).await;

        assert_eq!(result, Err(FetchError::Protocol { status: 404 }));
    }

    #[tokio::test]
    async fn server_error_is_protocol_error() {
        let server = TestServer::start(vec![(
            "/config",
            respond(503, "Service Unavailable", "", "busy"),
        )])
        .await;

        let result = fetcher().fetch_bytes(&server.url("/config")).await;

        assert_eq!(result, Err(FetchError::Protocol { status: 503 }));
    }

    #[tokio::test]
    async fn plain_http_redirect_is_followed() {
        let server = TestServer::start(vec![
            ("/old", respond(302, "Found", "Location: /new\r\n", "")),
            ("/new", ok_json(r#"{"outbounds":[]}"#)),
        ])
        .await;

        let body = fetcher().fetch_bytes(&server.url("/old")).await.unwrap();

        assert_eq!(body, br#"{"outbounds":[]}"#);
        assert_eq!(server.requests().len(), 2);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let server = TestServer::start(vec![("/big", ok_json(&"x".repeat(4096)))]).await;
        let fetcher = SubscriptionFetcher::new(&FetchOptions {
            max_body_bytes: 1024,
            ..FetchOptions::default()
        })
        .unwrap();

        let result = fetcher.fetch_bytes(&server.url("/big")).await;

        assert_eq!(result, Err(FetchError::BodyTooLarge { limit: 1024 }));
    }

    #[tokio::test]
    async fn refused_connection_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let url = SubscriptionUrl::parse(&format!("http://{}/config", address)).unwrap();
        let result = fetcher().fetch_bytes(&url).await;

        assert!(matches!(result, Err(FetchError::Transport { .. })));
    }

    #[tokio::test]
    async fn tls_words_in_url_do_not_make_a_tls_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let url =
            SubscriptionUrl::parse(&format!("http://{}/ssl/tls-certificate", address)).unwrap();
        let result = fetcher().fetch_bytes(&url).await;

        match result {
            Err(FetchError::Transport { message }) => assert!(message.contains("/ssl/")),
            other => panic!("expected a transport error, got {:?}", other),
        }
    }
}

mod sync_loop {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("singbox_sync_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn subscription_drives_process_end_to_end() {
        let server = TestServer::start(vec![
            ("/good", ok_json(r#"{"inbounds":[],"outbounds":[]}"#)),
            ("/bad", ok_json(r#"{"dns":{}}"#)),
        ])
        .await;
        let dir = temp_dir();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let process = MockProcessManager::new(events_tx);
        let probe = process.probe();
        let settings = MemorySettings::new();

        let (controller, handle, inbox) = SyncController::new(
            Collaborators {
                source: Arc::new(fetcher()),
                store: ConfigStore::new(&dir),
                settings: Box::new(settings.clone()),
                catalog: Box::new(DirectoryCatalog::open(&dir.join("configs")).unwrap()),
                process: Box::new(process),
                process_events: events_rx,
            },
            ControllerOptions {
                update_interval: Duration::from_secs(3600),
                watch_store: false,
            },
        );
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(controller.run(inbox, shutdown.clone()));

        // Nothing configured yet.
        assert!(handle.start_proxy().await.is_err());

        let accepted = handle.set_url(&format!("{}/good", server.base)).await.unwrap();
        assert!(accepted.insecure);
        assert_eq!(
            settings.persisted("subscription/url"),
            Some(format!("{}/good", server.base))
        );

        let status = handle
            .wait_for_status(|s| s.sync_state == SyncState::Idle && s.last_update.is_some())
            .await;
        assert!(status.message.starts_with("Config updated successfully."));
        let store_path = dir.join("subscription_config.json");
        assert_eq!(
            status.active,
            ActiveConfig::Subscription {
                path: store_path.clone()
            }
        );
        assert_eq!(
            std::fs::read(&store_path).unwrap(),
            br#"{"inbounds":[],"outbounds":[]}"#
        );

        handle.start_proxy().await.unwrap();
        let mut proxy_active = handle.proxy_active();
        proxy_active.wait_for(|active| *active).await.unwrap();

        // A rejected document leaves the stored one and the process alone.
        handle.set_url(&format!("{}/bad", server.base)).await.unwrap();
        let status = handle
            .wait_for_status(|s| s.last_error.is_some() && s.sync_state == SyncState::Idle)
            .await;
        assert!(status.message.contains("missing required sections"));
        assert_eq!(
            std::fs::read(&store_path).unwrap(),
            br#"{"inbounds":[],"outbounds":[]}"#
        );
        assert_eq!(probe.calls(), vec![ProcessCall::Start(store_path)]);

        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(probe.state(), ProxyProcessState::NotRunning);
        assert!(handle.update_now().await.is_err());

        std::fs::remove_dir_all(&dir).ok();
    }
}
