#![cfg(feature = "server")]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::response::Html;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use octo_sw::server::{SOURCE_HEADER, router};
use octo_sw::{HttpNetwork, MemoryCacheStorage, Registration, WorkerConfig};

struct Upstream {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Upstream {
    async fn start() -> Self {
        let app = Router::new()
            .route("/", get(|| async { Html("<html>home</html>") }))
            .route("/app.js", get(|| async { "console.log(1)" }))
            .route("/blog", get(|| async { Html("<html>blog</html>") }))
            .route("/form", post(|body: String| async move { format!("got {body}") }));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = stopped.await;
                })
                .await
                .unwrap();
        });
        Self { addr, stop, handle }
    }

    async fn shutdown(self) {
        let _ = self.stop.send(());
        self.handle.await.unwrap();
    }
}

async fn start_proxy(registration: Arc<Registration>, origin: url::Url) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(registration, origin, 1024 * 1024);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn source(response: &reqwest::Response) -> String {
    response.headers()[SOURCE_HEADER]
        .to_str()
        .unwrap()
        .to_string()
}

async fn json(client: &reqwest::Client, url: &str) -> serde_json::Value {
    let text = client.get(url).send().await.unwrap().text().await.unwrap();
    serde_json::from_str(&text).unwrap()
}

#[tokio::test]
async fn serves_site_offline_after_install() {
    let upstream = Upstream::start().await;
    let origin = url::Url::parse(&format!("http://{}", upstream.addr)).unwrap();

    // No pooled connections, so stopping the upstream takes effect at once.
    let upstream_client = reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap();
    let registration = Arc::new(Registration::new(
        Arc::new(MemoryCacheStorage::new()),
        Arc::new(HttpNetwork::new(upstream_client)),
    ));
    registration
        .register(
            WorkerConfig::new()
                .with_origin(origin.clone())
                .with_version("it-v1")
                .with_precache(["/", "/app.js"]),
        )
        .await
        .unwrap();

    let proxy = start_proxy(Arc::clone(&registration), origin).await;
    let client = reqwest::Client::builder().no_proxy().build().unwrap();

    let health = json(&client, &format!("{proxy}/__octo-sw/health")).await;
    assert_eq!(health["status"], "ok");

    let app = client.get(format!("{proxy}/app.js")).send().await.unwrap();
    assert_eq!(source(&app), "cache");
    assert_eq!(app.text().await.unwrap(), "console.log(1)");

    let blog = client
        .get(format!("{proxy}/blog"))
        .header("sec-fetch-mode", "navigate")
        .send()
        .await
        .unwrap();
    assert_eq!(source(&blog), "network");
    assert!(
        blog.headers()["set-cookie"]
            .to_str()
            .unwrap()
            .starts_with("octo-sw-client=")
    );

    let form = client
        .post(format!("{proxy}/form"))
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(source(&form), "network");
    assert_eq!(form.text().await.unwrap(), "got hello");

    registration.settle().await;
    upstream.shutdown().await;

    let blog = client.get(format!("{proxy}/blog")).send().await.unwrap();
    assert_eq!(blog.status(), 200);
    assert_eq!(source(&blog), "cache");
    assert_eq!(blog.text().await.unwrap(), "<html>blog</html>");

    let missing = client
        .get(format!("{proxy}/never-visited"))
        .header("accept", "text/html")
        .send()
        .await
        .unwrap();
    assert_eq!(source(&missing), "fallback");
    assert_eq!(missing.text().await.unwrap(), "<html>home</html>");

    let form = client
        .post(format!("{proxy}/form"))
        .body("again")
        .send()
        .await
        .unwrap();
    assert_ne!(source(&form), "cache");
    assert_ne!(form.text().await.unwrap(), "got hello");

    let status = json(&client, &format!("{proxy}/__octo-sw/status")).await;
    assert_eq!(status["active"], "it-v1");
    assert_eq!(status["state"], "activated");
    assert_eq!(status["caches"], serde_json::json!(["it-v1"]));
    // Two navigations: the explicit one and the HTML-accepting fallback.
    assert_eq!(status["clients"], 2);
}

#[tokio::test]
async fn passes_through_without_worker() {
    let upstream = Upstream::start().await;
    let origin = url::Url::parse(&format!("http://{}", upstream.addr)).unwrap();
    let registration = Arc::new(Registration::new(
        Arc::new(MemoryCacheStorage::new()),
        Arc::new(HttpNetwork::new(
            reqwest::Client::builder().no_proxy().build().unwrap(),
        )),
    ));

    let proxy = start_proxy(Arc::clone(&registration), origin).await;
    let client = reqwest::Client::builder().no_proxy().build().unwrap();

    let home = client.get(format!("{proxy}/")).send().await.unwrap();
    assert_eq!(source(&home), "network");
    assert_eq!(home.text().await.unwrap(), "<html>home</html>");
    assert!(registration.storage().keys().await.unwrap().is_empty());

    upstream.shutdown().await;
}
