#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pusher_connector::testing::{MockAuthClient, MockServer, MockSocket, MockTransport};
use pusher_connector::{AuthClient, BackoffConfig, Client, ClientConfig, ConnectionState};

pub fn test_config() -> ClientConfig {
    ClientConfig::new("app-key")
        .cluster("localhost:6001")
        .error_reconnect_delay(Duration::from_millis(300))
        .backoff(fast_backoff(60_000))
}

pub fn fast_backoff(give_up_after_ms: u64) -> BackoffConfig {
    BackoffConfig {
        initial_delay_ms: 20,
        max_delay_ms: 20,
        multiplier: 2.0,
        jitter_factor: 0.0,
        give_up_after_ms,
    }
}

/// (kind, message) of every error the client reported
pub type ErrorLog = Arc<Mutex<Vec<(String, String)>>>;

pub struct Harness {
    pub client: Client,
    pub server: MockServer,
    pub errors: ErrorLog,
}

impl Harness {
    pub fn error_kinds(&self) -> Vec<String> {
        self.errors
            .lock()
            .unwrap()
            .iter()
            .map(|(kind, _)| kind.clone())
            .collect()
    }

    /// Accept the first socket and complete the handshake
    pub async fn connected(&mut self, socket_id: &str) -> MockSocket {
        let socket = self.server.accept().await.expect("client should open a socket");
        assert!(socket.establish(socket_id));
        wait_for_state(&self.client, ConnectionState::Connected).await;
        socket
    }
}

pub fn start(auth: Option<Arc<MockAuthClient>>) -> Harness {
    start_with(test_config(), auth, |_| {})
}

pub fn start_with(
    config: ClientConfig,
    auth: Option<Arc<MockAuthClient>>,
    before_build: impl FnOnce(&MockServer),
) -> Harness {
    let (transport, server) = MockTransport::channel_pair();
    before_build(&server);

    let errors: ErrorLog = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();

    let mut builder = Client::builder(config)
        .transport(transport)
        .on_error(move |e| {
            sink.lock()
                .unwrap()
                .push((e.kind().to_string(), e.to_string()));
        });
    if let Some(auth) = auth {
        let auth: Arc<dyn AuthClient> = auth;
        builder = builder.auth_client_arc(auth);
    }

    Harness {
        client: builder.build(),
        server,
        errors,
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub async fn wait_for_state(client: &Client, state: ConnectionState) {
    if !wait_until(|| client.state() == state).await {
        panic!(
            "timed out waiting for {:?}, still {:?}",
            state,
            client.state()
        );
    }
}
