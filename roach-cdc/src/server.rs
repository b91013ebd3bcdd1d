use std::net::TcpListener;
use std::sync::Arc;

use actix_web::{dev::Server, dev::ServerHandle, web, App, HttpServer};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_actix_web::TracingLogger;

use crate::dispatcher::ChangeFeedDispatcher;
use crate::webhook::{configure, WebhookState};

pub const DEFAULT_WEBHOOK_PORT: u16 = 8090;
pub const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Port 0 binds an ephemeral port, see [`WebhookServer::port`].
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest accepted delivery body.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_WEBHOOK_PORT
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

impl Default for WebhookConfig {
    fn default() -> Self {
        WebhookConfig {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// The HTTP server the change feeds deliver to.
pub struct WebhookServer {
    port: u16,
    server: Server,
    shutdown: CancellationToken,
}

impl WebhookServer {
    /// Binds the listener and prepares the server. Nothing is served before
    /// [`WebhookServer::run_until_stopped`] is polled.
    pub fn build(
        config: &WebhookConfig,
        dispatcher: Arc<ChangeFeedDispatcher>,
    ) -> anyhow::Result<WebhookServer> {
        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address)?;
        let port = listener.local_addr()?.port();
        let shutdown = CancellationToken::new();

        let state = web::Data::new(WebhookState::new(dispatcher, shutdown.clone()));
        let max_body_bytes = config.max_body_bytes;
        let server = HttpServer::new(move || {
            App::new()
                .wrap(TracingLogger::default())
                .app_data(state.clone())
                .app_data(web::PayloadConfig::new(max_body_bytes))
                .configure(configure)
        })
        .listen(listener)?
        .run();

        info!(host = %config.host, port, "Webhook server listening");
        Ok(WebhookServer {
            port,
            server,
            shutdown,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn handle(&self) -> WebhookServerHandle {
        WebhookServerHandle {
            server: self.server.handle(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Runs the server until it is stopped through a [`WebhookServerHandle`].
    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> {
        self.server.await
    }
}

/// Stops a running [`WebhookServer`].
#[derive(Clone)]
pub struct WebhookServerHandle {
    server: ServerHandle,
    shutdown: CancellationToken,
}

impl WebhookServerHandle {
    /// Releases deliveries blocked on full buffers, then stops the server.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.server.stop(true).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utilities::new_dispatcher;

    #[test]
    fn test_config_defaults() {
        let config: WebhookConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, WebhookConfig::default());
        assert_eq!(config.port, 8090);
        assert_eq!(config.max_body_bytes, 8 * 1024 * 1024);
    }

    #[actix_web::test]
    async fn test_build_and_stop() {
        let config = WebhookConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        };
        let server = WebhookServer::build(&config, Arc::new(new_dispatcher(10))).unwrap();
        assert_ne!(server.port(), 0);

        let handle = server.handle();
        let running = actix_web::rt::spawn(server.run_until_stopped());
        handle.stop().await;
        running.await.unwrap().unwrap();
    }
}
