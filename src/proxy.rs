//! Accept loop for the data plane
//!
//! Binds the listen endpoint with address reuse, injects the resolved
//! upstream endpoint into the session manager, then accepts forever.
//! Accept errors other than shutdown are logged and accepting continues.
//! Stopping the proxy only cancels the acceptor; existing sessions drain
//! on their own or through the manager's broadcast operations.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{lookup_host, TcpSocket};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ConfigManager;
use crate::manager::SessionManager;

pub struct ProxyServer {
    manager: Arc<SessionManager>,
    config: Arc<ConfigManager>,
    stop: watch::Sender<bool>,
}

impl ProxyServer {
    pub fn new(manager: Arc<SessionManager>, config: Arc<ConfigManager>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            manager,
            config,
            stop,
        }
    }

    /// Resolve endpoints, bind, and spawn the accept loop
    ///
    /// Returns the bound address (useful with port 0).
    pub async fn start(&self) -> Result<SocketAddr> {
        let cfg = self.config.server_config();

        let upstream = resolve(&cfg.upstream_host, cfg.upstream_port)
            .await
            .context("resolving upstream endpoint")?;
        self.manager.set_upstream(upstream);

        let listen = resolve(&cfg.listen_host, cfg.listen_port)
            .await
            .context("resolving listen endpoint")?;

        let socket = if listen.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("creating listen socket")?;
        socket.set_reuseaddr(true).context("setting SO_REUSEADDR")?;
        socket.bind(listen).with_context(|| format!("binding {listen}"))?;
        let listener = socket.listen(1024).context("listening")?;
        let local = listener.local_addr().context("reading bound address")?;

        info!(listen = %local, upstream = %upstream, "proxy_started");

        let manager = Arc::clone(&self.manager);
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.wait_for(|s| *s) => {
                        info!("acceptor_stopped");
                        return;
                    }
                    res = listener.accept() => match res {
                        Ok((stream, peer)) => {
                            debug!(%peer, "connection_accepted");
                            if manager.create_session(stream).is_none() {
                                warn!(%peer, "session_rejected");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "accept_error");
                        }
                    }
                }
            }
        });

        Ok(local)
    }

    /// Cancel the acceptor; existing sessions are untouched
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    lookup_host((host, port))
        .await
        .with_context(|| format!("resolving {host}:{port}"))?
        .next()
        .with_context(|| format!("{host}:{port} resolved to no addresses"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::AnomalyEngine;
    use crate::scheduler::Scheduler;
    use crate::types::ServerConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_accepts_and_proxies() {
        // upstream that echoes
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = upstream.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = s.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });

        let mut server_config = ServerConfig::default();
        server_config.listen_host = "127.0.0.1".to_string();
        server_config.listen_port = 0;
        server_config.upstream_host = "127.0.0.1".to_string();
        server_config.upstream_port = upstream_addr.port();

        let config = Arc::new(ConfigManager::new(server_config));
        let manager = SessionManager::new(AnomalyEngine::new(1), Arc::clone(&config), Scheduler::new());
        let proxy = ProxyServer::new(Arc::clone(&manager), config);

        let addr = proxy.start().await.unwrap();
        assert_eq!(manager.upstream(), Some(upstream_addr));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        proxy.stop();
        // new connections are no longer accepted once the acceptor exits
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        if let Ok(mut late) = TcpStream::connect(addr).await {
            let mut buf = [0u8; 1];
            // either refused outright or closed without service
            let _ = tokio::time::timeout(
                std::time::Duration::from_millis(100),
                late.read(&mut buf),
            )
            .await;
        }
    }
}
