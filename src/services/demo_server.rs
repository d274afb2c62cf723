use crate::handlers::hello;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Keep-alive HTTP/1.1 server used as the probe target.
pub struct DemoServer {
    listener: TcpListener,
    delay: Duration,
}

pub struct DemoServerHandle {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DemoServer {
    pub async fn bind(addr: SocketAddr, delay: Duration) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, delay })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn spawn(self) -> io::Result<DemoServerHandle> {
        let addr = self.local_addr()?;
        let (shutdown, signal) = watch::channel(false);
        info!("Demo server listening on {}", addr);

        let task = tokio::spawn(serve(self.listener, self.delay, signal));
        Ok(DemoServerHandle {
            addr,
            shutdown,
            task,
        })
    }
}

impl DemoServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Stops accepting, closes open connections and waits for the accept loop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Demo server task ended abnormally: {}", e);
        }
        info!("Demo server on {} stopped", self.addr);
    }
}

async fn serve(listener: TcpListener, delay: Duration, mut signal: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    tokio::spawn(serve_connection(stream, delay, signal.clone()));
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
            _ = signal.changed() => break,
        }
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    delay: Duration,
    mut signal: watch::Receiver<bool>,
) {
    let service = service_fn(move |request| hello(request, delay));
    let connection = http1::Builder::new()
        .keep_alive(true)
        .serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            if let Err(e) = result {
                debug!("Connection closed with error: {}", e);
            }
        }
        _ = signal.changed() => {
            connection.as_mut().graceful_shutdown();
            if let Err(e) = connection.await {
                debug!("Connection closed during shutdown: {}", e);
            }
        }
    }
}
