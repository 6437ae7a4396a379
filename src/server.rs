//! Relay server listener
//!
//! Owns the TCP listener and the shared dispatcher. Each accepted
//! connection gets its own handler task.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::handler::handle_connection;
use crate::persist::PersistenceQueue;
use crate::store::AccountStore;

/// The line relay server
pub struct ChatServer<A> {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher<A>>,
    config: Arc<ServerConfig>,
}

impl<A: AccountStore> ChatServer<A> {
    /// Bind the listener on `config.bind_addr`
    pub async fn bind(
        config: ServerConfig,
        accounts: Arc<A>,
        persistence: PersistenceQueue,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let dispatcher = Arc::new(Dispatcher::new(
            accounts,
            persistence,
            config.echo_to_sender,
        ));
        Ok(Self {
            listener,
            dispatcher,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher<A>> {
        self.dispatcher.clone()
    }

    /// Accept connections forever
    ///
    /// A failed accept is logged and the loop continues.
    pub async fn run(self) {
        info!("Relay server listening on {}", self.config.bind_addr);

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    info!("New connection from {}", addr);
                    let dispatcher = self.dispatcher.clone();
                    let config = self.config.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, dispatcher, config).await {
                            error!("Connection handler error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}
