use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use skiffdb_core::error::{Error, NetworkError, Result};

use crate::blip::{IncomingRequest, Message, Response, Transport};

/// An in-process pair of connected transports, used by tests and by
/// database-to-database replication inside one process. Bounded channels
/// model the outbound window: `send` suspends when the peer isn't keeping
/// up.
pub struct LoopbackTransport {
    name: &'static str,
    tx: mpsc::Sender<IncomingRequest>,
    rx: Mutex<mpsc::Receiver<IncomingRequest>>,
    next_number: AtomicU64,
    closed: CancellationToken,
}

/// Creates a connected transport pair with the given outbound window.
pub fn loopback_pair(window: usize) -> (Arc<LoopbackTransport>, Arc<LoopbackTransport>) {
    let (tx_a, rx_b) = mpsc::channel(window);
    let (tx_b, rx_a) = mpsc::channel(window);
    let closed = CancellationToken::new();
    let a = Arc::new(LoopbackTransport {
        name: "active",
        tx: tx_a,
        rx: Mutex::new(rx_a),
        next_number: AtomicU64::new(1),
        closed: closed.clone(),
    });
    let b = Arc::new(LoopbackTransport {
        name: "passive",
        tx: tx_b,
        rx: Mutex::new(rx_b),
        next_number: AtomicU64::new(1),
        closed,
    });
    (a, b)
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, mut message: Message) -> Result<Response> {
        if self.closed.is_cancelled() {
            return Err(Error::Network {
                code: NetworkError::ConnectionReset,
                message: "connection closed".into(),
            });
        }
        message.number = self.next_number.fetch_add(1, Ordering::Relaxed);
        let no_reply = message.no_reply;
        let (responder, reply) = if no_reply {
            (None, None)
        } else {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        };
        let request = IncomingRequest::new(message, responder);
        tokio::select! {
            sent = self.tx.send(request) => {
                sent.map_err(|_| Error::Network {
                    code: NetworkError::ConnectionReset,
                    message: "peer went away".into(),
                })?;
            }
            _ = self.closed.cancelled() => {
                return Err(Error::Network {
                    code: NetworkError::ConnectionReset,
                    message: "connection closed".into(),
                });
            }
        }
        match reply {
            None => Ok(Response::ok()),
            Some(rx) => tokio::select! {
                response = rx => response.map_err(|_| Error::Network {
                    code: NetworkError::ConnectionReset,
                    message: "peer dropped the request".into(),
                }),
                _ = self.closed.cancelled() => Err(Error::Network {
                    code: NetworkError::ConnectionReset,
                    message: "connection closed".into(),
                }),
            },
        }
    }

    async fn receive(&self) -> Option<IncomingRequest> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            request = rx.recv() => request,
            _ = self.closed.cancelled() => None,
        }
    }

    async fn close(&self, code: u16, reason: &str) {
        debug!(side = self.name, code, reason, "closing loopback transport");
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blip::profile;

    #[tokio::test]
    async fn request_reply_round_trip() {
        let (active, passive) = loopback_pair(8);

        let server = tokio::spawn(async move {
            let request = passive.receive().await.unwrap();
            assert_eq!(request.message.profile(), Some(profile::GET_CHECKPOINT));
            assert_eq!(request.message.number, 1);
            request.respond(Response::ok().with_property("rev", "1"));
        });

        let response = active
            .send(Message::new(profile::GET_CHECKPOINT))
            .await
            .unwrap();
        assert_eq!(response.property("rev"), Some("1"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn no_reply_resolves_immediately() {
        let (active, passive) = loopback_pair(8);
        let response = active
            .send(Message::new(profile::NOREV).with_no_reply())
            .await
            .unwrap();
        assert!(!response.is_error());
        let incoming = passive.receive().await.unwrap();
        // Responding to a no-reply request is a harmless no-op.
        incoming.respond_ok();
    }

    #[tokio::test]
    async fn message_numbers_are_monotonic_per_sender() {
        let (active, passive) = loopback_pair(8);
        for _ in 0..3 {
            active
                .send(Message::new(profile::NOREV).with_no_reply())
                .await
                .unwrap();
        }
        let numbers: Vec<u64> = [
            passive.receive().await.unwrap().message.number,
            passive.receive().await.unwrap().message.number,
            passive.receive().await.unwrap().message.number,
        ]
        .into();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn close_unblocks_everyone() {
        let (active, passive) = loopback_pair(1);
        active.close(1000, "bye").await;
        assert!(active.is_closed());
        assert!(passive.is_closed());
        assert!(passive.receive().await.is_none());
        assert!(active.send(Message::new(profile::REV)).await.is_err());
    }

    #[tokio::test]
    async fn dropped_request_is_an_error() {
        let (active, passive) = loopback_pair(8);
        let client = tokio::spawn(async move {
            active.send(Message::new(profile::GET_ATTACHMENT)).await
        });
        let request = passive.receive().await.unwrap();
        drop(request); // never responded
        let result = client.await.unwrap();
        assert!(result.is_err());
    }
}
