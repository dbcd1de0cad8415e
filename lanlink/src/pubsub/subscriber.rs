use std::net::SocketAddr;
use std::sync::Arc;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use super::codec::{handshake, Frame, FrameCodec};
use super::topics::Subscriptions;
use super::Link;
use crate::config::PubSubOptions;

/// One attempt plus `connect_retries` more, each bounded by the connect timeout
async fn connect(endpoint: SocketAddr, options: &PubSubOptions) -> Result<TcpStream, String> {
    if endpoint.port() == 0 {
        return Err(format!("cannot connect to {}: port 0", endpoint));
    }

    let attempts = options.connect_retries.saturating_add(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match tokio::time::timeout(options.connect_timeout(), TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("timed out after {:?}", options.connect_timeout()),
        }

        tracing::debug!("Connect attempt {}/{} to {} failed: {}", attempt, attempts, endpoint, last_error);
        if attempt < attempts {
            tokio::time::sleep(options.retry_delay()).await;
        }
    }

    Err(format!("failed to connect to {} after {} attempts: {}", endpoint, attempts, last_error))
}

/// Connect to a publisher, then forward subscription changes to it and
/// dispatch its messages until cancelled or the connection drops
pub(crate) async fn run(
    endpoint: SocketAddr,
    options: PubSubOptions,
    subscriptions: Arc<Subscriptions>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    link: Arc<Link>,
    cancel: CancellationToken,
) {
    let stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        result = connect(endpoint, &options) => match result {
            Ok(stream) => stream,
            Err(reason) => {
                link.fail(reason);
                return;
            }
        },
    };

    let mut framed = Framed::new(stream, FrameCodec::new());
    let greeted = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        result = handshake(&mut framed, options.connect_timeout()) => result,
    };
    if let Err(reason) = greeted {
        link.fail(format!("{}: {}", endpoint, reason));
        return;
    }

    if !link.connected() {
        return;
    }
    tracing::info!("Subscribed to publisher at {}", endpoint);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            frame = framed.next() => {
                match frame {
                    Some(Ok(Frame::Message { topic, payload })) => {
                        let handled = subscriptions.dispatch(&topic, &payload);
                        tracing::trace!("Message on {} went to {} handlers", topic, handled);
                    }
                    Some(Ok(other)) => {
                        tracing::debug!("Ignoring {:?} from {}", other, endpoint);
                    }
                    Some(Err(e)) => {
                        link.fail(format!("bad frame from {}: {}", endpoint, e));
                        break;
                    }
                    None => {
                        link.fail(format!("{} closed the connection", endpoint));
                        break;
                    }
                }
            }

            Some(frame) = outbound.recv() => {
                if let Err(e) = framed.send(frame).await {
                    link.fail(format!("failed to write to {}: {}", endpoint, e));
                    break;
                }
            }
        }
    }

    tracing::debug!("Subscriber for {} stopped", endpoint);
}
