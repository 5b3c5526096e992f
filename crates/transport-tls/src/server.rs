use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept connections until `stop` fires, running `handler` for each one on
/// its own task with at most `workers` handlers alive at once.
///
/// Handlers get a child token and are expected to return once it is
/// cancelled; this function only returns after every handler has finished.
pub async fn serve_connections<H, Fut>(
    listener: TcpListener,
    stop: CancellationToken,
    workers: usize,
    handler: H,
) where
    H: Fn(TcpStream, SocketAddr, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks = JoinSet::new();

    loop {
        let permit = tokio::select! {
            _ = stop.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                let fut = handler(stream, peer_addr, stop.child_token());
                tasks.spawn(async move {
                    fut.await;
                    drop(permit);
                });
            }
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }

        // Reap finished handlers so the set does not grow without bound.
        while tasks.try_join_next().is_some() {}
    }

    while tasks.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{recv_msg, send_msg};

    #[tokio::test]
    async fn test_serves_until_stopped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = CancellationToken::new();

        let server = tokio::spawn(serve_connections(
            listener,
            stop.clone(),
            2,
            |mut stream: TcpStream, _peer, stop: CancellationToken| async move {
                loop {
                    let msg: String = tokio::select! {
                        _ = stop.cancelled() => return,
                        msg = recv_msg(&mut stream) => match msg {
                            Ok(msg) => msg,
                            Err(_) => return,
                        },
                    };
                    if send_msg(&mut stream, &msg.to_uppercase()).await.is_err() {
                        return;
                    }
                }
            },
        ));

        let mut client = TcpStream::connect(addr).await.unwrap();
        send_msg(&mut client, &"ping".to_string()).await.unwrap();
        let reply: String = recv_msg(&mut client).await.unwrap();
        assert_eq!(reply, "PING");

        // The open connection must not keep the server alive.
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("server did not stop")
            .unwrap();
    }
}
