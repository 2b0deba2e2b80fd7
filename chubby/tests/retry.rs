use chubby::{
    client::ClientSession,
    config::{ClientConfig, LeaseConfig},
    message, ClientId, LockMode, LockPath,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn read_request(socket: &mut TcpStream) -> Option<String> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = socket.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        data.extend_from_slice(&buf[..n]);

        let text = String::from_utf8_lossy(&data);
        let Some(head_end) = text.find("\r\n\r\n") else {
            continue;
        };
        let content_length = text[..head_end]
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if data.len() >= head_end + 4 + content_length {
            return text.lines().next().map(str::to_string);
        }
    }
}

async fn respond(socket: &mut TcpStream, body: &str) {
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

// A master that drops the connection on the first TryAcquireLock after
// reading it, and grants every later one. KeepAlives are left parked.
async fn flaky_master(attempts: Arc<AtomicUsize>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let own_addr = addr.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let attempts = Arc::clone(&attempts);
            let own_addr = own_addr.clone();
            tokio::spawn(async move {
                let Some(request_line) = read_request(&mut socket).await else {
                    return;
                };
                if request_line.contains(message::INIT_SESSION) {
                    let body = format!(r#"{{"Ok":{{"leader_address":"{own_addr}"}}}}"#);
                    respond(&mut socket, &body).await;
                } else if request_line.contains(message::TRY_ACQUIRE_LOCK) {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        drop(socket);
                        return;
                    }
                    respond(&mut socket, r#"{"Ok":{"is_successful":true}}"#).await;
                } else if request_line.contains(message::KEEP_ALIVE) {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_call_retried_after_connection_drops_mid_reply() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let addr = flaky_master(Arc::clone(&attempts)).await;
    let config = ClientConfig::new(ClientId::new("a"))
        .with_servers([addr])
        .with_lease(LeaseConfig::default());
    let client = ClientSession::init(config).await.unwrap();

    let l = LockPath::new("L");
    let acquired = tokio::time::timeout(
        Duration::from_secs(5),
        client.try_acquire_lock(&l, LockMode::Exclusive),
    )
    .await
    .expect("call never completed")
    .unwrap();

    assert!(acquired);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(client.held_locks().get(&l), Some(&LockMode::Exclusive));
    assert!(!client.is_expired());
}
