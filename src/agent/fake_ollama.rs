//! Minimal HTTP/1.1 server standing in for Ollama in tests.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

pub(crate) const HI: &str = r#"{"model":"orca-mini","message":{"role":"assistant","content":"Hi"},"done":false}"#;
pub(crate) const THERE: &str = r#"{"model":"orca-mini","message":{"role":"assistant","content":" there"},"done":false}"#;
pub(crate) const BANG: &str = r#"{"model":"orca-mini","message":{"role":"assistant","content":"!"},"done":false}"#;
pub(crate) const DONE: &str = r#"{"model":"orca-mini","message":{"role":"assistant","content":""},"done":true,"done_reason":"stop","prompt_eval_count":26,"eval_count":3}"#;

pub(crate) struct FakeOllama {
    pub(crate) port: u16,
    /// The raw request, head and body.
    pub(crate) request: oneshot::Receiver<String>,
    /// Fires once the client hangs up on an unfinished response.
    pub(crate) closed: oneshot::Receiver<()>,
}

async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let length = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Serves one request. With `finish` the connection is closed after the
/// body; otherwise it stays open until the client hangs up.
pub(crate) async fn fake_ollama(status: &'static str, lines: Vec<&'static str>, finish: bool) -> FakeOllama {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (request_tx, request) = oneshot::channel();
    let (closed_tx, closed) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let _ = request_tx.send(read_request(&mut socket).await);
        let head = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/x-ndjson\r\nconnection: close\r\n\r\n"
        );
        socket.write_all(head.as_bytes()).await.unwrap();
        for line in lines {
            socket.write_all(format!("{line}\n").as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
        }
        if finish {
            let _ = socket.shutdown().await;
            return;
        }
        let mut buf = [0u8; 64];
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = closed_tx.send(());
    });

    FakeOllama { port, request, closed }
}
