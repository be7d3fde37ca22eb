//! In-process transport for driving the controller from tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Poll;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tokio::sync::mpsc;

use super::{ChatTransport, TokenChunk, TokenStream};
use crate::errors::TransportError;
use crate::models::Message;

pub(crate) type Feed = mpsc::UnboundedSender<Result<TokenChunk, TransportError>>;

enum Script {
    Reply(Vec<Result<TokenChunk, TransportError>>),
    Refuse(TransportError),
    Fed(mpsc::UnboundedReceiver<Result<TokenChunk, TransportError>>),
    Explode(Vec<String>),
}

/// Set when the stream it belongs to is dropped, standing in for the socket.
struct Connection(Arc<AtomicBool>);

impl Drop for Connection {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Answers each `stream` call with the next queued script.
pub(crate) struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<Vec<Message>>>,
    closed: Mutex<Vec<Arc<AtomicBool>>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
        })
    }

    /// Queues a reply made of `deltas` followed by an empty final chunk.
    pub(crate) fn reply(&self, deltas: &[&str]) {
        let mut items: Vec<_> = deltas.iter().map(|d| Ok(TokenChunk::delta(*d))).collect();
        items.push(Ok(TokenChunk::last("", None)));
        self.push(Script::Reply(items));
    }

    pub(crate) fn reply_with(&self, items: Vec<Result<TokenChunk, TransportError>>) {
        self.push(Script::Reply(items));
    }

    pub(crate) fn refuse(&self, err: TransportError) {
        self.push(Script::Refuse(err));
    }

    /// Queues a reply that yields `deltas`, then panics while being polled.
    pub(crate) fn explode(&self, deltas: &[&str]) {
        self.push(Script::Explode(deltas.iter().map(|d| d.to_string()).collect()));
    }

    /// Queues a reply whose chunks the test sends one by one.
    pub(crate) fn feed(&self) -> Feed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push(Script::Fed(rx));
        tx
    }

    pub(crate) fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }

    /// Whether the connection opened by the `index`th call has been released.
    pub(crate) fn closed(&self, index: usize) -> bool {
        self.closed.lock().unwrap()[index].load(Ordering::SeqCst)
    }

    fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, history: &[Message]) -> Result<TokenStream, TransportError> {
        self.requests.lock().unwrap().push(history.to_vec());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("no scripted reply queued");

        let flag = Arc::new(AtomicBool::new(false));
        self.closed.lock().unwrap().push(Arc::clone(&flag));
        let connection = Connection(flag);

        let (tx, rx) = match script {
            Script::Refuse(err) => return Err(err),
            Script::Explode(deltas) => {
                let head = stream::iter(deltas.into_iter().map(|d| Ok(TokenChunk::delta(d))));
                let tail = stream::poll_fn(move |_| -> Poll<Option<Result<TokenChunk, TransportError>>> {
                    let _connection = &connection;
                    panic!("scripted transport blew up")
                });
                return Ok(head.chain(tail).boxed());
            }
            Script::Fed(rx) => (None, rx),
            Script::Reply(items) => {
                let (tx, rx) = mpsc::unbounded_channel();
                for item in items {
                    let _ = tx.send(item);
                }
                (Some(tx), rx)
            }
        };
        // Scripted replies stay open after their last item, like a server that has
        // not hung up yet; only the consumer decides when the stream is dropped.
        Ok(stream::unfold((rx, tx, connection), |(mut rx, tx, connection)| async move {
            rx.recv().await.map(|item| (item, (rx, tx, connection)))
        })
        .boxed())
    }
}
