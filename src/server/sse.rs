use super::BoxBody;
use bytes::Bytes;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use tokio::sync::mpsc;

/// Sender half of a Server-Sent-Events response body.
#[derive(Clone)]
pub struct SseSender {
    tx: mpsc::Sender<Bytes>,
}

impl SseSender {
    /// Emit one `event:`/`data:` frame. A closed client is not an error;
    /// the producer just stops being heard.
    pub async fn send(&self, event: &str, data: &serde_json::Value) {
        let frame = format!("event: {}\ndata: {}\n\n", event, data);
        let _ = self.tx.send(Bytes::from(frame)).await;
    }
}

/// Build a channel-backed streaming body. Frames written to the sender are
/// flushed to the client as they arrive; dropping the sender ends the
/// stream.
pub fn sse_channel(capacity: usize) -> (SseSender, BoxBody) {
    let (tx, rx) = mpsc::channel::<Bytes>(capacity.max(1));
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<_, hyper::Error>(Frame::data(chunk)), rx))
    });
    (SseSender { tx }, BodyExt::boxed(StreamBody::new(stream)))
}
