//! The per-session output sink: buffers bytes for HTTP console snapshots and broadcasts each
//! write as an `output` event. Must be safe to call from the executor thread, so
//! everything here is a plain `Mutex` -- no `.await` on the write path.

use std::sync::{Arc, Mutex};

use arm2_core::swi::{OutputSink, OutputStream};

use crate::broadcaster::{BroadcasterHandle, Event, EventKind};

/// The two buffers backing `GET /console`. Shared between the sink (owned by the VM's SWI
/// bridge, written from the executor thread) and the `Service`, which reads snapshots for HTTP.
#[derive(Clone, Default)]
pub struct ConsoleBuffers {
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
}

impl ConsoleBuffers {
    pub fn snapshot(&self) -> (Vec<u8>, Vec<u8>) {
        (self.stdout.lock().unwrap().clone(), self.stderr.lock().unwrap().clone())
    }
}

pub struct SessionOutputSink {
    session_id: String,
    broadcaster: BroadcasterHandle,
    buffers: ConsoleBuffers,
}

impl SessionOutputSink {
    pub fn new(session_id: String, broadcaster: BroadcasterHandle, buffers: ConsoleBuffers) -> Self {
        Self { session_id, broadcaster, buffers }
    }
}

impl OutputSink for SessionOutputSink {
    fn write(&mut self, stream: OutputStream, data: &[u8]) {
        let (buffer, stream_name) = match stream {
            OutputStream::Stdout => (&self.buffers.stdout, "stdout"),
            OutputStream::Stderr => (&self.buffers.stderr, "stderr"),
        };
        buffer.lock().unwrap().extend_from_slice(data);
        let content = String::from_utf8_lossy(data).into_owned();
        self.broadcaster.broadcast(Event {
            kind: EventKind::Output,
            session_id: self.session_id.clone(),
            data: serde_json::json!({ "stream": stream_name, "content": content }),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster;

    #[tokio::test]
    async fn write_buffers_and_broadcasts() {
        let handle = broadcaster::spawn();
        let mut sub = handle.subscribe(String::new(), vec![EventKind::Output]).await;
        let buffers = ConsoleBuffers::default();
        let mut sink = SessionOutputSink::new("s1".to_string(), handle, buffers.clone());
        sink.write(OutputStream::Stdout, b"hello");
        let (stdout, stderr) = buffers.snapshot();
        assert_eq!(stdout, b"hello");
        assert!(stderr.is_empty());
        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.data["stream"], "stdout");
    }
}
