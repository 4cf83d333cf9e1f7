//! The foreground surface that owns document text.
//!
//! Background work never touches a document directly. It schedules short
//! edits that the host applies one after another on its own thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use rustc_hash::FxHashMap;

use crate::document::{DocumentId, DocumentLines};
use crate::error::{Error, Result};

/// A deferred mutation of one document.
pub type Edit = Box<dyn FnOnce(&mut DocumentLines) + Send>;

/// Owner of document text that accepts fire-and-forget edits.
pub trait DocumentHost: Send + Sync {
    /// Queue `edit` to run on the foreground. Edits for one document apply
    /// in the order they were scheduled; edits for unknown documents are
    /// dropped.
    fn schedule(&self, document: &DocumentId, edit: Edit);
}

type Documents = FxHashMap<DocumentId, DocumentLines>;

enum Message {
    Edit(DocumentId, Edit),
    Call(Box<dyn FnOnce(&mut Documents) + Send>),
    Stop,
}

/// In-memory document host with its own foreground thread.
///
/// The synchronous methods block until the foreground thread has handled
/// the request, so they must not be called from inside an edit.
pub struct ForegroundHost {
    sender: Mutex<Sender<Message>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ForegroundHost {
    /// Start the foreground thread.
    pub fn new() -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Message>();
        let thread = thread::Builder::new()
            .name("magma-foreground".to_string())
            .spawn(move || {
                let mut documents = Documents::default();
                for message in receiver {
                    match message {
                        Message::Edit(id, edit) => match documents.get_mut(&id) {
                            Some(lines) => {
                                if panic::catch_unwind(AssertUnwindSafe(|| edit(lines))).is_err() {
                                    tracing::error!("Edit of {} panicked", id);
                                }
                            }
                            None => tracing::debug!("Dropping edit for unknown document {}", id),
                        },
                        Message::Call(call) => {
                            if panic::catch_unwind(AssertUnwindSafe(|| call(&mut documents))).is_err()
                            {
                                tracing::error!("Foreground call panicked");
                            }
                        }
                        Message::Stop => break,
                    }
                }
            })?;
        Ok(Self {
            sender: Mutex::new(sender),
            thread: Mutex::new(Some(thread)),
        })
    }

    fn send(&self, message: Message) -> Result<()> {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .send(message)
            .map_err(|_| Error::ShutDown)
    }

    fn call<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut Documents) -> R + Send + 'static,
    ) -> Result<R> {
        let (tx, rx) = mpsc::channel();
        self.send(Message::Call(Box::new(move |docs| {
            let _ = tx.send(f(docs));
        })))?;
        rx.recv().map_err(|_| Error::ShutDown)
    }

    /// Register a document, replacing any previous text.
    pub fn open(&self, id: DocumentId, lines: DocumentLines) -> Result<()> {
        self.call(move |docs| {
            docs.insert(id, lines);
        })
    }

    /// Forget a document and return its final text.
    pub fn close(&self, id: &DocumentId) -> Result<DocumentLines> {
        let key = id.clone();
        self.call(move |docs| docs.remove(&key))?
            .ok_or_else(|| Error::DocumentNotFound(id.to_string()))
    }

    /// Current text of a document.
    pub fn text(&self, id: &DocumentId) -> Result<String> {
        self.with_document(id, |lines| lines.to_text())
    }

    /// Current lines of a document.
    pub fn lines(&self, id: &DocumentId) -> Result<DocumentLines> {
        self.with_document(id, |lines| lines.clone())
    }

    /// Run `f` against a document on the foreground thread and return its
    /// result.
    pub fn with_document<R: Send + 'static>(
        &self,
        id: &DocumentId,
        f: impl FnOnce(&mut DocumentLines) -> R + Send + 'static,
    ) -> Result<R> {
        let key = id.clone();
        self.call(move |docs| docs.get_mut(&key).map(f))?
            .ok_or_else(|| Error::DocumentNotFound(id.to_string()))
    }

    /// Wait until every edit scheduled so far has been applied.
    pub fn flush(&self) -> Result<()> {
        self.call(|_| ())
    }

    /// Stop the foreground thread. Later requests fail with `ShutDown`.
    pub fn stop(&self) {
        let _ = self.send(Message::Stop);
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            tracing::error!("Foreground thread panicked");
        }
    }
}

impl DocumentHost for ForegroundHost {
    fn schedule(&self, document: &DocumentId, edit: Edit) {
        if self.send(Message::Edit(document.clone(), edit)).is_err() {
            tracing::debug!("Foreground host stopped; dropping edit for {}", document);
        }
    }
}

impl Drop for ForegroundHost {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edits_apply_in_order() {
        let host = ForegroundHost::new().unwrap();
        let id = DocumentId::new("doc");
        host.open(id.clone(), DocumentLines::from_text("a\n")).unwrap();

        host.schedule(&id, Box::new(|lines| lines.push("b".to_string())));
        host.schedule(&id, Box::new(|lines| lines.push("c".to_string())));
        host.flush().unwrap();

        assert_eq!(host.text(&id).unwrap(), "a\nb\nc\n");
    }

    #[test]
    fn test_unknown_document() {
        let host = ForegroundHost::new().unwrap();
        let id = DocumentId::new("missing");
        host.schedule(&id, Box::new(|lines| lines.push("x".to_string())));
        host.flush().unwrap();

        assert!(matches!(host.text(&id), Err(Error::DocumentNotFound(_))));
    }

    #[test]
    fn test_panicking_edit_keeps_host_alive() {
        let host = ForegroundHost::new().unwrap();
        let id = DocumentId::new("doc");
        host.open(id.clone(), DocumentLines::default()).unwrap();

        host.schedule(&id, Box::new(|_| panic!("bad edit")));
        host.schedule(&id, Box::new(|lines| lines.push("ok".to_string())));

        assert_eq!(host.text(&id).unwrap(), "ok\n");
    }

    #[test]
    fn test_stopped_host_rejects_requests() {
        let host = ForegroundHost::new().unwrap();
        host.stop();
        assert!(matches!(host.flush(), Err(Error::ShutDown)));
    }
}
