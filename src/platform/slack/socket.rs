// ABOUTME: RTM websocket transport implementing the core StreamTransport over tokio-tungstenite
// ABOUTME: One reader task and one writer task per stream, frames forwarded to the host channel

use crate::host::{HostEvent, HostSender};
use futures_util::{SinkExt, StreamExt};
use slackline_core::{DeferredResult, StreamHandle, StreamTransport, SyncError};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    reader: AbortHandle,
}

type Connections = Rc<RefCell<HashMap<StreamHandle, Connection>>>;

/// Websocket streams for one workspace.
pub struct SocketTransport {
    workspace: String,
    events: HostSender,
    next_handle: Cell<u64>,
    connections: Connections,
}

impl SocketTransport {
    pub fn new(workspace: &str, events: HostSender) -> Self {
        Self {
            workspace: workspace.to_string(),
            events,
            next_handle: Cell::new(1),
            connections: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    pub fn open_streams(&self) -> usize {
        self.connections.borrow().len()
    }

    fn allocate(&self) -> StreamHandle {
        let handle = StreamHandle(self.next_handle.get());
        self.next_handle.set(handle.0 + 1);
        handle
    }
}

impl StreamTransport for SocketTransport {
    fn open(&self, url: &str) -> DeferredResult<StreamHandle> {
        let request = DeferredResult::new();
        let handle = self.allocate();
        let url = url.to_string();
        let workspace = self.workspace.clone();
        let events = self.events.clone();
        let connections = Rc::clone(&self.connections);
        let completion = request.clone();

        tokio::task::spawn_local(async move {
            tracing::info!(workspace = %workspace, stream = %handle, "Opening websocket");
            let outcome = match connect_async(url.as_str()).await {
                Ok((ws_stream, _)) => {
                    let (mut write, mut read) = ws_stream.split();
                    let (outbound, mut queue) = mpsc::unbounded_channel::<Message>();

                    tokio::task::spawn_local(async move {
                        while let Some(message) = queue.recv().await {
                            let closing = matches!(message, Message::Close(_));
                            if let Err(e) = write.send(message).await {
                                tracing::debug!(error = %e, "Websocket write failed");
                                break;
                            }
                            if closing {
                                break;
                            }
                        }
                    });

                    let reader_events = events.clone();
                    let reader_workspace = workspace.clone();
                    let reader = tokio::task::spawn_local(async move {
                        while let Some(frame) = read.next().await {
                            match frame {
                                Ok(Message::Text(text)) => {
                                    let event = HostEvent::Frame {
                                        workspace: reader_workspace.clone(),
                                        stream: handle,
                                        text: text.to_string(),
                                    };
                                    if reader_events.send(event).is_err() {
                                        return;
                                    }
                                }
                                Ok(Message::Close(_)) => {
                                    tracing::info!(workspace = %reader_workspace, stream = %handle, "Websocket closed by server");
                                    break;
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    tracing::warn!(workspace = %reader_workspace, stream = %handle, error = %e, "Websocket error");
                                    break;
                                }
                            }
                        }
                        let _ = reader_events.send(HostEvent::StreamClosed {
                            workspace: reader_workspace,
                            stream: handle,
                        });
                    });

                    connections.borrow_mut().insert(
                        handle,
                        Connection {
                            outbound,
                            reader: reader.abort_handle(),
                        },
                    );
                    Ok(handle)
                }
                Err(e) => Err(SyncError::Http {
                    url: url.clone(),
                    status: None,
                    return_code: None,
                    error: e.to_string(),
                }),
            };
            let _ = events.send(HostEvent::StreamOpened {
                workspace,
                request: completion,
                outcome,
            });
        });
        request
    }

    fn send(&self, handle: StreamHandle, payload: &str) -> slackline_core::Result<()> {
        let connections = self.connections.borrow();
        let connection = connections.get(&handle).ok_or_else(|| SyncError::Workspace {
            workspace: self.workspace.clone(),
            error: format!("{handle} is not open"),
        })?;
        connection
            .outbound
            .send(Message::Text(payload.into()))
            .map_err(|_| SyncError::Workspace {
                workspace: self.workspace.clone(),
                error: format!("writer for {handle} has stopped"),
            })
    }

    fn close(&self, handle: StreamHandle) {
        if let Some(connection) = self.connections.borrow_mut().remove(&handle) {
            tracing::debug!(workspace = %self.workspace, stream = %handle, "Closing websocket");
            connection.reader.abort();
            let _ = connection.outbound.send(Message::Close(None));
        }
    }
}
