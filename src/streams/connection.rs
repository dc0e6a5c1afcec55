//! Stream of connection state changes.

use super::session::StreamSession;
use crate::client::{ClientHandle, ConnectionListener};
use crate::error::{Result, ViewError};
use crate::types::ConnectionState;
use futures_util::stream::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

enum State {
    Active {
        /// State read at acquisition, yielded before any change.
        first: Option<ConnectionState>,
        receiver: mpsc::UnboundedReceiver<ConnectionState>,
        session: StreamSession,
    },
    /// Acquisition failed; the error is yielded once.
    Failed(Option<ViewError>),
    Done,
}

/// Stream of connection states: the current state first, then one item per
/// change. The client listener is removed when the stream is cancelled or
/// dropped.
///
/// The listener is registered before the current state is read, so no change
/// is lost. A change racing with acquisition may be seen again after the
/// first item.
pub struct ConnectionStateStream {
    state: State,
}

impl ConnectionStateStream {
    /// Subscribe now. A missing client yields a single `ClientUnavailable`;
    /// a client without connection monitoring yields nothing.
    pub(crate) fn acquire(client: &ClientHandle) -> Self {
        let client = match client.require() {
            Ok(client) => client,
            Err(e) => {
                return Self {
                    state: State::Failed(Some(e)),
                }
            }
        };
        let Some(monitor) = client.connection() else {
            tracing::debug!("sync client has no connection monitor");
            return Self { state: State::Done };
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        let listener: ConnectionListener = Arc::new(move |state: ConnectionState| {
            let _ = sender.send(state);
        });
        let remove = monitor.subscribe(listener);
        let current = monitor.current();

        Self {
            state: State::Active {
                first: Some(current),
                receiver,
                session: StreamSession::new("connection", remove, None),
            },
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Active { .. })
    }

    /// End the stream now, removing its listener.
    pub fn cancel(&mut self) {
        self.state = State::Done;
    }
}

impl Stream for ConnectionStateStream {
    type Item = Result<ConnectionState>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match &mut this.state {
            State::Active {
                first,
                receiver,
                session,
            } => {
                if let Some(state) = first.take() {
                    return Poll::Ready(Some(Ok(state)));
                }
                match receiver.poll_recv(cx) {
                    Poll::Ready(Some(state)) => Poll::Ready(Some(Ok(state))),
                    Poll::Ready(None) => {
                        session.release();
                        this.state = State::Done;
                        Poll::Ready(None)
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
            State::Failed(error) => {
                let error = error.take();
                this.state = State::Done;
                Poll::Ready(error.map(Err))
            }
            State::Done => Poll::Ready(None),
        }
    }
}
