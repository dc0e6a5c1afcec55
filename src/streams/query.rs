//! Stream of snapshots for one privately materialized query.

use super::session::StreamSession;
use crate::client::{ClientHandle, EmissionListener};
use crate::error::Result;
use crate::types::{Emission, Query, ResultKind};
use crate::views::QueryErrorDetails;
use futures_util::stream::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Produces the query for a stream, or `None` for no query.
pub type QueryFn = Box<dyn FnOnce() -> Option<Query> + Send>;

/// One item of a [`QueryStream`].
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub data: Value,
    /// `Unknown` or `Complete`; errors end the stream instead.
    pub kind: ResultKind,
}

enum State {
    /// Not yet polled.
    Pending {
        client: ClientHandle,
        query_fn: QueryFn,
    },
    Active {
        receiver: mpsc::UnboundedReceiver<Result<Snapshot>>,
        session: StreamSession,
    },
    Done,
}

/// Lazy stream of query snapshots.
///
/// The query is evaluated and materialized on first poll, with its own
/// subscription (not shared through a registry). The subscription is torn
/// down when the stream ends, fails, is cancelled, or is dropped.
pub struct QueryStream {
    state: State,
}

impl QueryStream {
    pub(crate) fn new(client: ClientHandle, query_fn: QueryFn) -> Self {
        Self {
            state: State::Pending { client, query_fn },
        }
    }

    /// True while a subscription is held.
    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Active { .. })
    }

    /// End the stream now, releasing its subscription.
    pub fn cancel(&mut self) {
        self.state = State::Done;
    }

    fn acquire(client: ClientHandle, query_fn: QueryFn) -> Option<Result<State>> {
        let query = query_fn()?;
        let client = match client.require() {
            Ok(client) => client,
            Err(e) => return Some(Err(e)),
        };

        tracing::debug!(table = query.table(), "materializing query stream");
        let materialized = client.materialize(&query);
        let (sender, receiver) = mpsc::unbounded_channel();

        let listener: EmissionListener = Arc::new(move |emission: &Emission| {
            let item = match emission.kind {
                ResultKind::Error => Err(QueryErrorDetails::error_for(emission.error.as_ref())),
                kind => Ok(Snapshot {
                    data: emission.snapshot.clone(),
                    kind,
                }),
            };
            // Receiver gone means the stream already ended.
            let _ = sender.send(item);
        });
        let remove = materialized.view.add_listener(listener);

        Some(Ok(State::Active {
            receiver,
            session: StreamSession::new("query", remove, Some(materialized.view)),
        }))
    }
}

impl Stream for QueryStream {
    type Item = Result<Snapshot>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                State::Pending { .. } => {
                    let State::Pending { client, query_fn } =
                        std::mem::replace(&mut this.state, State::Done)
                    else {
                        return Poll::Ready(None);
                    };
                    match Self::acquire(client, query_fn) {
                        None => return Poll::Ready(None),
                        Some(Err(e)) => return Poll::Ready(Some(Err(e))),
                        Some(Ok(active)) => this.state = active,
                    }
                }
                State::Active { receiver, session } => {
                    return match receiver.poll_recv(cx) {
                        Poll::Ready(Some(Ok(snapshot))) => Poll::Ready(Some(Ok(snapshot))),
                        Poll::Ready(Some(Err(e))) => {
                            session.release();
                            this.state = State::Done;
                            Poll::Ready(Some(Err(e)))
                        }
                        Poll::Ready(None) => {
                            session.release();
                            this.state = State::Done;
                            Poll::Ready(None)
                        }
                        Poll::Pending => Poll::Pending,
                    };
                }
                State::Done => return Poll::Ready(None),
            }
        }
    }
}
