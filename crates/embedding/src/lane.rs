//! Serial request lane.
//!
//! All requests to one server instance flow through a single dispatcher so
//! at most one request is ever in flight. Queries and documents share the
//! lane; the receiver polls the query channel first, so a query is picked up
//! ahead of any queued document batch but never interrupts the batch the
//! dispatcher is currently awaiting.

use crate::{EmbedKind, EmbeddingError};
use tokio::sync::{mpsc, oneshot};

pub(crate) struct LaneRequest {
  pub texts: Vec<String>,
  pub kind: EmbedKind,
  pub respond: oneshot::Sender<Result<Vec<Vec<f32>>, EmbeddingError>>,
}

#[derive(Clone)]
pub(crate) struct LaneSender {
  query_tx: mpsc::Sender<LaneRequest>,
  doc_tx: mpsc::Sender<LaneRequest>,
}

pub(crate) struct LaneReceiver {
  query_rx: mpsc::Receiver<LaneRequest>,
  doc_rx: mpsc::Receiver<LaneRequest>,
}

pub(crate) fn lane(capacity: usize) -> (LaneSender, LaneReceiver) {
  let (query_tx, query_rx) = mpsc::channel(capacity);
  let (doc_tx, doc_rx) = mpsc::channel(capacity);
  (LaneSender { query_tx, doc_tx }, LaneReceiver { query_rx, doc_rx })
}

impl LaneSender {
  pub async fn submit(&self, texts: Vec<String>, kind: EmbedKind) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let (respond, rx) = oneshot::channel();
    let request = LaneRequest { texts, kind, respond };

    let sender = match kind {
      EmbedKind::Query => &self.query_tx,
      EmbedKind::Document => &self.doc_tx,
    };

    sender
      .send(request)
      .await
      .map_err(|_| EmbeddingError::ServiceUnavailable)?;

    rx.await.map_err(|_| EmbeddingError::ServiceUnavailable)?
  }
}

impl LaneReceiver {
  /// Next request, query lane first.
  pub async fn next(&mut self) -> Option<LaneRequest> {
    tokio::select! {
      biased;

      req = self.query_rx.recv() => match req {
        Some(req) => Some(req),
        // Query side closed; drain remaining document requests
        None => self.doc_rx.recv().await,
      },
      req = self.doc_rx.recv() => req,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_query_jumps_ahead_of_documents() {
    let (tx, mut rx) = lane(8);

    // Queue two document requests, then a query
    for i in 0..2 {
      let (respond, _keep) = oneshot::channel();
      tx.doc_tx
        .send(LaneRequest {
          texts: vec![format!("doc{i}")],
          kind: EmbedKind::Document,
          respond,
        })
        .await
        .unwrap();
      std::mem::forget(_keep);
    }
    let (respond, _keep) = oneshot::channel();
    tx.query_tx
      .send(LaneRequest {
        texts: vec!["query".to_string()],
        kind: EmbedKind::Query,
        respond,
      })
      .await
      .unwrap();
    std::mem::forget(_keep);

    let first = rx.next().await.unwrap();
    assert_eq!(first.kind, EmbedKind::Query);
    let second = rx.next().await.unwrap();
    assert_eq!(second.kind, EmbedKind::Document);
  }

  #[tokio::test]
  async fn test_submit_fails_when_receiver_dropped() {
    let (tx, rx) = lane(2);
    drop(rx);

    let err = tx.submit(vec!["x".into()], EmbedKind::Document).await.unwrap_err();
    assert!(matches!(err, EmbeddingError::ServiceUnavailable));
  }
}
