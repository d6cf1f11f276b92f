//! Best-effort fan-out of review changes to live subscribers.
//!
//! The notifier is not a system of record: a subscriber that falls behind
//! loses the oldest updates and must fall back to reading the store.

use futures_util::stream::{self, Stream};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use archreview_core::{Review, ReviewId};

/// Updates buffered per subscriber before the oldest are dropped.
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct ChangeNotifier {
    sender: broadcast::Sender<Review>,
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish the new state of a review. Having no subscribers is fine.
    pub fn publish(&self, review: &Review) {
        match self.sender.send(review.clone()) {
            Ok(receivers) => debug!(
                "Published {} for review {} to {} subscriber(s)",
                review.status, review.review_id, receivers
            ),
            Err(_) => debug!("No subscribers for review {}", review.review_id),
        }
    }

    /// Subscribe to updates of one review, or of every review when `filter` is `None`.
    pub fn subscribe(&self, filter: Option<ReviewId>) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

pub struct Subscription {
    receiver: broadcast::Receiver<Review>,
    filter: Option<ReviewId>,
}

impl Subscription {
    /// Next matching update, or `None` once the notifier is gone.
    pub async fn next(&mut self) -> Option<Review> {
        loop {
            match self.receiver.recv().await {
                Ok(review) => {
                    if self.filter.map_or(true, |id| id == review.review_id) {
                        return Some(review);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged, {} update(s) dropped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Review> + Send {
        stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|review| (review, subscription))
        })
    }
}
