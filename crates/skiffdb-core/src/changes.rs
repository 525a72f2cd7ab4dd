/// Change notification plumbing between the record store and listeners
/// (live replicators, observers).
///
/// Stores call [`ChangeNotifier::notify`] after committing a write; each
/// subscriber gets its own receiver. Lagging subscribers skip missed
/// notifications rather than blocking the writer, which is fine because a
/// notification only means "re-enumerate from your last sequence".
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct ChangeNotification {
    pub keyspace: String,
    pub sequence: u64,
    pub doc_id: String,
}

#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<ChangeNotification>,
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        ChangeNotifier { tx }
    }

    pub fn notify(&self, keyspace: &str, sequence: u64, doc_id: &str) {
        // Ignore send errors (no receivers).
        let _ = self.tx.send(ChangeNotification {
            keyspace: keyspace.to_string(),
            sequence,
            doc_id: doc_id.to_string(),
        });
    }

    pub fn subscribe(&self) -> ChangeReceiver {
        ChangeReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}

pub struct ChangeReceiver {
    rx: broadcast::Receiver<ChangeNotification>,
}

impl ChangeReceiver {
    pub async fn recv(&mut self) -> Option<ChangeNotification> {
        loop {
            match self.rx.recv().await {
                Ok(notification) => return Some(notification),
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // Missed some; the next notification still wakes us.
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_notify() {
        let notifier = ChangeNotifier::new(16);
        let mut sub = notifier.subscribe();

        notifier.notify("docs:_default._default", 1, "doc1");

        let n = sub.recv().await.unwrap();
        assert_eq!(n.sequence, 1);
        assert_eq!(n.doc_id, "doc1");
    }

    #[tokio::test]
    async fn notify_without_subscribers_is_fine() {
        let notifier = ChangeNotifier::new(4);
        notifier.notify("k", 1, "d");
    }
}
