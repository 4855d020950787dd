#![forbid(unsafe_code)]

use super::types::ChangeNotice;
use std::sync::mpsc::{Receiver, Sender, channel};

#[derive(Debug, Default)]
pub(crate) struct Notifier {
    subscribers: Vec<Sender<ChangeNotice>>,
}

impl Notifier {
    pub(crate) fn subscribe(&mut self) -> Receiver<ChangeNotice> {
        let (tx, rx) = channel();
        self.subscribers.push(tx);
        rx
    }

    /// Fan out committed notices. Subscribers whose receiver is gone are dropped.
    pub(crate) fn dispatch(&mut self, notices: Vec<ChangeNotice>) {
        if notices.is_empty() {
            return;
        }
        self.subscribers
            .retain(|tx| notices.iter().all(|notice| tx.send(notice.clone()).is_ok()));
    }
}
