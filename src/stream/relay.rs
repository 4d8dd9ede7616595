// Fragment relay channel.
//
// Connects the task that reads the upstream response to the loop that
// forwards text to the client. A bounded channel carries fragments in
// decode order; "producer finished" is the channel close (every sender
// dropped) or an explicit `EndOfStream`, so a consumer can always tell
// an idle stream apart from a finished one.

use tokio::sync::mpsc;

use super::decoder::Fragment;

/// Fragments buffered between producer and consumer before `push`
/// applies backpressure.
const RELAY_DEPTH: usize = 64;

/// Create a connected sender/receiver pair for one response stream.
pub fn relay_channel() -> (FragmentSender, FragmentReceiver) {
    let (tx, rx) = mpsc::channel(RELAY_DEPTH);
    (
        FragmentSender { tx },
        FragmentReceiver {
            rx,
            end_seen: false,
        },
    )
}

/// Producer half. Dropping it signals completion to the receiver.
pub struct FragmentSender {
    tx: mpsc::Sender<Fragment>,
}

impl FragmentSender {
    /// Hand one fragment to the consumer, waiting for channel space.
    ///
    /// Returns `false` once the consumer is gone; the producer should
    /// stop reading the upstream response at that point.
    pub async fn push(&self, fragment: Fragment) -> bool {
        self.tx.send(fragment).await.is_ok()
    }
}

/// Consumer half, owned by the client-forwarding loop.
pub struct FragmentReceiver {
    rx: mpsc::Receiver<Fragment>,
    /// Set once `EndOfStream` has been consumed. Terminal: nothing is
    /// read from the channel after it.
    end_seen: bool,
}

impl FragmentReceiver {
    /// Wait for the next batch of text.
    ///
    /// Suspends until at least one fragment arrives, then coalesces
    /// whatever else is already buffered into one string. Returns
    /// `None` once the stream is complete.
    pub async fn next_text(&mut self) -> Option<String> {
        loop {
            if self.end_seen {
                return None;
            }
            let mut text = match self.rx.recv().await {
                Some(Fragment::Text(t)) => t,
                Some(Fragment::EndOfStream) => {
                    self.end_seen = true;
                    return None;
                }
                None => return None,
            };
            text.push_str(&self.drain_available());
            if !text.is_empty() {
                return Some(text);
            }
        }
    }

    /// Remove and concatenate every fragment buffered right now.
    ///
    /// Never waits. With nothing new arrived the result is empty, and
    /// calling it again changes nothing.
    pub fn drain_available(&mut self) -> String {
        let mut text = String::new();
        if self.end_seen {
            return text;
        }
        while let Ok(fragment) = self.rx.try_recv() {
            match fragment {
                Fragment::Text(t) => text.push_str(&t),
                Fragment::EndOfStream => {
                    self.end_seen = true;
                    break;
                }
            }
        }
        text
    }

    /// True iff the producer has finished AND every fragment has been
    /// consumed. False while undelivered fragments remain, even after
    /// the producer is gone.
    pub fn is_complete(&self) -> bool {
        self.end_seen || (self.rx.is_closed() && self.rx.is_empty())
    }
}
