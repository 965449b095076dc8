//! Upstream content producer contract.
//!
//! The producer is a black box yielding a lazy, finite sequence of fragments
//! that ends with either [`ProducerItem::Complete`] or
//! [`ProducerItem::Failed`]. Once it has ended the emitter never polls it again.

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::event::Usage;

/// One step of the upstream sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum ProducerItem {
    Fragment(Value),
    /// Generation finished; usage totals as reported upstream.
    Complete(Usage),
    Failed(ProducerError),
}

/// Upstream generation failure.
///
/// `detail` is for server logs only and never reaches the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerError {
    detail: String,
}

impl ProducerError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl Display for ProducerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.detail)
    }
}

impl std::error::Error for ProducerError {}

/// Source of fragments driven by the emitter.
///
/// Returning `None` without a prior `Complete`/`Failed` is treated as an
/// upstream failure.
pub trait Producer: Send {
    fn next_item<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Option<ProducerItem>> + Send + 'a>>;
}

/// Producer replaying a fixed script, optionally pacing fragments.
#[derive(Debug, Clone, Default)]
pub struct ScriptedProducer {
    items: VecDeque<ProducerItem>,
    pace: Option<Duration>,
}

impl ScriptedProducer {
    pub fn new(items: impl IntoIterator<Item = ProducerItem>) -> Self {
        Self {
            items: items.into_iter().collect(),
            pace: None,
        }
    }

    /// `count` fragments `{"index": n, "text": "fragment n"}` followed by completion.
    pub fn numbered(count: u64, usage: Usage) -> Self {
        let mut items: Vec<ProducerItem> = (0..count)
            .map(|index| {
                ProducerItem::Fragment(serde_json::json!({
                    "index": index,
                    "text": format!("fragment {index}"),
                }))
            })
            .collect();
        items.push(ProducerItem::Complete(usage));
        Self::new(items)
    }

    /// Wait `pace` before yielding each fragment.
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    /// Replace everything from fragment `index` onwards with a failure.
    pub fn failing_at(mut self, index: usize, error: ProducerError) -> Self {
        self.items.truncate(index);
        self.items.push_back(ProducerItem::Failed(error));
        self
    }
}

impl Producer for ScriptedProducer {
    fn next_item<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Option<ProducerItem>> + Send + 'a>> {
        Box::pin(async move {
            let item = self.items.pop_front()?;
            if let (Some(pace), ProducerItem::Fragment(_)) = (self.pace, &item) {
                tokio::time::sleep(pace).await;
            }
            Some(item)
        })
    }
}

/// Producer fed through a tokio channel by some other task.
#[derive(Debug)]
pub struct ChannelProducer {
    receiver: mpsc::Receiver<ProducerItem>,
}

impl ChannelProducer {
    pub fn new(buffer: usize) -> (mpsc::Sender<ProducerItem>, Self) {
        let (sender, receiver) = mpsc::channel(buffer);
        (sender, Self { receiver })
    }
}

impl Producer for ChannelProducer {
    fn next_item<'a>(&'a mut self) -> Pin<Box<dyn Future<Output = Option<ProducerItem>> + Send + 'a>> {
        Box::pin(self.receiver.recv())
    }
}
