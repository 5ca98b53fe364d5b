//! Channel hub of a simulated target.
//!
//! Every channel keeps its subscribers in subscription order. A message sent
//! by one subscriber is split into fragments of at most `msg_length_d2c`
//! bytes and queued in the mailbox of every receive-capable subscriber,
//! the sender included when it holds the channel bidirectionally.

use crate::config::ChannelLimits;
use crate::error::ServerError;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tas_protocol::{ChannelDirection, ChannelMode, CHL_LOWEST_PRIORITY, MAX_CHANNELS};
use tokio::sync::Notify;
use tokio::time::Instant;

/// One queued piece of a channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub data: Vec<u8>,
    /// Set on the first fragment of each message.
    pub first: bool,
}

#[derive(Debug, Default)]
struct Mailbox {
    queue: Mutex<VecDeque<Fragment>>,
    notify: Notify,
}

impl Mailbox {
    fn pop(&self) -> Option<Fragment> {
        self.queue.lock().pop_front()
    }
}

#[derive(Debug, Clone)]
struct Subscriber {
    client_id: String,
    direction: ChannelDirection,
    mode: ChannelMode,
    prio: u8,
    mailbox: Arc<Mailbox>,
}

/// Routes channel messages between the clients of one target.
pub struct ChannelHub {
    channels: DashMap<u8, Vec<Subscriber>>,
    limits: ChannelLimits,
}

impl ChannelHub {
    pub fn new(limits: ChannelLimits) -> Self {
        Self {
            channels: DashMap::new(),
            limits,
        }
    }

    /// Subscribes `client_id` to `chl`. Returns the assigned priority.
    pub fn subscribe(
        &self,
        client_id: &str,
        chl: u8,
        direction: ChannelDirection,
        mode: ChannelMode,
        prio: Option<u8>,
    ) -> Result<u8, ServerError> {
        if chl >= MAX_CHANNELS {
            return Err(ServerError::InvalidParam(format!(
                "channel {} out of range",
                chl
            )));
        }
        let prio = prio.unwrap_or(CHL_LOWEST_PRIORITY);
        if prio > CHL_LOWEST_PRIORITY {
            return Err(ServerError::InvalidParam(format!(
                "priority {} out of range",
                prio
            )));
        }

        let mut subs = self.channels.entry(chl).or_default();
        if subs.iter().any(|s| s.client_id == client_id) {
            return Err(ServerError::Usage(format!(
                "channel {} already subscribed",
                chl
            )));
        }
        if subs.iter().any(|s| s.mode == ChannelMode::Exclusive) {
            return Err(ServerError::ChannelSetup(format!(
                "channel {} is held exclusively",
                chl
            )));
        }
        if mode == ChannelMode::Exclusive && !subs.is_empty() {
            return Err(ServerError::ChannelSetup(format!(
                "channel {} has other subscribers",
                chl
            )));
        }

        subs.push(Subscriber {
            client_id: client_id.to_string(),
            direction,
            mode,
            prio,
            mailbox: Arc::new(Mailbox::default()),
        });
        tracing::debug!(
            "Client {} subscribed to channel {} ({:?}, {:?}, prio {})",
            client_id,
            chl,
            direction,
            mode,
            prio
        );
        Ok(prio)
    }

    /// Removes the subscription of `client_id` to `chl`. Returns whether one
    /// existed.
    pub fn unsubscribe(&self, client_id: &str, chl: u8) -> bool {
        let removed = match self.channels.get_mut(&chl) {
            Some(mut subs) => {
                let before = subs.len();
                subs.retain(|s| s.client_id != client_id);
                subs.len() != before
            }
            None => false,
        };
        self.channels.remove_if(&chl, |_, subs| subs.is_empty());
        removed
    }

    /// Queues `data` for every receiver of `chl`. Returns the accepted length.
    pub fn send(&self, client_id: &str, chl: u8, data: &[u8]) -> Result<u32, ServerError> {
        if data.is_empty() || data.len() > self.limits.msg_length_c2d as usize {
            return Err(ServerError::InvalidParam(format!(
                "message length {} not in 1..={}",
                data.len(),
                self.limits.msg_length_c2d
            )));
        }

        let receivers: Vec<Arc<Mailbox>> = {
            let subs = self
                .channels
                .get(&chl)
                .ok_or_else(|| not_subscribed(chl))?;
            let sender = subs
                .iter()
                .find(|s| s.client_id == client_id)
                .ok_or_else(|| not_subscribed(chl))?;
            if !sender.direction.can_send() {
                return Err(ServerError::Usage(format!(
                    "channel {} is not subscribed for sending",
                    chl
                )));
            }
            subs.iter()
                .filter(|s| s.direction.can_receive())
                .map(|s| s.mailbox.clone())
                .collect()
        };

        let fragments = fragment(data, self.limits.msg_length_d2c as usize);
        let capacity = self.limits.msg_num_d2c as usize;
        if receivers
            .iter()
            .any(|m| m.queue.lock().len() + fragments.len() > capacity)
        {
            return Err(ServerError::ChannelBusy(chl));
        }

        for mailbox in &receivers {
            mailbox.queue.lock().extend(fragments.iter().cloned());
            mailbox.notify.notify_one();
        }
        tracing::debug!(
            "Channel {}: {} bytes in {} fragment(s) to {} receiver(s)",
            chl,
            data.len(),
            fragments.len(),
            receivers.len()
        );
        Ok(data.len() as u32)
    }

    /// Takes the next queued fragment for `client_id` on `chl` without waiting.
    pub fn try_receive(&self, client_id: &str, chl: u8) -> Result<Option<Fragment>, ServerError> {
        Ok(self.mailbox(client_id, chl)?.pop())
    }

    /// Waits until a fragment is queued for `client_id` on `chl` or the
    /// deadline passes.
    pub async fn receive(
        &self,
        client_id: &str,
        chl: u8,
        deadline: Instant,
    ) -> Result<Fragment, ServerError> {
        let mailbox = self.mailbox(client_id, chl)?;
        loop {
            if let Some(fragment) = mailbox.pop() {
                return Ok(fragment);
            }
            if tokio::time::timeout_at(deadline, mailbox.notify.notified())
                .await
                .is_err()
            {
                return mailbox.pop().ok_or(ServerError::ChannelTimeout(chl));
            }
        }
    }

    fn mailbox(&self, client_id: &str, chl: u8) -> Result<Arc<Mailbox>, ServerError> {
        let subs = self
            .channels
            .get(&chl)
            .ok_or_else(|| not_subscribed(chl))?;
        let sub = subs
            .iter()
            .find(|s| s.client_id == client_id)
            .ok_or_else(|| not_subscribed(chl))?;
        if !sub.direction.can_receive() {
            return Err(ServerError::Usage(format!(
                "channel {} is not subscribed for receiving",
                chl
            )));
        }
        Ok(sub.mailbox.clone())
    }

    /// Channels held by `client_id`, ascending.
    pub fn list(&self, client_id: &str) -> Vec<u8> {
        let mut channels: Vec<u8> = self
            .channels
            .iter()
            .filter(|entry| entry.value().iter().any(|s| s.client_id == client_id))
            .map(|entry| *entry.key())
            .collect();
        channels.sort_unstable();
        channels
    }

    /// Priority assigned to `client_id` on `chl`.
    pub fn priority(&self, client_id: &str, chl: u8) -> Option<u8> {
        self.channels
            .get(&chl)?
            .iter()
            .find(|s| s.client_id == client_id)
            .map(|s| s.prio)
    }

    /// Drops every subscription of `client_id`.
    pub fn release_client(&self, client_id: &str) {
        for mut entry in self.channels.iter_mut() {
            entry.value_mut().retain(|s| s.client_id != client_id);
        }
        self.channels.retain(|_, subs| !subs.is_empty());
    }

    /// Drops all subscriptions and queued messages.
    pub fn clear(&self) {
        self.channels.clear();
    }
}

fn not_subscribed(chl: u8) -> ServerError {
    ServerError::Usage(format!("channel {} not subscribed", chl))
}

fn fragment(data: &[u8], max: usize) -> Vec<Fragment> {
    data.chunks(max.max(1))
        .enumerate()
        .map(|(i, chunk)| Fragment {
            data: chunk.to_vec(),
            first: i == 0,
        })
        .collect()
}
