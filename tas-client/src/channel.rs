//! Channel messaging over the session connection.
//!
//! Channels are numbered message streams between the client and the
//! device. A client holds at most one subscription per channel id; the most
//! recently subscribed channel is the "current" one used by the methods
//! without an explicit channel id.

use crate::client::Client;
use crate::error::ClientError;
use std::time::Duration;
use tas_protocol::message::{
    ChlListResult, ChlRcvParams, ChlRcvResult, ChlSendParams, ChlSubscribeParams,
    ChlSubscribeResult, ChlUnsubscribeParams, ChlUnsubscribeResult,
};
use tas_protocol::{
    ChannelDirection, ChannelMode, ErrorCode, Operation, CHL_LOWEST_PRIORITY, MAX_CHANNELS,
};

/// An active channel subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub chl: u8,
    pub direction: ChannelDirection,
    pub mode: ChannelMode,
    /// Priority assigned by the server; 0 is the most urgent.
    pub prio: u8,
}

/// A received message fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub data: Vec<u8>,
    /// Set when this fragment starts a new message.
    pub is_first_fragment: bool,
}

/// Per-session subscription table.
#[derive(Debug, Default)]
pub(crate) struct ChannelTable {
    subs: Vec<Subscription>,
    /// Device reset counter at which the table was last confirmed.
    validated_reset: Option<u32>,
}

impl ChannelTable {
    fn find(&self, chl: u8) -> Option<Subscription> {
        self.subs.iter().copied().find(|s| s.chl == chl)
    }

    fn current(&self) -> Option<Subscription> {
        self.subs.last().copied()
    }

    fn remove(&mut self, chl: u8) -> Option<Subscription> {
        let pos = self.subs.iter().position(|s| s.chl == chl)?;
        Some(self.subs.remove(pos))
    }

    pub(crate) fn drain(&mut self) -> Vec<Subscription> {
        let mut subs = std::mem::take(&mut self.subs);
        subs.reverse();
        subs
    }
}

/// Channel operations on the bound target.
///
/// Obtained from [`Client::chl`].
pub struct Channels<'a> {
    client: &'a Client,
}

impl<'a> Channels<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Subscribes to `chl`, letting the server assign the priority.
    pub async fn subscribe(
        &self,
        chl: u8,
        direction: ChannelDirection,
        mode: ChannelMode,
    ) -> Result<Subscription, ClientError> {
        self.subscribe_with_priority(chl, direction, mode, None)
            .await
    }

    /// Subscribes to `chl` requesting priority `prio`.
    pub async fn subscribe_with_priority(
        &self,
        chl: u8,
        direction: ChannelDirection,
        mode: ChannelMode,
        prio: Option<u8>,
    ) -> Result<Subscription, ClientError> {
        if chl >= MAX_CHANNELS {
            return Err(ClientError::usage(format!(
                "channel {} out of range 0..{}",
                chl, MAX_CHANNELS
            )));
        }
        if let Some(p) = prio.filter(|&p| p > CHL_LOWEST_PRIORITY) {
            return Err(ClientError::usage(format!(
                "priority {} out of range 0..={}",
                p, CHL_LOWEST_PRIORITY
            )));
        }
        self.client.bound_info()?;

        let mut table = self.client.channels.lock().await;
        self.revalidate(&mut table).await?;
        if table.find(chl).is_some() {
            return Err(ClientError::usage(format!(
                "channel {} is already subscribed",
                chl
            )));
        }

        let params = ChlSubscribeParams {
            chl,
            direction,
            mode,
            prio,
        };
        let value = self
            .client
            .call(Operation::ChlSubscribe, serde_json::to_value(params)?)
            .await?;
        let result: ChlSubscribeResult = serde_json::from_value(value)?;

        let sub = Subscription {
            chl,
            direction,
            mode,
            prio: result.prio,
        };
        tracing::debug!("Subscribed to channel {} ({:?}, prio {})", chl, direction, sub.prio);
        table.subs.push(sub);
        Ok(sub)
    }

    /// Releases the current subscription. Succeeds without effect when no
    /// channel is held.
    pub async fn unsubscribe(&self) -> Result<(), ClientError> {
        let current = self.client.channels.lock().await.current();
        match current {
            Some(sub) => self.unsubscribe_channel(sub.chl).await,
            None => Ok(()),
        }
    }

    /// Releases the subscription of `chl`. Succeeds without effect when the
    /// channel is not held.
    pub async fn unsubscribe_channel(&self, chl: u8) -> Result<(), ClientError> {
        let mut table = self.client.channels.lock().await;
        if table.find(chl).is_none() {
            return Ok(());
        }

        let params = ChlUnsubscribeParams { chl };
        let value = match self
            .client
            .call(Operation::ChlUnsubscribe, serde_json::to_value(params)?)
            .await
        {
            Ok(value) => value,
            // The server still holds the channel after a refusal; a dead
            // link has released it.
            Err(e @ ClientError::ServerError { .. }) => return Err(e),
            Err(e) => {
                table.remove(chl);
                return Err(e);
            }
        };
        table.remove(chl);
        let result: ChlUnsubscribeResult = serde_json::from_value(value)?;
        if !result.removed {
            tracing::debug!("Channel {} was already released by the server", chl);
        }
        Ok(())
    }

    /// The most recently subscribed channel still held.
    pub async fn current(&self) -> Option<Subscription> {
        self.client.channels.lock().await.current()
    }

    /// All held subscriptions, oldest first.
    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.client.channels.lock().await.subs.clone()
    }

    // =========================================================================
    // Send
    // =========================================================================

    /// Sends `data` unchanged on the current channel.
    pub async fn send_msg(&self, data: &[u8]) -> Result<(), ClientError> {
        self.send(None, data).await
    }

    pub async fn send_msg_on(&self, chl: u8, data: &[u8]) -> Result<(), ClientError> {
        self.send(Some(chl), data).await
    }

    /// Sends `text` followed by a NUL terminator on the current channel.
    pub async fn send_string(&self, text: &str) -> Result<(), ClientError> {
        self.send(None, &nul_terminated(text)).await
    }

    pub async fn send_string_on(&self, chl: u8, text: &str) -> Result<(), ClientError> {
        self.send(Some(chl), &nul_terminated(text)).await
    }

    async fn send(&self, chl: Option<u8>, data: &[u8]) -> Result<(), ClientError> {
        let info = self.client.bound_info()?;
        if data.is_empty() {
            return Err(ClientError::usage("empty channel message"));
        }
        if data.len() > info.msg_length_c2d as usize {
            return Err(ClientError::usage(format!(
                "message of {} bytes exceeds the channel limit of {}",
                data.len(),
                info.msg_length_c2d
            )));
        }

        let mut table = self.client.channels.lock().await;
        let sub = self.resolve(&mut table, chl).await?;
        if !sub.direction.can_send() {
            return Err(ClientError::usage(format!(
                "channel {} is receive-only",
                sub.chl
            )));
        }

        let params = ChlSendParams {
            chl: sub.chl,
            data: data.to_vec(),
        };
        let result = self
            .client
            .call(Operation::ChlSend, serde_json::to_value(params)?)
            .await;
        self.after_failure(&mut table, &result).await;
        result?;

        tracing::debug!("Sent {} bytes on channel {}", data.len(), sub.chl);
        Ok(())
    }

    // =========================================================================
    // Receive
    // =========================================================================

    /// Waits up to `timeout_ms` for the next message fragment on the current
    /// channel.
    pub async fn rcv_msg(&self, timeout_ms: u32) -> Result<ChannelMessage, ClientError> {
        self.rcv(None, timeout_ms).await
    }

    pub async fn rcv_msg_on(
        &self,
        chl: u8,
        timeout_ms: u32,
    ) -> Result<ChannelMessage, ClientError> {
        self.rcv(Some(chl), timeout_ms).await
    }

    /// Like [`Channels::rcv_msg`], decoding the payload as text with one
    /// trailing NUL removed. Returns the text and the first-fragment flag.
    pub async fn rcv_string(&self, timeout_ms: u32) -> Result<(String, bool), ClientError> {
        let msg = self.rcv(None, timeout_ms).await?;
        Ok((strip_nul(&msg.data), msg.is_first_fragment))
    }

    pub async fn rcv_string_on(
        &self,
        chl: u8,
        timeout_ms: u32,
    ) -> Result<(String, bool), ClientError> {
        let msg = self.rcv(Some(chl), timeout_ms).await?;
        Ok((strip_nul(&msg.data), msg.is_first_fragment))
    }

    async fn rcv(&self, chl: Option<u8>, timeout_ms: u32) -> Result<ChannelMessage, ClientError> {
        self.client.bound_info()?;
        let mut table = self.client.channels.lock().await;
        let sub = self.resolve(&mut table, chl).await?;
        if !sub.direction.can_receive() {
            return Err(ClientError::usage(format!("channel {} is send-only", sub.chl)));
        }

        let params = ChlRcvParams {
            chl: sub.chl,
            timeout_ms,
        };
        let wait = self.client.link_timeout() + Duration::from_millis(timeout_ms as u64);
        let result = self
            .client
            .call_within(Operation::ChlRcv, serde_json::to_value(params)?, wait)
            .await;

        let value = match result {
            Err(ClientError::ServerError {
                code: ErrorCode::ChannelTimeout,
                ..
            }) => {
                return Err(ClientError::ReceiveTimeout {
                    chl: sub.chl,
                    timeout_ms,
                })
            }
            other => {
                self.after_failure(&mut table, &other).await;
                other?
            }
        };

        let result: ChlRcvResult = serde_json::from_value(value)?;
        tracing::debug!(
            "Received {} bytes on channel {} (first={})",
            result.data.len(),
            result.chl,
            result.first
        );
        Ok(ChannelMessage {
            data: result.data,
            is_first_fragment: result.first,
        })
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Looks up the subscription to use, after bringing the table up to date
    /// with device resets.
    async fn resolve(
        &self,
        table: &mut ChannelTable,
        chl: Option<u8>,
    ) -> Result<Subscription, ClientError> {
        self.revalidate(table).await?;
        match chl {
            Some(chl) => table
                .find(chl)
                .ok_or_else(|| ClientError::usage(format!("channel {} is not subscribed", chl))),
            None => table
                .current()
                .ok_or_else(|| ClientError::usage("no channel subscribed")),
        }
    }

    /// Drops subscriptions the server released because of a device reset.
    async fn revalidate(&self, table: &mut ChannelTable) -> Result<(), ClientError> {
        let seen = self.client.reset_count();
        if table.validated_reset == Some(seen) {
            return Ok(());
        }
        if table.subs.is_empty() {
            table.validated_reset = Some(seen);
            return Ok(());
        }

        let value = self
            .client
            .call(Operation::ChlList, serde_json::json!({}))
            .await?;
        let listed: ChlListResult = serde_json::from_value(value)?;
        let before = table.subs.len();
        table.subs.retain(|s| listed.channels.contains(&s.chl));
        if table.subs.len() != before {
            tracing::info!(
                "Device reset released {} channel subscription(s)",
                before - table.subs.len()
            );
        }
        table.validated_reset = Some(self.client.reset_count());
        Ok(())
    }

    /// Revalidates after a failed request that revealed a device reset.
    async fn after_failure<T>(&self, table: &mut ChannelTable, result: &Result<T, ClientError>) {
        if let Err(ClientError::ServerError { .. }) = result {
            if table.validated_reset != Some(self.client.reset_count()) {
                if let Err(e) = self.revalidate(table).await {
                    tracing::debug!("Revalidating channel subscriptions failed: {}", e);
                }
            }
        }
    }
}

fn nul_terminated(text: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(text.len() + 1);
    data.extend_from_slice(text.as_bytes());
    data.push(0);
    data
}

fn strip_nul(data: &[u8]) -> String {
    let text = data.strip_suffix(&[0]).unwrap_or(data);
    String::from_utf8_lossy(text).into_owned()
}
