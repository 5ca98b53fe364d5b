//! Read/write transaction engine.
//!
//! Every operation is lowered to naturally aligned device accesses by the
//! planner and sent as RW batches over the session's connection.

use crate::client::{Client, ConnectionInfo};
use crate::error::ClientError;
use crate::plan::{self, ReadPlan, WritePlan};
use serde_json::Value;
use std::ops::Range;
use tas_protocol::message::{RwParams, RwResult};
use tas_protocol::{ErrorCode, Operation, RwItem, RwItemResult};

/// Kind of a transaction, with the fill pattern where applicable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwOp {
    Read,
    Write,
    Fill32(u32),
    Fill64(u64),
}

/// Fault reported by the device for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFault {
    pub code: ErrorCode,
    /// Address of the device access that faulted.
    pub addr: u64,
}

/// Result of one executed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransOutcome {
    pub num_bytes_ok: u32,
    pub fault: Option<DeviceFault>,
}

impl TransOutcome {
    pub fn is_ok(&self) -> bool {
        self.fault.is_none()
    }
}

/// One read, write or fill inside a batch.
///
/// A read's `data` is empty on input and holds `num_bytes` bytes after a
/// successful execution. A write's `data` is the payload. After a fill,
/// `data` holds the pattern bytes written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RwTransaction {
    pub op: RwOp,
    pub addr: u64,
    pub addr_map: u8,
    pub num_bytes: u32,
    pub data: Vec<u8>,
    /// Set by [`Rw::execute_trans`].
    pub outcome: Option<TransOutcome>,
}

impl RwTransaction {
    fn new(op: RwOp, addr: u64, num_bytes: u32, data: Vec<u8>) -> Self {
        Self {
            op,
            addr,
            addr_map: 0,
            num_bytes,
            data,
            outcome: None,
        }
    }

    pub fn read(addr: u64, num_bytes: u32) -> Self {
        Self::new(RwOp::Read, addr, num_bytes, Vec::new())
    }

    pub fn write(addr: u64, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        Self::new(RwOp::Write, addr, len, data)
    }

    pub fn fill32(addr: u64, pattern: u32, num_bytes: u32) -> Self {
        Self::new(RwOp::Fill32(pattern), addr, num_bytes, Vec::new())
    }

    pub fn fill64(addr: u64, pattern: u64, num_bytes: u32) -> Self {
        Self::new(RwOp::Fill64(pattern), addr, num_bytes, Vec::new())
    }

    pub fn with_addr_map(mut self, addr_map: u8) -> Self {
        self.addr_map = addr_map;
        self
    }
}

/// How a transaction was lowered, kept to reassemble its outcome.
enum Lowered {
    Read(ReadPlan),
    Write,
    Fill { pattern: u64, width: usize },
}

/// Memory access on the bound target.
///
/// Obtained from [`Client::rw`]; borrows the client for the duration of
/// each call.
pub struct Rw<'a> {
    client: &'a Client,
    addr_map: u8,
}

impl<'a> Rw<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self {
            client,
            addr_map: 0,
        }
    }

    /// Targets address map `addr_map` instead of the default map 0.
    pub fn with_addr_map(mut self, addr_map: u8) -> Self {
        self.addr_map = addr_map;
        self
    }

    // =========================================================================
    // Single operations
    // =========================================================================

    /// Reads `num_bytes` starting at `addr`. Any alignment is accepted.
    pub async fn read(&self, addr: u64, num_bytes: u32) -> Result<Vec<u8>, ClientError> {
        plan::check_range(addr, num_bytes as u64)?;
        let info = self.client.bound_info()?;

        let plan = ReadPlan::new(addr, num_bytes, info.access_width);
        let items = plan
            .accesses
            .iter()
            .map(|a| RwItem::read(a.addr, a.len).with_addr_map(self.addr_map))
            .collect();
        let results = self.run(items, &info).await?;

        let raw: Vec<u8> = results.into_iter().flat_map(|r| r.data).collect();
        if raw.len() < plan.covered_len() {
            return Err(ClientError::UnexpectedResponse(format!(
                "read returned {} of {} bytes",
                raw.len(),
                plan.covered_len()
            )));
        }
        Ok(plan.extract(&raw))
    }

    pub async fn read8(&self, addr: u64) -> Result<u8, ClientError> {
        Ok(self.read_array::<1>(addr).await?[0])
    }

    pub async fn read16(&self, addr: u64) -> Result<u16, ClientError> {
        Ok(u16::from_le_bytes(self.read_array(addr).await?))
    }

    pub async fn read32(&self, addr: u64) -> Result<u32, ClientError> {
        Ok(u32::from_le_bytes(self.read_array(addr).await?))
    }

    pub async fn read64(&self, addr: u64) -> Result<u64, ClientError> {
        Ok(u64::from_le_bytes(self.read_array(addr).await?))
    }

    async fn read_array<const N: usize>(&self, addr: u64) -> Result<[u8; N], ClientError> {
        let data = self.read(addr, N as u32).await?;
        data.try_into().map_err(|d: Vec<u8>| {
            ClientError::UnexpectedResponse(format!("expected {} bytes, got {}", N, d.len()))
        })
    }

    /// Writes `data` at `addr` without modifying any byte outside
    /// `[addr, addr + data.len())`.
    pub async fn write(&self, addr: u64, data: &[u8]) -> Result<(), ClientError> {
        let len = u32::try_from(data.len())
            .map_err(|_| ClientError::usage("write payload exceeds 4 GiB"))?;
        plan::check_range(addr, len as u64)?;
        let info = self.client.bound_info()?;

        let plan = WritePlan::new(addr, len, info.access_width);
        let units: Vec<Vec<u8>> = if plan.needs_merge() {
            tracing::debug!(
                "Read-modify-write of {} unit(s) around {:#x}+{}",
                plan.merge_units.len(),
                addr,
                len
            );
            let reads = plan
                .merge_units
                .iter()
                .map(|u| RwItem::read(u.addr, u.len).with_addr_map(self.addr_map))
                .collect();
            self.run(reads, &info)
                .await?
                .into_iter()
                .map(|r| r.data)
                .collect()
        } else {
            Vec::new()
        };

        let image = plan.merge(&units, data);
        let items = plan
            .items(&image)
            .into_iter()
            .map(|item| item.with_addr_map(self.addr_map))
            .collect();
        self.run(items, &info).await?;
        Ok(())
    }

    pub async fn write8(&self, addr: u64, value: u8) -> Result<(), ClientError> {
        self.write(addr, &[value]).await
    }

    pub async fn write16(&self, addr: u64, value: u16) -> Result<(), ClientError> {
        self.write(addr, &value.to_le_bytes()).await
    }

    pub async fn write32(&self, addr: u64, value: u32) -> Result<(), ClientError> {
        self.write(addr, &value.to_le_bytes()).await
    }

    pub async fn write64(&self, addr: u64, value: u64) -> Result<(), ClientError> {
        self.write(addr, &value.to_le_bytes()).await
    }

    /// Repeats a 32-bit pattern over `num_bytes` bytes at a 4-aligned
    /// address.
    pub async fn fill32(&self, addr: u64, pattern: u32, num_bytes: u32) -> Result<(), ClientError> {
        let info = self.client.bound_info()?;
        let items = plan::fill32_items(addr, pattern, num_bytes, info.access_width)?
            .into_iter()
            .map(|item| item.with_addr_map(self.addr_map))
            .collect();
        self.run(items, &info).await?;
        Ok(())
    }

    /// Repeats a 64-bit pattern over `num_bytes` bytes at an 8-aligned
    /// address.
    pub async fn fill64(&self, addr: u64, pattern: u64, num_bytes: u32) -> Result<(), ClientError> {
        let info = self.client.bound_info()?;
        let item = plan::fill64_item(addr, pattern, num_bytes)?.with_addr_map(self.addr_map);
        self.run(vec![item], &info).await?;
        Ok(())
    }

    // =========================================================================
    // Batches
    // =========================================================================

    /// Executes `transactions` as one server-side batch in the given order.
    ///
    /// Device faults do not fail the call; each transaction's `outcome`
    /// carries its own status. The server stops at the first faulting
    /// access and reports every later one as consequential. Writes must be
    /// aligned to the device's minimum access width.
    pub async fn execute_trans(
        &self,
        transactions: &mut [RwTransaction],
    ) -> Result<(), ClientError> {
        if transactions.is_empty() {
            return Ok(());
        }
        let info = self.client.bound_info()?;
        let width = plan::normalize_width(info.access_width);

        let mut items = Vec::new();
        let mut spans: Vec<(Range<usize>, Lowered)> = Vec::with_capacity(transactions.len());

        for (i, t) in transactions.iter().enumerate() {
            if t.num_bytes == 0 {
                return Err(ClientError::usage(format!("transaction {} has zero length", i)));
            }
            plan::check_range(t.addr, t.num_bytes as u64)?;
            let start = items.len();

            let lowered = match t.op {
                RwOp::Read => {
                    let plan = ReadPlan::new(t.addr, t.num_bytes, width);
                    items.extend(plan.accesses.iter().map(|a| RwItem::read(a.addr, a.len)));
                    Lowered::Read(plan)
                }
                RwOp::Write => {
                    if t.data.len() != t.num_bytes as usize {
                        return Err(ClientError::usage(format!(
                            "transaction {}: payload is {} bytes, expected {}",
                            i,
                            t.data.len(),
                            t.num_bytes
                        )));
                    }
                    let w = width as u64;
                    if t.addr % w != 0 || t.num_bytes as u64 % w != 0 {
                        return Err(ClientError::usage(format!(
                            "transaction {}: write not aligned to the device access width {}",
                            i, width
                        )));
                    }
                    let plan = WritePlan::new(t.addr, t.num_bytes, width);
                    items.extend(plan.items(&t.data));
                    Lowered::Write
                }
                RwOp::Fill32(pattern) => {
                    items.extend(plan::fill32_items(t.addr, pattern, t.num_bytes, width)?);
                    Lowered::Fill {
                        pattern: pattern as u64,
                        width: 4,
                    }
                }
                RwOp::Fill64(pattern) => {
                    items.push(plan::fill64_item(t.addr, pattern, t.num_bytes)?);
                    Lowered::Fill { pattern, width: 8 }
                }
            };

            for item in &mut items[start..] {
                item.addr_map = t.addr_map;
            }
            spans.push((start..items.len(), lowered));
        }

        if items.len() > info.max_batch_items as usize {
            return Err(ClientError::usage(format!(
                "batch needs {} device accesses, the target accepts {}",
                items.len(),
                info.max_batch_items
            )));
        }

        let addrs: Vec<u64> = items.iter().map(|item| item.addr).collect();
        let results = self.batch(items).await?;

        for (t, (range, lowered)) in transactions.iter_mut().zip(spans) {
            let slice = &results[range.clone()];
            let failed = slice.iter().position(|r| r.error.is_some());
            let fault = failed.and_then(|pos| {
                slice[pos].error.map(|code| DeviceFault {
                    code,
                    addr: addrs[range.start + pos],
                })
            });
            let done = &slice[..failed.unwrap_or(slice.len())];
            let ok_bytes: u32 = done.iter().map(|r| r.num_bytes_ok).sum();

            let num_bytes_ok = match lowered {
                Lowered::Read(plan) => {
                    let raw: Vec<u8> = done.iter().flat_map(|r| r.data.iter().copied()).collect();
                    t.data = if fault.is_none() {
                        plan.extract(&raw)
                    } else {
                        Vec::new()
                    };
                    (ok_bytes as usize)
                        .saturating_sub(plan.skip)
                        .min(plan.len) as u32
                }
                Lowered::Write => ok_bytes,
                Lowered::Fill { pattern, width } => {
                    if fault.is_none() {
                        t.data = plan::pattern_bytes(pattern, width, t.num_bytes as usize);
                    }
                    ok_bytes
                }
            };

            t.outcome = Some(TransOutcome {
                num_bytes_ok,
                fault,
            });
        }
        Ok(())
    }

    /// Sends `items` in batches of at most `max_batch_items`, failing on the
    /// first device fault.
    async fn run(
        &self,
        items: Vec<RwItem>,
        info: &ConnectionInfo,
    ) -> Result<Vec<RwItemResult>, ClientError> {
        let chunk_len = (info.max_batch_items as usize).max(1);
        let mut out = Vec::with_capacity(items.len());
        let mut items = items;

        while !items.is_empty() {
            let rest = items.split_off(chunk_len.min(items.len()));
            let addrs: Vec<u64> = items.iter().map(|item| item.addr).collect();
            let results = self.batch(items).await?;

            if let Some((i, code)) = results
                .iter()
                .enumerate()
                .find_map(|(i, r)| r.error.map(|code| (i, code)))
            {
                return Err(ClientError::Device {
                    code,
                    addr: addrs[i],
                });
            }
            out.extend(results);
            items = rest;
        }
        Ok(out)
    }

    async fn batch(&self, items: Vec<RwItem>) -> Result<Vec<RwItemResult>, ClientError> {
        let count = items.len();
        tracing::debug!("RW batch of {} access(es)", count);

        let params: Value = serde_json::to_value(RwParams { items })?;
        let result: RwResult = serde_json::from_value(self.client.call(Operation::Rw, params).await?)?;

        if result.results.len() != count {
            return Err(ClientError::UnexpectedResponse(format!(
                "RW returned {} results for {} accesses",
                result.results.len(),
                count
            )));
        }
        Ok(result.results)
    }
}
