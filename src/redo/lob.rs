//! Large-object assembly.
//!
//! LOB values arrive as index vectors (page ordinal to DBA mappings plus
//! size declarations) and data vectors (page bytes keyed by DBA), spread
//! across the transaction. A row's LOB column carries only a locator;
//! materialization walks the page graph when the row is replayed. Three
//! locator layouts exist: inline (value in the locator body), in-index
//! (pages enumerated by the index tree), and in-value (runs of pages
//! listed in the locator or chased through list pages).

use std::collections::{BTreeMap, HashMap, HashSet};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::types::{Dba, LobId, Xid};
use crate::{Error, Result};

pub const FLG2_IN_VALUE: u16 = 0x0100;
pub const FLG2_IN_INDEX: u16 = 0x0400;
pub const FLG2_INLINE: u16 = 0x0800;
pub const FLG2_MODERN: u16 = 0x4000;

/// High nibble of `flg3` selects how an in-value locator lists its pages.
pub const FLG3_RUNS_INLINE: u8 = 0x20;
pub const FLG3_RUNS_CHAINED: u8 = 0x40;

/// Position of a chunk within its LOB, so values can stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobChunkKind {
    Only,
    First,
    Middle,
    Last,
}

#[derive(Debug, Clone)]
pub struct LobChunk {
    pub kind: LobChunkKind,
    pub data: Bytes,
}

/// A fully materialized LOB value.
#[derive(Debug, Clone)]
pub struct LobValue {
    pub chunks: Vec<LobChunk>,
}

impl LobValue {
    fn from_pages(pages: Vec<Bytes>) -> Self {
        let n = pages.len();
        let chunks = pages
            .into_iter()
            .enumerate()
            .map(|(i, data)| {
                let kind = match (i, n) {
                    (_, 1) => LobChunkKind::Only,
                    (0, _) => LobChunkKind::First,
                    (i, n) if i == n - 1 => LobChunkKind::Last,
                    _ => LobChunkKind::Middle,
                };
                LobChunk { kind, data }
            })
            .collect();
        LobValue { chunks }
    }

    pub fn len(&self) -> usize {
        self.chunks.iter().map(|c| c.data.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.len());
        for chunk in &self.chunks {
            out.put_slice(&chunk.data);
        }
        out.freeze()
    }
}

/// LOB column locator as embedded in a row image.
#[derive(Debug, Clone)]
pub struct LobLocator {
    pub lob_id: LobId,
    pub flg2: u16,
    pub flg3: u8,
    pub size: u64,
    pub body: Bytes,
}

impl LobLocator {
    pub const MIN_SIZE: usize = 10 + 2 + 1 + 1 + 8;

    pub fn decode(mut buf: Bytes) -> Result<LobLocator> {
        if buf.remaining() < Self::MIN_SIZE {
            return Err(Error::redo(60005, "lob locator truncated"));
        }
        let mut lob_id = [0u8; 10];
        buf.copy_to_slice(&mut lob_id);
        let flg2 = buf.get_u16_le();
        let flg3 = buf.get_u8();
        let _pad = buf.get_u8();
        let size = buf.get_u64_le();
        Ok(LobLocator { lob_id: LobId::new(lob_id), flg2, flg3, size, body: buf })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.lob_id.0);
        buf.put_u16_le(self.flg2);
        buf.put_u8(self.flg3);
        buf.put_u8(0);
        buf.put_u64_le(self.size);
        buf.put_slice(&self.body);
    }
}

/// Index state of one LOB: declared geometry plus the ordinal → DBA map.
#[derive(Debug, Default)]
struct LobIndex {
    page_size: u32,
    size_pages: u32,
    size_rest: u32,
    index_map: BTreeMap<u32, Dba>,
}

/// Tracks LOB page graphs per transaction until the owning rows replay.
#[derive(Default)]
pub struct LobAssembler {
    lobs: HashMap<LobId, LobIndex>,
    data_map: HashMap<Dba, Bytes>,
    lob_owners: HashMap<Xid, HashSet<LobId>>,
    data_owners: HashMap<Xid, Vec<Dba>>,
}

impl LobAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a LOB index vector: `{lob_id, page_size, size_pages,
    /// size_rest, count, {ordinal, dba}*}`. Entries accumulate across
    /// vectors of the same LOB.
    pub fn add_index(&mut self, xid: Xid, mut payload: Bytes) -> Result<()> {
        if payload.remaining() < 10 + 4 + 4 + 4 + 4 {
            return Err(Error::redo(60005, "lob index vector truncated"));
        }
        let mut id = [0u8; 10];
        payload.copy_to_slice(&mut id);
        let lob_id = LobId::new(id);
        let page_size = payload.get_u32_le();
        let size_pages = payload.get_u32_le();
        let size_rest = payload.get_u32_le();
        let count = payload.get_u32_le();

        let entry = self.lobs.entry(lob_id).or_default();
        if page_size != 0 {
            entry.page_size = page_size;
            entry.size_pages = size_pages;
            entry.size_rest = size_rest;
        }
        for _ in 0..count {
            if payload.remaining() < 8 {
                return Err(Error::redo(60005, "lob index entry truncated"));
            }
            let ordinal = payload.get_u32_le();
            let dba = payload.get_u32_le();
            entry.index_map.insert(ordinal, dba);
        }
        self.lob_owners.entry(xid).or_default().insert(lob_id);
        Ok(())
    }

    /// Stores a data page; the DBA comes from the carrying vector.
    pub fn add_data(&mut self, xid: Xid, dba: Dba, payload: Bytes) {
        self.data_map.insert(dba, payload);
        self.data_owners.entry(xid).or_default().push(dba);
    }

    /// Materializes a locator into chunks.
    ///
    /// `Ok(None)` means pages are still missing; the caller may retry
    /// when more vectors have arrived and must drop the value (with a
    /// warning) if the transaction has already committed. A size
    /// mismatch is a recoverable error: only this value is lost.
    pub fn materialize(&self, locator: &LobLocator) -> Result<Option<LobValue>> {
        if locator.flg2 & FLG2_INLINE != 0 {
            if locator.body.len() as u64 != locator.size {
                return Err(size_mismatch(locator, locator.body.len() as u64));
            }
            return Ok(Some(LobValue::from_pages(vec![locator.body.clone()])));
        }

        if locator.flg2 & FLG2_IN_INDEX != 0 {
            return self.materialize_indexed(locator);
        }

        if locator.flg2 & FLG2_IN_VALUE != 0 {
            return self.materialize_in_value(locator);
        }

        self.materialize_in_row(locator)
    }

    /// Drops all state owned by a finished transaction. Unresolved
    /// entries at this point are orphans.
    pub fn reap(&mut self, xid: Xid) {
        if let Some(ids) = self.lob_owners.remove(&xid) {
            for id in ids {
                if self.lobs.remove(&id).is_some() {
                    debug!(lob = %id, %xid, "reaped lob index state");
                }
            }
        }
        if let Some(dbas) = self.data_owners.remove(&xid) {
            for dba in dbas {
                self.data_map.remove(&dba);
            }
        }
    }

    fn materialize_indexed(&self, locator: &LobLocator) -> Result<Option<LobValue>> {
        let Some(index) = self.lobs.get(&locator.lob_id) else {
            return Ok(None);
        };
        if index.page_size == 0 {
            return Ok(None);
        }
        let declared_pages = index.size_pages as usize + usize::from(index.size_rest > 0);
        if index.index_map.len() < declared_pages {
            return Ok(None);
        }

        let mut pages = Vec::with_capacity(index.index_map.len());
        for (i, (_, dba)) in index.index_map.iter().enumerate() {
            let Some(page) = self.data_map.get(dba) else {
                return Ok(None);
            };
            let want = if i + 1 == declared_pages && index.size_rest > 0 {
                index.size_rest as usize
            } else {
                index.page_size as usize
            };
            if page.len() < want {
                return Err(size_mismatch(locator, page.len() as u64));
            }
            pages.push(page.slice(..want));
        }

        let value = LobValue::from_pages(pages);
        if value.len() as u64 != locator.size {
            return Err(size_mismatch(locator, value.len() as u64));
        }
        Ok(Some(value))
    }

    /// In-value layout: `{page_size u32}` then either an inline run list
    /// `{count u16, {dba, pages}*}` or a chained root `{dba u32}`.
    fn materialize_in_value(&self, locator: &LobLocator) -> Result<Option<LobValue>> {
        let mut body = locator.body.clone();
        if body.remaining() < 4 {
            return Err(Error::redo(60005, "in-value lob body truncated"));
        }
        let page_size = body.get_u32_le() as usize;
        if page_size == 0 {
            return Err(Error::redo(60005, "in-value lob with zero page size"));
        }

        let runs = match locator.flg3 & 0xF0 {
            FLG3_RUNS_INLINE => {
                if body.remaining() < 2 {
                    return Err(Error::redo(60005, "in-value run list truncated"));
                }
                let count = body.get_u16_le();
                let mut runs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    if body.remaining() < 8 {
                        return Err(Error::redo(60005, "in-value run truncated"));
                    }
                    runs.push((body.get_u32_le(), body.get_u32_le()));
                }
                runs
            }
            FLG3_RUNS_CHAINED => {
                if body.remaining() < 4 {
                    return Err(Error::redo(60005, "in-value chain root truncated"));
                }
                match self.chase_list_pages(body.get_u32_le())? {
                    Some(runs) => runs,
                    None => return Ok(None),
                }
            }
            other => {
                return Err(Error::redo(60005, format!("unknown in-value layout: {other:#04x}")));
            }
        };

        self.collect_run_pages(locator, page_size, &runs)
    }

    /// In-row layout (no inline bit): `{page_cnt u32, size_rest u32,
    /// page_size u32, chained u8}` then DBAs or a chain root.
    fn materialize_in_row(&self, locator: &LobLocator) -> Result<Option<LobValue>> {
        let mut body = locator.body.clone();
        if body.remaining() < 13 {
            return Err(Error::redo(60005, "in-row lob body truncated"));
        }
        let page_cnt = body.get_u32_le();
        let size_rest = body.get_u32_le();
        let page_size = body.get_u32_le() as usize;
        let chained = body.get_u8() != 0;
        if page_size == 0 && page_cnt > 0 {
            return Err(Error::redo(60005, "in-row lob with zero page size"));
        }

        let dbas: Vec<Dba> = if chained {
            if body.remaining() < 4 {
                return Err(Error::redo(60005, "in-row chain root truncated"));
            }
            match self.chase_list_pages(body.get_u32_le())? {
                Some(runs) => runs
                    .iter()
                    .flat_map(|&(dba, pages)| (0..pages).map(move |i| dba + i))
                    .collect(),
                None => return Ok(None),
            }
        } else {
            if body.remaining() < page_cnt as usize * 4 {
                return Err(Error::redo(60005, "in-row page list truncated"));
            }
            (0..page_cnt).map(|_| body.get_u32_le()).collect()
        };

        let mut pages = Vec::with_capacity(dbas.len());
        for (i, dba) in dbas.iter().enumerate() {
            let Some(page) = self.data_map.get(dba) else {
                return Ok(None);
            };
            let want = if i + 1 == dbas.len() && size_rest > 0 {
                size_rest as usize
            } else {
                page_size
            };
            if page.len() < want {
                return Err(size_mismatch(locator, page.len() as u64));
            }
            pages.push(page.slice(..want));
        }

        let value = LobValue::from_pages(pages);
        if value.len() as u64 != locator.size {
            return Err(size_mismatch(locator, value.len() as u64));
        }
        Ok(Some(value))
    }

    /// Follows a chain of list pages, each `{next u32, count u32,
    /// {dba, pages}*}`, gathering the runs in order.
    fn chase_list_pages(&self, root: Dba) -> Result<Option<Vec<(Dba, u32)>>> {
        let mut runs = Vec::new();
        let mut next = root;
        let mut visited = HashSet::new();
        while next != 0 {
            if !visited.insert(next) {
                return Err(Error::redo(60005, format!("lob list page cycle at dba {next}")));
            }
            let Some(page) = self.data_map.get(&next) else {
                return Ok(None);
            };
            let mut page = page.clone();
            if page.remaining() < 8 {
                return Err(Error::redo(60005, "lob list page truncated"));
            }
            let following = page.get_u32_le();
            let count = page.get_u32_le();
            for _ in 0..count {
                if page.remaining() < 8 {
                    return Err(Error::redo(60005, "lob list entry truncated"));
                }
                runs.push((page.get_u32_le(), page.get_u32_le()));
            }
            next = following;
        }
        Ok(Some(runs))
    }

    fn collect_run_pages(
        &self,
        locator: &LobLocator,
        page_size: usize,
        runs: &[(Dba, u32)],
    ) -> Result<Option<LobValue>> {
        let total_pages: u32 = runs.iter().map(|&(_, pages)| pages).sum();
        let mut pages = Vec::with_capacity(total_pages as usize);
        let mut remaining = locator.size;
        for &(dba, count) in runs {
            for i in 0..count {
                let Some(page) = self.data_map.get(&(dba + i)) else {
                    return Ok(None);
                };
                let want = (remaining as usize).min(page_size);
                if page.len() < want {
                    return Err(size_mismatch(locator, page.len() as u64));
                }
                pages.push(page.slice(..want));
                remaining = remaining.saturating_sub(want as u64);
            }
        }
        if remaining != 0 {
            return Err(size_mismatch(locator, locator.size - remaining));
        }
        Ok(Some(LobValue::from_pages(pages)))
    }
}

fn size_mismatch(locator: &LobLocator, got: u64) -> Error {
    warn!(lob = %locator.lob_id, declared = locator.size, got, "lob size mismatch, dropping value");
    Error::redo(
        60007,
        format!("lob {} size mismatch: declared {}, assembled {got}", locator.lob_id, locator.size),
    )
}
