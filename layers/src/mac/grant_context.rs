//! Grant Context Store
//!
//! Frame-periodic tables of issued grants waiting for their air time:
//! DL transmission contexts, UL reception contexts and DL HARQ feedback
//! expectations. Rows are UEs, columns are symbols within the frame (times
//! the HARQ process count for feedback). Each entry remembers the absolute
//! slot it was issued for, so an entry left over from an older frame is
//! superseded while a second entry for the same slot is a collision.

use crate::LayerError;
use common::types::Rnti;
use interfaces::message_types::Grant;
use ndarray::Array2;
use tracing::trace;

/// A grant parked until its first symbol comes up
#[derive(Debug, Clone, PartialEq)]
pub struct GrantContext {
    /// Absolute slot the transmission belongs to
    pub absolute_slot: u64,
    pub grant: Grant,
    /// Transport block size in bytes
    pub tbs: u32,
    /// Resource blocks covered by the RBG allocation
    pub resource_blocks: Vec<u16>,
}

/// Pending contexts for one cell
#[derive(Debug, Clone)]
pub struct GrantContextStore {
    tx: Array2<Option<GrantContext>>,
    rx: Array2<Option<GrantContext>>,
    /// Absolute slot of the expected feedback, `[ue][symbol * num_harq + harq_id]`
    feedback: Array2<Option<u64>>,
    num_harq: usize,
    symbols_per_frame: usize,
}

impl GrantContextStore {
    pub fn new(num_ues: usize, symbols_per_frame: usize, num_harq: usize) -> Self {
        Self {
            tx: Array2::default((num_ues, symbols_per_frame)),
            rx: Array2::default((num_ues, symbols_per_frame)),
            feedback: Array2::default((num_ues, symbols_per_frame * num_harq)),
            num_harq,
            symbols_per_frame,
        }
    }

    pub fn symbols_per_frame(&self) -> usize {
        self.symbols_per_frame
    }

    /// Park a DL grant at its transmission start symbol
    pub fn insert_tx(&mut self, symbol: usize, context: GrantContext) -> Result<(), LayerError> {
        Self::insert(&mut self.tx, "DL transmission", symbol, context)
    }

    /// Park an UL grant at its reception start symbol
    pub fn insert_rx(&mut self, symbol: usize, context: GrantContext) -> Result<(), LayerError> {
        Self::insert(&mut self.rx, "UL reception", symbol, context)
    }

    /// Take the DL transmission due at `symbol` of `absolute_slot`
    pub fn take_tx(&mut self, rnti: Rnti, symbol: usize, absolute_slot: u64) -> Option<GrantContext> {
        Self::take(&mut self.tx, rnti, symbol, absolute_slot)
    }

    /// Take the UL reception due at `symbol` of `absolute_slot`
    pub fn take_rx(&mut self, rnti: Rnti, symbol: usize, absolute_slot: u64) -> Option<GrantContext> {
        Self::take(&mut self.rx, rnti, symbol, absolute_slot)
    }

    /// Expect HARQ feedback for `harq_id` at `symbol` of `absolute_slot`
    pub fn insert_feedback(
        &mut self,
        rnti: Rnti,
        symbol: usize,
        harq_id: u8,
        absolute_slot: u64,
    ) -> Result<(), LayerError> {
        let column = self.feedback_column(symbol, harq_id);
        let entry = rnti
            .ue_index()
            .and_then(|row| self.feedback.get_mut((row, column)))
            .ok_or(LayerError::UnknownUe(rnti))?;

        match entry {
            Some(existing) if *existing == absolute_slot => Err(LayerError::GrantContextCollision {
                kind: "DL feedback",
                rnti,
                symbol,
            }),
            _ => {
                if let Some(stale) = entry.replace(absolute_slot) {
                    trace!(
                        "Superseded DL feedback context rnti={} symbol={} harq_id={} from slot {}",
                        rnti, symbol, harq_id, stale
                    );
                }
                Ok(())
            }
        }
    }

    /// Clear the feedback expectation for `harq_id` within the given symbol
    /// range of `absolute_slot`. Returns the symbol it was found at.
    pub fn take_feedback(
        &mut self,
        rnti: Rnti,
        harq_id: u8,
        symbols: std::ops::Range<usize>,
        absolute_slot: u64,
    ) -> Option<usize> {
        if harq_id as usize >= self.num_harq {
            return None;
        }
        let row = rnti.ue_index()?;
        for symbol in symbols {
            let column = self.feedback_column(symbol, harq_id);
            if let Some(entry) = self.feedback.get_mut((row, column)) {
                if *entry == Some(absolute_slot) {
                    *entry = None;
                    return Some(symbol);
                }
            }
        }
        None
    }

    /// Occupied (tx, rx, feedback) entries, stale ones included
    pub fn occupancy(&self) -> (usize, usize, usize) {
        (
            self.tx.iter().filter(|e| e.is_some()).count(),
            self.rx.iter().filter(|e| e.is_some()).count(),
            self.feedback.iter().filter(|e| e.is_some()).count(),
        )
    }

    fn feedback_column(&self, symbol: usize, harq_id: u8) -> usize {
        symbol * self.num_harq + harq_id as usize
    }

    fn insert(
        table: &mut Array2<Option<GrantContext>>,
        kind: &'static str,
        symbol: usize,
        context: GrantContext,
    ) -> Result<(), LayerError> {
        let rnti = context.grant.rnti;
        let entry = rnti
            .ue_index()
            .and_then(|row| table.get_mut((row, symbol)))
            .ok_or(LayerError::UnknownUe(rnti))?;

        if let Some(existing) = entry {
            if existing.absolute_slot == context.absolute_slot {
                return Err(LayerError::GrantContextCollision { kind, rnti, symbol });
            }
            trace!(
                "Superseded {} context rnti={} symbol={} from slot {}",
                kind, rnti, symbol, existing.absolute_slot
            );
        }
        *entry = Some(context);
        Ok(())
    }

    fn take(
        table: &mut Array2<Option<GrantContext>>,
        rnti: Rnti,
        symbol: usize,
        absolute_slot: u64,
    ) -> Option<GrantContext> {
        let entry = table.get_mut((rnti.ue_index()?, symbol))?;
        match entry {
            Some(context) if context.absolute_slot == absolute_slot => entry.take(),
            _ => None,
        }
    }
}
