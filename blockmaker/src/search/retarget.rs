//! Header time and difficulty refresh during a search.

use bitcoin::block::Header;

use crate::chain::{ChainIndex, ChainTip, NetworkStatus};

/// Keeps a header's timestamp current while it is being searched.
pub struct DifficultyRetargeter<'a> {
    chain: &'a dyn ChainIndex,
    network: &'a dyn NetworkStatus,
}

impl<'a> DifficultyRetargeter<'a> {
    pub fn new(chain: &'a dyn ChainIndex, network: &'a dyn NetworkStatus) -> Self {
        Self { chain, network }
    }

    /// Move `header.time` up to `max(median time past + 1, adjusted time)`.
    ///
    /// The time never moves backwards. Where the network allows minimum
    /// difficulty blocks the new time can change the required work, so the
    /// bits are recomputed as well.
    pub fn refresh_time(&self, header: &mut Header, tip: &ChainTip) {
        let time = tip.min_time().max(self.network.adjusted_time());
        if time > header.time {
            header.time = time;
        }

        if self.network.allows_min_difficulty() {
            header.bits = self.chain.next_work_required(tip, header.time);
        }
    }
}
