//! Chain rules the block assembler must respect.
//!
//! These are network-wide consensus values, as opposed to the local mining
//! policy in [`crate::config`].

use bitcoin::Amount;
use bitcoin::opcodes::all::OP_PUSHNUM_16;
use bitcoin::script::{Instruction, Script};
use bitcoin::{OutPoint, ScriptBuf, Transaction};

/// Satoshis per coin.
pub const COIN: u64 = 100_000_000;

/// Maximum serialized block size in bytes.
pub const MAX_BLOCK_SIZE: u32 = 4_000_000;

/// Maximum signature operations per block.
pub const MAX_BLOCK_SIGOPS: u32 = MAX_BLOCK_SIZE / 50;

/// Largest amount any single value or sum may take.
pub const MAX_MONEY: Amount = Amount::from_sat(30_000_000_000 * COIN);

/// Protocol limit on the coinbase input script.
pub const MAX_COINBASE_SCRIPT_SIG: usize = 100;

/// Lock times below this are block heights, at or above are UNIX times.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Per-block reward schedule.
///
/// The chain pays a flat reward for an initial run of blocks and nothing but
/// fees afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubsidySchedule {
    /// Reward paid by each block in the reward period.
    pub per_block: Amount,

    /// Last height that carries a reward.
    pub reward_blocks: u32,
}

impl SubsidySchedule {
    pub fn subsidy_at(&self, height: u32) -> Amount {
        if (1..=self.reward_blocks).contains(&height) {
            self.per_block
        } else {
            Amount::ZERO
        }
    }
}

impl Default for SubsidySchedule {
    fn default() -> Self {
        Self {
            per_block: Amount::from_sat(10_000_000 * COIN),
            reward_blocks: 3_000,
        }
    }
}

/// Consensus parameters consulted while building a block.
#[derive(Debug, Clone)]
pub struct ConsensusParams {
    pub max_block_size: u32,
    pub max_block_sigops: u32,
    pub max_money: Amount,
    pub subsidy: SubsidySchedule,
}

impl ConsensusParams {
    pub fn money_range(&self, value: Amount) -> bool {
        value <= self.max_money
    }
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            max_block_size: MAX_BLOCK_SIZE,
            max_block_sigops: MAX_BLOCK_SIGOPS,
            max_money: MAX_MONEY,
            subsidy: SubsidySchedule::default(),
        }
    }
}

/// Whether `tx` may be included in a block at `height` with time `block_time`.
pub fn is_final_tx(tx: &Transaction, height: u32, block_time: u32) -> bool {
    let lock_time = tx.lock_time.to_consensus_u32();
    if lock_time == 0 {
        return true;
    }

    let reference = if lock_time < LOCKTIME_THRESHOLD {
        height
    } else {
        block_time
    };
    if lock_time < reference {
        return true;
    }

    tx.input.iter().all(|input| input.sequence.is_final())
}

/// Signature operations counted without looking at spent outputs.
pub fn legacy_sigops(tx: &Transaction) -> u32 {
    let inputs: usize = tx
        .input
        .iter()
        .map(|input| input.script_sig.count_sigops_legacy())
        .sum();
    let outputs: usize = tx
        .output
        .iter()
        .map(|output| output.script_pubkey.count_sigops_legacy())
        .sum();
    (inputs + outputs) as u32
}

/// Signature operations in redeem scripts of inputs spending P2SH outputs.
///
/// `spent_script` resolves an outpoint to the script it locks; unresolved
/// inputs contribute nothing.
pub fn p2sh_sigops<F>(tx: &Transaction, spent_script: F) -> u32
where
    F: Fn(&OutPoint) -> Option<ScriptBuf>,
{
    if tx.is_coinbase() {
        return 0;
    }

    tx.input
        .iter()
        .filter(|input| {
            spent_script(&input.previous_output).is_some_and(|script| script.is_p2sh())
        })
        .map(|input| redeem_script_sigops(&input.script_sig) as u32)
        .sum()
}

/// Accurate sigop count of the redeem script, the final push of `script_sig`.
fn redeem_script_sigops(script_sig: &Script) -> usize {
    let mut redeem: Option<&[u8]> = None;
    for instruction in script_sig.instructions() {
        match instruction {
            Ok(Instruction::PushBytes(bytes)) => redeem = Some(bytes.as_bytes()),
            Ok(Instruction::Op(op)) if op.to_u8() <= OP_PUSHNUM_16.to_u8() => {
                redeem = Some(&[][..])
            }
            // Not push-only: a spend like this fails verification anyway.
            Ok(Instruction::Op(_)) | Err(_) => return 0,
        }
    }
    redeem.map_or(0, |bytes| Script::from_bytes(bytes).count_sigops())
}
