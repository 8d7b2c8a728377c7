//! The one outward call the core makes into a host economy.

/// Receives coins earned by completing a level.
pub trait CoinSink: Send {
    fn earn_coins(&mut self, amount: u32);
}

/// Coins paid for finishing a block-coding level worth `xp`.
pub fn coins_for_xp(xp: u32) -> u32 {
    xp / 2
}

/// In-process balance.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Wallet {
    balance: u64,
    payouts: u32,
}

impl Wallet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self) -> u64 {
        self.balance
    }

    /// Number of `earn_coins` calls received.
    pub fn payouts(&self) -> u32 {
        self.payouts
    }
}

impl CoinSink for Wallet {
    fn earn_coins(&mut self, amount: u32) {
        self.balance = self.balance.saturating_add(u64::from(amount));
        self.payouts += 1;
        tracing::debug!(amount, balance = self.balance, "coins earned");
    }
}

impl<S: CoinSink + ?Sized> CoinSink for Box<S> {
    fn earn_coins(&mut self, amount: u32) {
        (**self).earn_coins(amount)
    }
}
