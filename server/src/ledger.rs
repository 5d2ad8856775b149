//! Wagering ledger
//!
//! Tracks each in-game identity's wallet balance and at-risk pot, and moves
//! money between them and an external balance provider. Every operation for an
//! identity runs under that identity's lock; operations that cannot take all of
//! their locks immediately fail with [`LedgerError::Contended`] instead of waiting.
//!
//! External writes always happen before the in-memory record changes, so a
//! provider failure leaves the ledger exactly as it was.

use dashmap::DashMap;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use shared::{FailureReason, UserId, ENTRY_FEE};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("balance provider unavailable")]
    Unavailable,
    #[error("balance provider rejected the request: {0}")]
    Rejected(String),
}

/// External store of user balances
///
/// Implementations must tolerate concurrent calls for distinct identities.
/// Calls for the same identity are serialised by the ledger.
pub trait BalanceProvider: Send + Sync {
    fn fetch_balance<'a>(&'a self, user: &'a str) -> BoxFuture<'a, Result<u64, ProviderError>>;

    fn persist_balance<'a>(
        &'a self,
        user: &'a str,
        balance: u64,
    ) -> BoxFuture<'a, Result<(), ProviderError>>;
}

/// In-process balance store with a default starting balance per user
pub struct MemoryBalanceProvider {
    balances: DashMap<UserId, u64>,
    starting_balance: u64,
    latency: Duration,
    available: AtomicBool,
}

impl MemoryBalanceProvider {
    pub fn new(starting_balance: u64) -> Self {
        Self {
            balances: DashMap::new(),
            starting_balance,
            latency: Duration::ZERO,
            available: AtomicBool::new(true),
        }
    }

    /// Adds a simulated round trip to every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_balance(&self, user: &str, balance: u64) {
        self.balances.insert(user.to_string(), balance);
    }

    pub fn balance(&self, user: &str) -> u64 {
        self.balances
            .get(user)
            .map(|b| *b)
            .unwrap_or(self.starting_balance)
    }

    /// While unavailable every call fails with [`ProviderError::Unavailable`]
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    async fn round_trip(&self) -> Result<(), ProviderError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProviderError::Unavailable)
        }
    }
}

impl BalanceProvider for MemoryBalanceProvider {
    fn fetch_balance<'a>(&'a self, user: &'a str) -> BoxFuture<'a, Result<u64, ProviderError>> {
        Box::pin(async move {
            self.round_trip().await?;
            Ok(self.balance(user))
        })
    }

    fn persist_balance<'a>(
        &'a self,
        user: &'a str,
        balance: u64,
    ) -> BoxFuture<'a, Result<(), ProviderError>> {
        Box::pin(async move {
            self.round_trip().await?;
            self.set_balance(user, balance);
            Ok(())
        })
    }
}

/// Per-identity locks, created on first use and dropped once released
#[derive(Clone, Default)]
pub struct LockTable {
    locks: Arc<DashMap<UserId, Arc<Mutex<()>>>>,
}

/// Holds one identity's lock until dropped
pub struct IdentityGuard {
    user: UserId,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<UserId, Arc<Mutex<()>>>>,
}

impl IdentityGuard {
    pub fn user(&self) -> &str {
        &self.user
    }
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Only the table itself still references the mutex: nobody holds or awaits it
        self.locks
            .remove_if(&self.user, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock for `user` if it is free
    pub fn try_acquire(&self, user: &str) -> Option<IdentityGuard> {
        let lock = self.locks.entry(user.to_string()).or_default().clone();
        let guard = lock.try_lock_owned().ok()?;
        Some(IdentityGuard {
            user: user.to_string(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        })
    }

    /// Takes the locks for every listed identity, in sorted order, or none of them
    pub fn try_acquire_all(&self, users: &[&str]) -> Option<Vec<IdentityGuard>> {
        let mut ordered: Vec<&str> = users.to_vec();
        ordered.sort_unstable();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for user in ordered {
            guards.push(self.try_acquire(user)?);
        }
        Some(guards)
    }

    pub fn is_held(&self, user: &str) -> bool {
        self.locks
            .get(user)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of identities with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("user id missing")]
    MissingIdentity,
    #[error("already in game")]
    AlreadyInGame,
    #[error("insufficient funds: have {balance}, need {required}")]
    InsufficientFunds { balance: u64, required: u64 },
    #[error("not in game")]
    NotInGame,
    #[error("another wallet operation holds the lock")]
    Contended,
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl From<&LedgerError> for FailureReason {
    fn from(err: &LedgerError) -> Self {
        match err {
            LedgerError::MissingIdentity => FailureReason::MissingIdentity,
            LedgerError::AlreadyInGame => FailureReason::AlreadyInGame,
            LedgerError::InsufficientFunds { balance, required } => {
                FailureReason::InsufficientFunds {
                    balance: *balance,
                    required: *required,
                }
            }
            LedgerError::NotInGame => FailureReason::NotInGame,
            LedgerError::Contended => FailureReason::Busy,
            LedgerError::Provider(_) => FailureReason::ProviderUnavailable,
        }
    }
}

/// Wallet and pot as seen by the player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stake {
    pub wallet_balance: u64,
    pub pot: u64,
}

#[derive(Debug, Clone)]
struct Account {
    session: u32,
    wallet_balance: u64,
    pot: u64,
    /// Session ended while an operation held the lock
    closed: bool,
}

impl Account {
    fn stake(&self) -> Stake {
        Stake {
            wallet_balance: self.wallet_balance,
            pot: self.pot,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CashOut {
    pub cashed_out: u64,
    pub stake: Stake,
}

/// Outcome of moving a victim's pot on elimination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KillSettlement {
    /// Victim's stake after the kill; `None` if the victim had no account
    pub victim: Option<Stake>,
    /// Killer's stake after the kill; `None` if there was no live killer account
    pub killer: Option<Stake>,
    pub transferred: u64,
    pub forfeited: u64,
}

pub struct Ledger {
    provider: Arc<dyn BalanceProvider>,
    locks: LockTable,
    accounts: DashMap<UserId, Account>,
    entry_fee: u64,
    forfeited: AtomicU64,
}

impl Ledger {
    pub fn new(provider: Arc<dyn BalanceProvider>, entry_fee: u64) -> Self {
        Self {
            provider,
            locks: LockTable::new(),
            accounts: DashMap::new(),
            entry_fee,
            forfeited: AtomicU64::new(0),
        }
    }

    pub fn with_default_fee(provider: Arc<dyn BalanceProvider>) -> Self {
        Self::new(provider, ENTRY_FEE)
    }

    pub fn entry_fee(&self) -> u64 {
        self.entry_fee
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Current stake of an identity, if it is in game
    pub fn stake(&self, user: &str) -> Option<Stake> {
        self.accounts.get(user).map(|a| a.stake())
    }

    /// Current stake of an identity, if it is in game under `session`
    pub fn session_stake(&self, user: &str, session: u32) -> Option<Stake> {
        self.accounts
            .get(user)
            .filter(|a| a.session == session)
            .map(|a| a.stake())
    }

    pub fn in_game(&self, user: &str) -> bool {
        self.accounts.contains_key(user)
    }

    /// Sum of all pots currently at risk
    pub fn total_pot(&self) -> u64 {
        self.accounts.iter().map(|a| a.pot).sum()
    }

    /// Stake lost to killerless deaths and abandoned sessions
    pub fn forfeited_total(&self) -> u64 {
        self.forfeited.load(Ordering::SeqCst)
    }

    /// Pays the entry fee out of the external balance and opens a pot
    pub async fn join(&self, user: &str, session: u32) -> Result<Stake, LedgerError> {
        if user.trim().is_empty() {
            return Err(LedgerError::MissingIdentity);
        }
        let _guard = self.locks.try_acquire(user).ok_or(LedgerError::Contended)?;

        let result = self.join_locked(user, session).await;
        self.reap_closed(user);
        result
    }

    async fn join_locked(&self, user: &str, session: u32) -> Result<Stake, LedgerError> {
        let already = self
            .accounts
            .get(user)
            .map(|a| a.session == session && !a.closed)
            .unwrap_or(false);
        if already {
            return Err(LedgerError::AlreadyInGame);
        }

        // A pot left behind by a session that is gone goes back to the wallet
        let stale_pot = self
            .accounts
            .get(user)
            .filter(|a| a.session != session)
            .map(|a| a.pot)
            .unwrap_or(0);

        let balance = self
            .provider
            .fetch_balance(user)
            .await?
            .saturating_add(stale_pot);
        if balance < self.entry_fee {
            return Err(LedgerError::InsufficientFunds {
                balance,
                required: self.entry_fee,
            });
        }

        let wallet_balance = balance - self.entry_fee;
        self.provider.persist_balance(user, wallet_balance).await?;

        let account = Account {
            session,
            wallet_balance,
            pot: self.entry_fee,
            closed: false,
        };
        let stake = account.stake();
        if let Some(stale) = self.accounts.insert(user.to_string(), account) {
            if stale.pot > 0 {
                info!(
                    "Returned pot {} of stale session {} to {}",
                    stale.pot, stale.session, user
                );
            }
        }

        info!(
            "{} joined (session {}): wallet {}, pot {}",
            user, session, stake.wallet_balance, stake.pot
        );
        Ok(stake)
    }

    /// Moves the whole pot into the wallet and persists the new balance
    ///
    /// An empty pot is not an error: the current balances are reported unchanged.
    pub async fn cash_out(&self, user: &str, session: u32) -> Result<CashOut, LedgerError> {
        if user.trim().is_empty() {
            return Err(LedgerError::MissingIdentity);
        }
        let _guard = self.locks.try_acquire(user).ok_or(LedgerError::Contended)?;

        let result = self.cash_out_locked(user, session).await;
        self.reap_closed(user);
        result
    }

    async fn cash_out_locked(&self, user: &str, session: u32) -> Result<CashOut, LedgerError> {
        let current = self
            .session_stake(user, session)
            .ok_or(LedgerError::NotInGame)?;

        if current.pot == 0 {
            return Ok(CashOut {
                cashed_out: 0,
                stake: current,
            });
        }

        let wallet_balance = current.wallet_balance.saturating_add(current.pot);
        self.provider.persist_balance(user, wallet_balance).await?;

        if let Some(mut account) = self.accounts.get_mut(user) {
            if account.session == session {
                account.wallet_balance = wallet_balance;
                account.pot = 0;
            }
        }

        info!("{} cashed out {} (wallet {})", user, current.pot, wallet_balance);
        Ok(CashOut {
            cashed_out: current.pot,
            stake: Stake {
                wallet_balance,
                pot: 0,
            },
        })
    }

    /// Moves the victim's pot to the killer and closes the victim's account
    ///
    /// Both identities are locked in sorted order. If either lock is taken the
    /// whole transfer is abandoned and nothing changes. A killer that is the
    /// victim's own identity, or that has no account, forfeits the pot.
    pub fn kill_transfer(
        &self,
        victim: (&str, u32),
        killer: Option<(&str, u32)>,
    ) -> Result<KillSettlement, LedgerError> {
        let killer = killer.filter(|(user, _)| *user != victim.0);

        let mut users = vec![victim.0];
        if let Some((user, _)) = killer {
            users.push(user);
        }
        let _guards = self
            .locks
            .try_acquire_all(&users)
            .ok_or(LedgerError::Contended)?;

        let mut settlement = KillSettlement::default();

        let victim_account = self
            .accounts
            .remove_if(victim.0, |_, a| a.session == victim.1)
            .map(|(_, a)| a);
        let Some(victim_account) = victim_account else {
            return Ok(settlement);
        };
        let pot = victim_account.pot;
        settlement.victim = Some(Stake {
            wallet_balance: victim_account.wallet_balance,
            pot: 0,
        });

        let credited = killer.and_then(|(user, session)| {
            let mut account = self.accounts.get_mut(user)?;
            if account.session != session || account.closed {
                return None;
            }
            account.pot += pot;
            Some(account.stake())
        });

        match credited {
            Some(stake) => {
                settlement.killer = Some(stake);
                settlement.transferred = pot;
                debug!(
                    "Transferred pot {} from {} to {}",
                    pot,
                    victim.0,
                    killer.map(|(u, _)| u).unwrap_or_default()
                );
            }
            None => {
                self.forfeit(victim.0, pot);
                settlement.forfeited = pot;
            }
        }

        Ok(settlement)
    }

    /// Ends an identity's game, forfeiting whatever is left in its pot
    ///
    /// If an operation for the identity is in flight the account is only
    /// marked; the operation removes it when it finishes.
    pub fn close_account(&self, user: &str, session: u32) -> Option<u64> {
        match self.locks.try_acquire(user) {
            Some(_guard) => {
                let (_, account) = self
                    .accounts
                    .remove_if(user, |_, a| a.session == session)?;
                self.forfeit(user, account.pot);
                Some(account.pot)
            }
            None => {
                if let Some(mut account) = self.accounts.get_mut(user) {
                    if account.session == session {
                        account.closed = true;
                    }
                }
                None
            }
        }
    }

    fn reap_closed(&self, user: &str) {
        if let Some((_, account)) = self.accounts.remove_if(user, |_, a| a.closed) {
            self.forfeit(user, account.pot);
        }
    }

    fn forfeit(&self, user: &str, amount: u64) {
        if amount == 0 {
            return;
        }
        let total = self.forfeited.fetch_add(amount, Ordering::SeqCst) + amount;
        warn!("Forfeited {} from {} (total forfeited {})", amount, user, total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn ledger_with(provider: Arc<MemoryBalanceProvider>) -> Ledger {
        Ledger::new(provider, 100)
    }

    #[tokio::test]
    async fn test_join_with_exact_fee() {
        let provider = Arc::new(MemoryBalanceProvider::new(0));
        provider.set_balance("alice", 100);
        let ledger = ledger_with(provider.clone());

        let stake = assert_ok!(ledger.join("alice", 1).await);
        assert_eq!(stake, Stake { wallet_balance: 0, pot: 100 });
        assert_eq!(provider.balance("alice"), 0);
        assert!(ledger.in_game("alice"));
    }

    #[tokio::test]
    async fn test_join_one_below_fee_fails_untouched() {
        let provider = Arc::new(MemoryBalanceProvider::new(0));
        provider.set_balance("bob", 99);
        let ledger = ledger_with(provider.clone());

        let err = ledger.join("bob", 1).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientFunds {
                balance: 99,
                required: 100
            }
        );
        assert_eq!(provider.balance("bob"), 99);
        assert!(!ledger.in_game("bob"));
    }

    #[tokio::test]
    async fn test_join_preconditions() {
        let provider = Arc::new(MemoryBalanceProvider::new(500));
        let ledger = ledger_with(provider.clone());

        assert_eq!(ledger.join("  ", 1).await, Err(LedgerError::MissingIdentity));

        assert_ok!(ledger.join("carol", 1).await);
        assert_eq!(ledger.join("carol", 1).await, Err(LedgerError::AlreadyInGame));
        assert_eq!(provider.balance("carol"), 400);
    }

    #[tokio::test]
    async fn test_join_provider_failure_leaves_state() {
        let provider = Arc::new(MemoryBalanceProvider::new(500));
        provider.set_available(false);
        let ledger = ledger_with(provider.clone());

        let err = ledger.join("dave", 1).await.unwrap_err();
        assert_eq!(err, LedgerError::Provider(ProviderError::Unavailable));
        assert!(!ledger.in_game("dave"));
        assert!(ledger.locks().is_empty());

        provider.set_available(true);
        assert_eq!(provider.balance("dave"), 500);
    }

    #[tokio::test]
    async fn test_cash_out_moves_pot() {
        let provider = Arc::new(MemoryBalanceProvider::new(300));
        let ledger = ledger_with(provider.clone());

        assert_ok!(ledger.join("erin", 1).await);
        let result = assert_ok!(ledger.cash_out("erin", 1).await);
        assert_eq!(result.cashed_out, 100);
        assert_eq!(result.stake, Stake { wallet_balance: 300, pot: 0 });
        assert_eq!(provider.balance("erin"), 300);
        assert_eq!(ledger.stake("erin"), Some(result.stake));
    }

    #[tokio::test]
    async fn test_cash_out_empty_pot_is_reported_noop() {
        let provider = Arc::new(MemoryBalanceProvider::new(300));
        let ledger = ledger_with(provider.clone());

        assert_ok!(ledger.join("erin", 1).await);
        assert_ok!(ledger.cash_out("erin", 1).await);

        let again = assert_ok!(ledger.cash_out("erin", 1).await);
        assert_eq!(again.cashed_out, 0);
        assert_eq!(again.stake, Stake { wallet_balance: 300, pot: 0 });
    }

    #[tokio::test]
    async fn test_cash_out_requires_game() {
        let provider = Arc::new(MemoryBalanceProvider::new(300));
        let ledger = ledger_with(provider);

        assert_eq!(ledger.cash_out("frank", 1).await, Err(LedgerError::NotInGame));

        assert_ok!(ledger.join("frank", 1).await);
        // Another session of the same identity does not own the pot
        assert_eq!(ledger.cash_out("frank", 2).await, Err(LedgerError::NotInGame));
    }

    #[tokio::test]
    async fn test_cash_out_provider_failure_keeps_pot() {
        let provider = Arc::new(MemoryBalanceProvider::new(300));
        let ledger = ledger_with(provider.clone());

        assert_ok!(ledger.join("gina", 1).await);
        provider.set_available(false);

        let err = ledger.cash_out("gina", 1).await.unwrap_err();
        assert!(matches!(err, LedgerError::Provider(_)));
        assert_eq!(ledger.stake("gina"), Some(Stake { wallet_balance: 200, pot: 100 }));
        assert_eq!(provider.balance("gina"), 200);
    }

    #[tokio::test]
    async fn test_kill_transfer_conserves_pot() {
        let provider = Arc::new(MemoryBalanceProvider::new(1000));
        let ledger = ledger_with(provider);

        assert_ok!(ledger.join("killer", 1).await);
        assert_ok!(ledger.join("victim", 2).await);
        // Give the victim a bigger pot from an earlier kill
        assert_ok!(ledger.join("third", 3).await);
        assert_ok!(ledger.kill_transfer(("third", 3), Some(("victim", 2))));
        let before = ledger.total_pot();

        let settlement = assert_ok!(ledger.kill_transfer(("victim", 2), Some(("killer", 1))));
        assert_eq!(settlement.transferred, 200);
        assert_eq!(settlement.killer.map(|s| s.pot), Some(300));
        assert_eq!(settlement.victim.map(|s| s.pot), Some(0));
        assert_eq!(ledger.total_pot(), before);
        assert!(!ledger.in_game("victim"));
        assert_eq!(ledger.forfeited_total(), 0);
    }

    #[tokio::test]
    async fn test_killerless_death_forfeits() {
        let provider = Arc::new(MemoryBalanceProvider::new(1000));
        let ledger = ledger_with(provider);

        assert_ok!(ledger.join("solo", 1).await);
        let settlement = assert_ok!(ledger.kill_transfer(("solo", 1), None));
        assert_eq!(settlement.forfeited, 100);
        assert!(settlement.killer.is_none());
        assert_eq!(ledger.forfeited_total(), 100);
        assert_eq!(ledger.total_pot(), 0);
    }

    #[tokio::test]
    async fn test_same_identity_kill_is_killerless() {
        let provider = Arc::new(MemoryBalanceProvider::new(1000));
        let ledger = ledger_with(provider);

        assert_ok!(ledger.join("twin", 1).await);
        let settlement = assert_ok!(ledger.kill_transfer(("twin", 1), Some(("twin", 1))));
        assert_eq!(settlement.forfeited, 100);
        assert_eq!(settlement.transferred, 0);
    }

    #[tokio::test]
    async fn test_kill_transfer_contended_changes_nothing() {
        let provider = Arc::new(MemoryBalanceProvider::new(1000));
        let ledger = ledger_with(provider);

        assert_ok!(ledger.join("a", 1).await);
        assert_ok!(ledger.join("b", 2).await);

        let held = ledger.locks().try_acquire("b").unwrap();
        assert_eq!(
            ledger.kill_transfer(("a", 1), Some(("b", 2))),
            Err(LedgerError::Contended)
        );
        assert_eq!(ledger.stake("a").map(|s| s.pot), Some(100));
        assert_eq!(ledger.stake("b").map(|s| s.pot), Some(100));
        // The victim's lock was not left behind
        assert!(!ledger.locks().is_held("a"));
        drop(held);

        assert_ok!(ledger.kill_transfer(("a", 1), Some(("b", 2))));
        assert_eq!(ledger.stake("b").map(|s| s.pot), Some(200));
    }

    #[tokio::test]
    async fn test_join_while_locked_is_busy() {
        let provider = Arc::new(MemoryBalanceProvider::new(1000));
        let ledger = ledger_with(provider.clone());

        let held = ledger.locks().try_acquire("hank").unwrap();
        assert_eq!(ledger.join("hank", 1).await, Err(LedgerError::Contended));
        assert_eq!(ledger.cash_out("hank", 1).await, Err(LedgerError::Contended));
        drop(held);

        assert_ok!(ledger.join("hank", 1).await);
        assert_eq!(provider.balance("hank"), 900);
    }

    #[tokio::test]
    async fn test_stale_session_is_replaced() {
        let provider = Arc::new(MemoryBalanceProvider::new(1000));
        let ledger = ledger_with(provider);

        assert_ok!(ledger.join("ivy", 1).await);
        let stake = assert_ok!(ledger.join("ivy", 2).await);
        // The stale session's pot is paid back before the new fee is taken
        assert_eq!(stake, Stake { wallet_balance: 900, pot: 100 });
        assert_eq!(ledger.session_stake("ivy", 2), Some(stake));
        assert_eq!(ledger.session_stake("ivy", 1), None);
        assert_eq!(ledger.forfeited_total(), 0);
    }

    #[tokio::test]
    async fn test_refund_after_replacement_loses_nothing() {
        let provider = Arc::new(MemoryBalanceProvider::new(1000));
        let ledger = ledger_with(provider.clone());

        // Session 1 paid its fee but left before it could be refunded, and
        // session 2 took the identity first
        assert_ok!(ledger.join("jade", 1).await);
        assert_ok!(ledger.join("jade", 2).await);
        assert_eq!(provider.balance("jade"), 900);

        assert_eq!(ledger.cash_out("jade", 1).await, Err(LedgerError::NotInGame));
        assert_eq!(ledger.close_account("jade", 1), None);

        let cash_out = assert_ok!(ledger.cash_out("jade", 2).await);
        assert_eq!(cash_out.stake.wallet_balance, 1000);
        assert_eq!(provider.balance("jade"), 1000);
        assert_eq!(ledger.forfeited_total(), 0);
    }

    #[tokio::test]
    async fn test_stale_pot_counts_towards_fee() {
        let provider = Arc::new(MemoryBalanceProvider::new(0));
        provider.set_balance("kai", 100);
        let ledger = ledger_with(provider.clone());

        assert_ok!(ledger.join("kai", 1).await);
        assert_eq!(provider.balance("kai"), 0);

        let stake = assert_ok!(ledger.join("kai", 2).await);
        assert_eq!(stake, Stake { wallet_balance: 0, pot: 100 });
        assert_eq!(ledger.total_pot(), 100);
    }

    #[tokio::test]
    async fn test_close_account() {
        let provider = Arc::new(MemoryBalanceProvider::new(1000));
        let ledger = ledger_with(provider);

        assert_ok!(ledger.join("jo", 1).await);
        assert_eq!(ledger.close_account("jo", 2), None);
        assert!(ledger.in_game("jo"));

        assert_eq!(ledger.close_account("jo", 1), Some(100));
        assert!(!ledger.in_game("jo"));
        assert_eq!(ledger.forfeited_total(), 100);
    }

    #[tokio::test]
    async fn test_close_during_cash_out_is_finalised() {
        let provider =
            Arc::new(MemoryBalanceProvider::new(1000).with_latency(Duration::from_millis(50)));
        let ledger = Arc::new(ledger_with(provider.clone()));

        assert_ok!(ledger.join("kim", 1).await);

        let task = {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move { ledger.cash_out("kim", 1).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Cash-out holds the lock: close only marks the account
        assert!(ledger.locks().is_held("kim"));
        assert_eq!(ledger.close_account("kim", 1), None);

        let result = assert_ok!(task.await.unwrap());
        assert_eq!(result.cashed_out, 100);
        assert_eq!(provider.balance("kim"), 1000);
        assert!(!ledger.in_game("kim"));
        assert_eq!(ledger.forfeited_total(), 0);
        assert!(ledger.locks().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_joins_same_identity() {
        let provider =
            Arc::new(MemoryBalanceProvider::new(1000).with_latency(Duration::from_millis(20)));
        let ledger = Arc::new(ledger_with(provider.clone()));

        let first = {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move { ledger.join("lee", 1).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = ledger.join("lee", 2).await;

        assert_eq!(second, Err(LedgerError::Contended));
        assert_ok!(first.await.unwrap());
        // Fee debited exactly once
        assert_eq!(provider.balance("lee"), 900);
    }

    #[test]
    fn test_lock_table_order_and_cleanup() {
        let table = LockTable::new();
        {
            let guards = table.try_acquire_all(&["zed", "amy", "zed"]).unwrap();
            let names: Vec<&str> = guards.iter().map(|g| g.user()).collect();
            assert_eq!(names, vec!["amy", "zed"]);
            assert!(table.is_held("amy"));
            assert!(table.try_acquire("zed").is_none());
            assert!(table.try_acquire_all(&["bob", "amy"]).is_none());
        }
        assert!(!table.is_held("amy"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_failure_reason_mapping() {
        assert_eq!(FailureReason::from(&LedgerError::Contended), FailureReason::Busy);
        assert_eq!(
            FailureReason::from(&LedgerError::Provider(ProviderError::Unavailable)),
            FailureReason::ProviderUnavailable
        );
    }
}
