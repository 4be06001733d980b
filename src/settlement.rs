//! Trade settlement: validates an order and applies its balance, holding and
//! transaction-log effects as one unit of work against the ledger.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::{
    normalize_symbol, Holding, NewTransaction, TradeOrder, TradeSide, Transaction,
    TransactionView,
};
use crate::money;
use crate::store::{LedgerStore, LedgerTx};

/// Extra attempts made after a unit loses a write conflict.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Run `work` inside a fresh unit and commit it, starting over when the unit
/// loses a write conflict. Gives up after `max_retries` extra attempts.
pub(crate) fn run_unit<T, F>(
    store: &dyn LedgerStore,
    max_retries: u32,
    mut work: F,
) -> Result<T, LedgerError>
where
    F: FnMut(&mut dyn LedgerTx) -> Result<T, LedgerError>,
{
    let mut attempt = 0;
    loop {
        match attempt_unit(store, &mut work) {
            Err(LedgerError::ConcurrencyConflict(what)) if attempt < max_retries => {
                attempt += 1;
                tracing::warn!("Write conflict on {}, retrying ({}/{})", what, attempt, max_retries);
            }
            other => return other,
        }
    }
}

fn attempt_unit<T, F>(store: &dyn LedgerStore, work: &mut F) -> Result<T, LedgerError>
where
    F: FnMut(&mut dyn LedgerTx) -> Result<T, LedgerError>,
{
    let mut tx = store.begin()?;
    let value = work(&mut *tx)?;
    tx.commit()?;
    Ok(value)
}

pub struct SettlementEngine {
    store: Arc<dyn LedgerStore>,
    max_retries: u32,
}

impl SettlementEngine {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Buy `quantity` shares of `symbol` at the stock's current price.
    pub fn execute_buy(
        &self,
        account_id: Uuid,
        symbol: &str,
        quantity: i64,
    ) -> Result<Transaction, LedgerError> {
        self.execute(&TradeOrder {
            account_id,
            symbol: symbol.to_string(),
            side: TradeSide::Buy,
            quantity,
            notes: None,
        })
    }

    /// Sell `quantity` shares of `symbol` at the stock's current price.
    pub fn execute_sell(
        &self,
        account_id: Uuid,
        symbol: &str,
        quantity: i64,
    ) -> Result<Transaction, LedgerError> {
        self.execute(&TradeOrder {
            account_id,
            symbol: symbol.to_string(),
            side: TradeSide::Sell,
            quantity,
            notes: None,
        })
    }

    /// Settle one order. Either every effect is committed or none is.
    pub fn execute(&self, order: &TradeOrder) -> Result<Transaction, LedgerError> {
        if order.quantity <= 0 {
            tracing::warn!("Rejected {} with quantity {}", order.side, order.quantity);
            return Err(LedgerError::InvalidQuantity(order.quantity));
        }
        let symbol = normalize_symbol(&order.symbol);
        tracing::info!(
            "Executing {} {} x{} for account {}",
            order.side,
            symbol,
            order.quantity,
            order.account_id
        );

        let result = run_unit(self.store.as_ref(), self.max_retries, |tx| {
            settle(tx, order, &symbol)
        });
        match &result {
            Ok(transaction) => tracing::info!(
                "Settled {} {} x{} @ {} (transaction {})",
                transaction.side,
                transaction.symbol,
                transaction.quantity,
                transaction.price,
                transaction.id
            ),
            Err(LedgerError::Store(e)) => tracing::error!("Error settling trade: {}", e),
            Err(e) => tracing::warn!("Rejected {} {}: {}", order.side, symbol, e),
        }
        result
    }

    /// All transactions of an account, newest first.
    pub fn transaction_history(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<TransactionView>, LedgerError> {
        self.history_where(account_id, |_| true)
    }

    /// Transactions of an account in one stock, newest first.
    pub fn transactions_for_symbol(
        &self,
        account_id: Uuid,
        symbol: &str,
    ) -> Result<Vec<TransactionView>, LedgerError> {
        let symbol = normalize_symbol(symbol);
        self.history_where(account_id, |t| t.symbol == symbol)
    }

    /// Transactions with `from <= timestamp <= to`, newest first.
    pub fn transactions_between(
        &self,
        account_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TransactionView>, LedgerError> {
        self.history_where(account_id, |t| t.timestamp >= from && t.timestamp <= to)
    }

    fn history_where<P>(
        &self,
        account_id: Uuid,
        keep: P,
    ) -> Result<Vec<TransactionView>, LedgerError>
    where
        P: Fn(&Transaction) -> bool,
    {
        run_unit(self.store.as_ref(), self.max_retries, |tx| {
            if tx.find_account(account_id)?.is_none() {
                return Err(LedgerError::AccountNotFound(account_id));
            }
            let names: HashMap<String, String> = tx
                .list_stocks()?
                .into_iter()
                .map(|stock| (stock.symbol, stock.company_name))
                .collect();
            tx.list_transactions(account_id)?
                .into_iter()
                .filter(|t| keep(t))
                .map(|t| -> Result<TransactionView, LedgerError> {
                    let total = t.total().ok_or_else(|| {
                        LedgerError::AmountOutOfRange(format!("transaction {}", t.id))
                    })?;
                    Ok(TransactionView {
                        id: t.id,
                        company_name: names.get(&t.symbol).cloned(),
                        total: money::display(total),
                        symbol: t.symbol,
                        side: t.side,
                        quantity: t.quantity,
                        price: t.price,
                        timestamp: t.timestamp,
                        notes: t.notes,
                    })
                })
                .collect()
        })
    }
}

fn settle(
    tx: &mut dyn LedgerTx,
    order: &TradeOrder,
    symbol: &str,
) -> Result<Transaction, LedgerError> {
    let mut account = tx
        .find_account(order.account_id)?
        .ok_or(LedgerError::AccountNotFound(order.account_id))?;
    let stock = tx
        .find_stock(symbol)?
        .ok_or_else(|| LedgerError::StockNotFound(symbol.to_string()))?;
    let price = stock
        .tradable_price()
        .ok_or_else(|| LedgerError::InvalidPrice {
            symbol: symbol.to_string(),
            price: stock.current_price,
        })?;

    let now = Utc::now();
    let out_of_range = || {
        LedgerError::AmountOutOfRange(format!(
            "{} {} x{} @ {}",
            order.side, symbol, order.quantity, price
        ))
    };
    let amount = money::notional(price, order.quantity).ok_or_else(out_of_range)?;
    let existing = tx.find_holding(order.account_id, symbol)?;

    match order.side {
        TradeSide::Buy => {
            if account.balance < amount {
                return Err(LedgerError::InsufficientFunds {
                    required: amount,
                    available: account.balance,
                });
            }
            let holding = match existing {
                Some(mut holding) => {
                    let shares = holding
                        .shares
                        .checked_add(order.quantity)
                        .ok_or_else(out_of_range)?;
                    holding.average_buy_price = money::weighted_average(
                        holding.average_buy_price,
                        holding.shares,
                        price,
                        order.quantity,
                    )
                    .ok_or_else(out_of_range)?;
                    holding.shares = shares;
                    holding.updated_at = now;
                    holding
                }
                None => Holding {
                    account_id: order.account_id,
                    symbol: symbol.to_string(),
                    shares: order.quantity,
                    average_buy_price: money::normalize_price(price),
                    created_at: now,
                    updated_at: now,
                },
            };
            account.balance = account
                .balance
                .checked_sub(amount)
                .ok_or_else(out_of_range)?;
            tx.save_holding(&holding)?;
        }
        TradeSide::Sell => {
            let owned = existing.as_ref().map_or(0, |h| h.shares);
            let mut holding = match existing {
                Some(holding) if holding.shares >= order.quantity => holding,
                _ => {
                    return Err(LedgerError::InsufficientShares {
                        symbol: symbol.to_string(),
                        owned,
                        requested: order.quantity,
                    })
                }
            };
            account.balance = account
                .balance
                .checked_add(amount)
                .ok_or_else(out_of_range)?;
            holding.shares -= order.quantity;
            if holding.shares == 0 {
                tx.delete_holding(order.account_id, symbol)?;
            } else {
                holding.updated_at = now;
                tx.save_holding(&holding)?;
            }
        }
    }

    account.updated_at = now;
    tx.save_account(&account)?;
    let transaction = tx.append_transaction(NewTransaction {
        account_id: order.account_id,
        symbol: symbol.to_string(),
        side: order.side,
        quantity: order.quantity,
        price,
        notes: order.notes.clone(),
    })?;
    Ok(transaction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Account, Stock};
    use crate::store::{MemoryLedger, StoreError};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn set_price(store: &dyn LedgerStore, symbol: &str, price: Option<Decimal>) {
        let mut tx = store.begin().unwrap();
        let mut stock = tx
            .find_stock(symbol)
            .unwrap()
            .unwrap_or_else(|| Stock::new(symbol, &format!("{} Corp", symbol), Utc::now()));
        stock.current_price = price;
        tx.save_stock(&stock).unwrap();
        tx.commit().unwrap();
    }

    fn setup(balance: Decimal) -> (Arc<MemoryLedger>, SettlementEngine, Uuid) {
        let store = Arc::new(MemoryLedger::new());
        let account = Account::open(balance, Utc::now());
        let mut tx = store.begin().unwrap();
        tx.insert_account(&account).unwrap();
        tx.commit().unwrap();
        set_price(store.as_ref(), "AAPL", Some(dec!(150)));
        let engine = SettlementEngine::new(store.clone());
        (store, engine, account.id)
    }

    fn snapshot(store: &dyn LedgerStore, id: Uuid) -> (Decimal, Vec<Holding>, usize) {
        let mut tx = store.begin().unwrap();
        let balance = tx.find_account(id).unwrap().unwrap().balance;
        let holdings = tx.list_holdings(id).unwrap();
        let count = tx.list_transactions(id).unwrap().len();
        (balance, holdings, count)
    }

    #[test]
    fn buy_then_sell_round_trip() {
        let (store, engine, id) = setup(dec!(10000.00));

        let buy = engine.execute_buy(id, "aapl", 10).unwrap();
        assert_eq!(buy.symbol, "AAPL");
        assert_eq!(buy.price, dec!(150));
        let (balance, holdings, _) = snapshot(store.as_ref(), id);
        assert_eq!(balance, dec!(8500.00));
        assert_eq!(holdings[0].shares, 10);
        assert_eq!(holdings[0].average_buy_price, dec!(150));

        set_price(store.as_ref(), "AAPL", Some(dec!(160)));
        engine.execute_sell(id, "AAPL", 4).unwrap();
        let (balance, holdings, _) = snapshot(store.as_ref(), id);
        assert_eq!(balance, dec!(9140.00));
        assert_eq!(holdings[0].shares, 6);
        assert_eq!(holdings[0].average_buy_price, dec!(150));

        set_price(store.as_ref(), "AAPL", Some(dec!(155)));
        engine.execute_sell(id, "AAPL", 6).unwrap();
        let (balance, holdings, count) = snapshot(store.as_ref(), id);
        assert_eq!(balance, dec!(10070.00));
        assert!(holdings.is_empty());
        assert_eq!(count, 3);
    }

    #[test]
    fn second_lot_moves_the_average() {
        let (store, engine, id) = setup(dec!(10000));
        set_price(store.as_ref(), "AAPL", Some(dec!(100)));
        engine.execute_buy(id, "AAPL", 10).unwrap();
        set_price(store.as_ref(), "AAPL", Some(dec!(200)));
        engine.execute_buy(id, "AAPL", 10).unwrap();

        let (balance, holdings, _) = snapshot(store.as_ref(), id);
        assert_eq!(balance, dec!(7000));
        assert_eq!(holdings[0].shares, 20);
        assert_eq!(holdings[0].average_buy_price, dec!(150));
    }

    #[test]
    fn insufficient_funds_changes_nothing() {
        let (store, engine, id) = setup(dec!(1000));
        let before = snapshot(store.as_ref(), id);

        let err = engine.execute_buy(id, "AAPL", 10).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientFunds { required, available }
                if required == dec!(1500) && available == dec!(1000)
        ));
        assert_eq!(snapshot(store.as_ref(), id), before);
    }

    #[test]
    fn overselling_changes_nothing() {
        let (store, engine, id) = setup(dec!(10000));
        engine.execute_buy(id, "AAPL", 3).unwrap();
        let before = snapshot(store.as_ref(), id);

        let err = engine.execute_sell(id, "AAPL", 5).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientShares { owned: 3, requested: 5, .. }
        ));
        assert_eq!(snapshot(store.as_ref(), id), before);

        set_price(store.as_ref(), "MSFT", Some(dec!(400)));
        let err = engine.execute_sell(id, "MSFT", 1).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientShares { owned: 0, .. }));
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let (store, engine, id) = setup(dec!(10000));

        assert!(matches!(
            engine.execute_buy(id, "AAPL", 0),
            Err(LedgerError::InvalidQuantity(0))
        ));
        assert!(matches!(
            engine.execute_sell(id, "AAPL", -2),
            Err(LedgerError::InvalidQuantity(-2))
        ));
        assert!(matches!(
            engine.execute_buy(Uuid::new_v4(), "AAPL", 1),
            Err(LedgerError::AccountNotFound(_))
        ));
        assert!(matches!(
            engine.execute_buy(id, "NOPE", 1),
            Err(LedgerError::StockNotFound(s)) if s == "NOPE"
        ));

        set_price(store.as_ref(), "ZERO", Some(Decimal::ZERO));
        assert!(matches!(
            engine.execute_buy(id, "ZERO", 1),
            Err(LedgerError::InvalidPrice { .. })
        ));
        set_price(store.as_ref(), "NONE", None);
        assert!(matches!(
            engine.execute_buy(id, "NONE", 1),
            Err(LedgerError::InvalidPrice { price: None, .. })
        ));
    }

    #[test]
    fn history_is_joined_and_filterable() {
        let (store, engine, id) = setup(dec!(10000));
        set_price(store.as_ref(), "MSFT", Some(dec!(400)));
        engine
            .execute(&TradeOrder {
                account_id: id,
                symbol: "AAPL".to_string(),
                side: TradeSide::Buy,
                quantity: 2,
                notes: Some("first".to_string()),
            })
            .unwrap();
        engine.execute_buy(id, "MSFT", 1).unwrap();

        let history = engine.transaction_history(id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].symbol, "MSFT");
        assert_eq!(history[0].company_name.as_deref(), Some("MSFT Corp"));
        assert_eq!(history[1].total, dec!(300.00));
        assert_eq!(history[1].notes.as_deref(), Some("first"));

        let aapl = engine.transactions_for_symbol(id, "aapl").unwrap();
        assert_eq!(aapl.len(), 1);

        let now = Utc::now();
        let window = engine
            .transactions_between(id, now - chrono::Duration::hours(1), now)
            .unwrap();
        assert_eq!(window.len(), 2);
        let empty = engine
            .transactions_between(id, now + chrono::Duration::hours(1), now + chrono::Duration::hours(2))
            .unwrap();
        assert!(empty.is_empty());

        assert!(matches!(
            engine.transaction_history(Uuid::new_v4()),
            Err(LedgerError::AccountNotFound(_))
        ));
    }

    #[test]
    fn share_count_overflow_is_rejected() {
        let (store, engine, id) = setup(dec!(10000));
        let now = Utc::now();
        let mut tx = store.begin().unwrap();
        tx.save_holding(&Holding {
            account_id: id,
            symbol: "AAPL".to_string(),
            shares: i64::MAX - 1,
            average_buy_price: dec!(0.0001),
            created_at: now,
            updated_at: now,
        })
        .unwrap();
        tx.commit().unwrap();
        let before = snapshot(store.as_ref(), id);

        assert!(matches!(
            engine.execute_buy(id, "AAPL", 2),
            Err(LedgerError::AmountOutOfRange(_))
        ));
        assert_eq!(snapshot(store.as_ref(), id), before);
    }

    #[derive(Clone, Copy, PartialEq, Debug)]
    enum Step {
        SaveHolding,
        SaveAccount,
        AppendTransaction,
        Commit,
    }

    /// A memory ledger whose units fail at one chosen step.
    struct FailingStore {
        inner: Arc<MemoryLedger>,
        step: Step,
    }

    struct FailingTx<'a> {
        inner: Box<dyn LedgerTx + 'a>,
        step: Step,
    }

    impl FailingTx<'_> {
        fn reach(&self, step: Step) -> Result<(), StoreError> {
            if self.step == step {
                return Err(StoreError::Sqlite(rusqlite::Error::InvalidQuery));
            }
            Ok(())
        }
    }

    impl LedgerStore for FailingStore {
        fn begin(&self) -> Result<Box<dyn LedgerTx + '_>, StoreError> {
            Ok(Box::new(FailingTx {
                inner: self.inner.begin()?,
                step: self.step,
            }))
        }
    }

    impl LedgerTx for FailingTx<'_> {
        fn find_account(&mut self, id: Uuid) -> Result<Option<Account>, StoreError> {
            self.inner.find_account(id)
        }

        fn insert_account(&mut self, account: &Account) -> Result<(), StoreError> {
            self.inner.insert_account(account)
        }

        fn save_account(&mut self, account: &Account) -> Result<(), StoreError> {
            self.reach(Step::SaveAccount)?;
            self.inner.save_account(account)
        }

        fn find_stock(&mut self, symbol: &str) -> Result<Option<Stock>, StoreError> {
            self.inner.find_stock(symbol)
        }

        fn save_stock(&mut self, stock: &Stock) -> Result<(), StoreError> {
            self.inner.save_stock(stock)
        }

        fn list_stocks(&mut self) -> Result<Vec<Stock>, StoreError> {
            self.inner.list_stocks()
        }

        fn find_holding(
            &mut self,
            account_id: Uuid,
            symbol: &str,
        ) -> Result<Option<Holding>, StoreError> {
            self.inner.find_holding(account_id, symbol)
        }

        fn list_holdings(&mut self, account_id: Uuid) -> Result<Vec<Holding>, StoreError> {
            self.inner.list_holdings(account_id)
        }

        fn save_holding(&mut self, holding: &Holding) -> Result<(), StoreError> {
            self.reach(Step::SaveHolding)?;
            self.inner.save_holding(holding)
        }

        fn delete_holding(&mut self, account_id: Uuid, symbol: &str) -> Result<(), StoreError> {
            self.inner.delete_holding(account_id, symbol)
        }

        fn append_transaction(&mut self, entry: NewTransaction) -> Result<Transaction, StoreError> {
            self.reach(Step::AppendTransaction)?;
            self.inner.append_transaction(entry)
        }

        fn list_transactions(&mut self, account_id: Uuid) -> Result<Vec<Transaction>, StoreError> {
            self.inner.list_transactions(account_id)
        }

        fn commit(self: Box<Self>) -> Result<(), StoreError> {
            self.reach(Step::Commit)?;
            self.inner.commit()
        }
    }

    #[test]
    fn failure_inside_the_unit_rolls_everything_back() {
        let (store, engine, id) = setup(dec!(10000));
        engine.execute_buy(id, "AAPL", 4).unwrap();
        let before = snapshot(store.as_ref(), id);

        let cases = [
            (Step::SaveHolding, TradeSide::Buy, 2),
            (Step::SaveHolding, TradeSide::Sell, 1),
            (Step::SaveAccount, TradeSide::Buy, 2),
            (Step::SaveAccount, TradeSide::Sell, 4),
            (Step::AppendTransaction, TradeSide::Buy, 2),
            (Step::AppendTransaction, TradeSide::Sell, 4),
            (Step::Commit, TradeSide::Buy, 2),
            (Step::Commit, TradeSide::Sell, 4),
        ];
        for (step, side, quantity) in cases {
            let failing = SettlementEngine::new(Arc::new(FailingStore {
                inner: store.clone(),
                step,
            }));
            let result = failing.execute(&TradeOrder {
                account_id: id,
                symbol: "AAPL".to_string(),
                side,
                quantity,
                notes: None,
            });
            assert!(
                matches!(result, Err(LedgerError::Store(StoreError::Sqlite(_)))),
                "{:?} {} x{}",
                step,
                side,
                quantity
            );
            assert_eq!(
                snapshot(store.as_ref(), id),
                before,
                "{:?} {} x{}",
                step,
                side,
                quantity
            );
        }

        // The untouched store still settles normally.
        engine.execute_sell(id, "AAPL", 4).unwrap();
        assert!(snapshot(store.as_ref(), id).1.is_empty());
    }

    /// Fails the first `failures` units with a write conflict.
    struct FlakyStore {
        inner: MemoryLedger,
        failures: AtomicU32,
    }

    impl LedgerStore for FlakyStore {
        fn begin(&self) -> Result<Box<dyn LedgerTx + '_>, StoreError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Conflict("Account".to_string()));
            }
            self.inner.begin()
        }
    }

    fn flaky(failures: u32) -> (Arc<FlakyStore>, Uuid) {
        let inner = MemoryLedger::new();
        let account = Account::open(dec!(1000), Utc::now());
        let mut tx = inner.begin().unwrap();
        tx.insert_account(&account).unwrap();
        tx.save_stock(&{
            let mut stock = Stock::new("AAPL", "Apple Inc.", Utc::now());
            stock.current_price = Some(dec!(10));
            stock
        })
        .unwrap();
        tx.commit().unwrap();
        (
            Arc::new(FlakyStore {
                inner,
                failures: AtomicU32::new(failures),
            }),
            account.id,
        )
    }

    #[test]
    fn conflicts_are_retried() {
        let (store, id) = flaky(2);
        let engine = SettlementEngine::new(store.clone()).with_max_retries(3);
        engine.execute_buy(id, "AAPL", 1).unwrap();
        assert_eq!(snapshot(store.as_ref(), id).0, dec!(990));
    }

    #[test]
    fn conflicts_surface_after_retries_run_out() {
        let (store, id) = flaky(5);
        let engine = SettlementEngine::new(store.clone()).with_max_retries(2);
        assert!(matches!(
            engine.execute_buy(id, "AAPL", 1),
            Err(LedgerError::ConcurrencyConflict(_))
        ));
        assert_eq!(store.failures.load(Ordering::SeqCst), 2);
        assert_eq!(snapshot(store.as_ref(), id).0, dec!(1000));
    }
}
