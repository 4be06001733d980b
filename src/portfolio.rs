use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::{Holding, HoldingValuation, Portfolio};
use crate::money;
use crate::oracle::PriceOracle;
use crate::settlement::{run_unit, DEFAULT_MAX_RETRIES};
use crate::store::LedgerStore;

/// Values an account's holdings at current oracle prices.
pub struct PortfolioValuator {
    store: Arc<dyn LedgerStore>,
    oracle: Arc<dyn PriceOracle>,
}

impl PortfolioValuator {
    pub fn new(store: Arc<dyn LedgerStore>, oracle: Arc<dyn PriceOracle>) -> Self {
        Self { store, oracle }
    }

    pub async fn get_portfolio(&self, account_id: Uuid) -> Result<Portfolio, LedgerError> {
        // Read everything up front; the unit is gone before the first price lookup.
        let (cash_balance, holdings, names) = self.load(account_id)?;

        let mut valued = Vec::with_capacity(holdings.len());
        let mut excluded = Vec::new();
        let mut total_value = Decimal::ZERO;
        let mut total_cost_basis = Decimal::ZERO;

        for holding in holdings {
            let quote = match self.oracle.get_price(&holding.symbol).await {
                Ok(quote) => quote,
                Err(e) => {
                    tracing::warn!(
                        "Leaving {} out of portfolio {}: {}",
                        holding.symbol,
                        account_id,
                        e
                    );
                    excluded.push(holding.symbol);
                    continue;
                }
            };

            let out_of_range =
                || LedgerError::AmountOutOfRange(format!("{} in {}", holding.symbol, account_id));
            let market_value =
                money::notional(quote.price, holding.shares).ok_or_else(out_of_range)?;
            let cost_basis = holding.cost_basis().ok_or_else(out_of_range)?;
            let gain_loss = market_value
                .checked_sub(cost_basis)
                .ok_or_else(out_of_range)?;
            total_value = total_value
                .checked_add(market_value)
                .ok_or_else(out_of_range)?;
            total_cost_basis = total_cost_basis
                .checked_add(cost_basis)
                .ok_or_else(out_of_range)?;

            // Day change against the previous close, when the catalog knows it
            let day_change = quote
                .previous_close
                .map(|previous| (quote.price - previous, previous));

            valued.push(HoldingValuation {
                company_name: names.get(&holding.symbol).cloned(),
                shares: holding.shares,
                average_buy_price: holding.average_buy_price,
                current_price: quote.price,
                market_value: money::display(market_value),
                cost_basis: money::display(cost_basis),
                gain_loss: money::display(gain_loss),
                gain_loss_percent: money::display(money::percent_of(gain_loss, cost_basis)),
                day_change: day_change.map(|(change, _)| money::display(change)),
                day_change_percent: day_change
                    .map(|(change, previous)| money::display(money::percent_of(change, previous))),
                symbol: holding.symbol,
            });
        }

        let total_gain_loss = total_value.checked_sub(total_cost_basis).ok_or_else(|| {
            LedgerError::AmountOutOfRange(format!("portfolio {}", account_id))
        })?;
        Ok(Portfolio {
            account_id,
            cash_balance: money::display(cash_balance),
            holdings: valued,
            total_value: money::display(total_value),
            total_cost_basis: money::display(total_cost_basis),
            total_gain_loss: money::display(total_gain_loss),
            total_gain_loss_percent: money::display(money::percent_of(
                total_gain_loss,
                total_cost_basis,
            )),
            excluded,
        })
    }

    fn load(
        &self,
        account_id: Uuid,
    ) -> Result<(Decimal, Vec<Holding>, HashMap<String, String>), LedgerError> {
        run_unit(self.store.as_ref(), DEFAULT_MAX_RETRIES, |tx| {
            let account = tx
                .find_account(account_id)?
                .ok_or(LedgerError::AccountNotFound(account_id))?;
            let holdings = tx.list_holdings(account_id)?;
            let names = tx
                .list_stocks()?
                .into_iter()
                .map(|stock| (stock.symbol, stock.company_name))
                .collect();
            Ok((account.balance, holdings, names))
        })
    }
}
